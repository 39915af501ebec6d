// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Live in-memory mirror of Kubernetes cluster resources.
//!
//! `kubemirror` maintains one cached node per observable object in a
//! cluster, kept current through a long-lived streaming watch per kind, and
//! answers the queries a declarative reconciliation engine needs: top-level
//! resources per namespace, owner-reference hierarchy walks, and the live
//! counterparts of a controller's desired objects.
//!
//! The entry point is [`ClusterCache`]; it consumes cluster access through
//! the [`ClusterApi`] capability trait, implemented for real clusters by
//! [`KubeClusterApi`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use kubemirror::{ClusterCache, ClusterConfig, EventHandlers, KubeClusterApi, Settings};
//!
//! # async fn run(config: kube::Config) -> anyhow::Result<()> {
//! let cache = ClusterCache::new(
//!     Arc::new(KubeClusterApi::new()),
//!     ClusterConfig::new(config),
//!     Vec::new(),
//!     Settings::default(),
//!     EventHandlers::default(),
//! );
//! cache.ensure_synced().await?;
//! let roots = cache.namespace_top_level_resources("default").await;
//! println!("{} top-level resources", roots.len());
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod provider;
pub mod resource;
pub mod sync;

pub use cluster::{
    ClusterCache, ClusterInfo, EventHandlers, EventType, HealthOverride, OnEventHandler,
    OnPopulateResourceInfoHandler, OnResourceUpdatedHandler, Settings, SettingsCallback, SyncError,
};
pub use provider::{
    ApiResourceInfo, ClusterApi, ClusterConfig, KubeClusterApi, ResourceClient, ResourceFilter,
    is_gone, is_not_found,
};
pub use resource::{GroupKind, Resource, ResourceKey, ResourceRef};
