// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Live in-memory mirror of cluster resources.
//!
//! [`ClusterCache`] keeps one node per observable object in the cluster,
//! maintained by a long-lived watch per kind, and answers the hierarchy and
//! reconciliation queries the surrounding engine needs. A single cache-wide
//! mutex guards the indices; per-kind watch tasks apply streamed changes
//! under it and restart on failure at a fixed interval.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use arc_swap::ArcSwap;
use futures::{FutureExt, StreamExt};
use kube::api::{DynamicObject, WatchEvent};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::provider::{
    self, ApiResourceInfo, ClusterApi, ClusterConfig, ResourceClient, ResourceFilter,
};
use crate::resource::{self, GroupKind, Resource, ResourceKey};

/// How long a successful sync stays fresh.
const CLUSTER_SYNC_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
/// How long a failed sync stays fresh (retry backoff).
const CLUSTER_RETRY_TIMEOUT: Duration = Duration::from_secs(10);
/// Fixed interval between watch restart attempts.
const WATCH_RESOURCES_RETRY_TIMEOUT: Duration = Duration::from_secs(1);
/// Bounded parallelism for listing kinds and resolving managed objects.
const LIST_PARALLELISM: usize = 16;

/// Type of a change streamed by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// Opaque hook consulted by external health assessors; carried through the
/// cache but never inspected by it.
pub type HealthOverride = Arc<dyn Any + Send + Sync>;

/// Invoked with the raw object before the cache lock is taken.
pub type OnEventHandler = Arc<dyn Fn(EventType, &DynamicObject) + Send + Sync>;

/// Computes the opaque per-node payload and whether to retain the full
/// object; the flag argument is true when the node has no owners.
pub type OnPopulateResourceInfoHandler =
    Arc<dyn Fn(&DynamicObject, bool) -> (Option<Arc<dyn Any + Send + Sync>>, bool) + Send + Sync>;

/// Invoked under the cache lock after every effective index change; the
/// first argument is absent for deletions.
pub type OnResourceUpdatedHandler = Arc<
    dyn Fn(Option<&Arc<Resource>>, Option<&Arc<Resource>>, &HashMap<ResourceKey, Arc<Resource>>)
        + Send
        + Sync,
>;

/// Out-of-band callbacks, each independently optional.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub on_event: Option<OnEventHandler>,
    pub on_populate_resource_info: Option<OnPopulateResourceInfoHandler>,
    pub on_resource_updated: Option<OnResourceUpdatedHandler>,
}

/// Cache behavior knobs supplied at construction and replaceable through
/// [`ClusterCache::invalidate`].
#[derive(Clone, Default)]
pub struct Settings {
    /// Kinds for which this returns `false` are not cached or watched.
    pub resources_filter: Option<ResourceFilter>,
    pub resource_health_override: Option<HealthOverride>,
}

/// Callback applied atomically during [`ClusterCache::invalidate`].
pub type SettingsCallback = Box<
    dyn FnOnce(ClusterConfig, Vec<String>, Settings) -> (ClusterConfig, Vec<String>, Settings)
        + Send,
>;

/// The latched outcome of a failed sync; every [`ClusterCache::ensure_synced`]
/// call within the retry window returns a clone of the same error.
#[derive(Debug, Clone, Error)]
#[error("cluster sync failed: {0:#}")]
pub struct SyncError(Arc<anyhow::Error>);

impl SyncError {
    fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

/// Counts and timestamps describing the cache state.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    /// Number of kinds with a live watch.
    pub apis_count: usize,
    /// Number of cached resources.
    pub resources_count: usize,
    /// Remote identity.
    pub server: String,
    /// Remote version captured at the last successful sync.
    pub server_version: String,
    /// When the last sync attempt finished.
    pub last_cache_sync_time: Option<SystemTime>,
}

struct ApiMeta {
    namespaced: bool,
    resource_version: String,
    watch_cancel: CancellationToken,
}

struct CacheState {
    config: ClusterConfig,
    namespaces: Vec<String>,
    settings: Settings,
    apis: HashMap<GroupKind, ApiMeta>,
    resources: HashMap<ResourceKey, Arc<Resource>>,
    ns_index: HashMap<String, HashMap<ResourceKey, Arc<Resource>>>,
    sync_time: Option<SystemTime>,
    sync_error: Option<SyncError>,
}

struct Inner {
    provider: Arc<dyn ClusterApi>,
    handlers: EventHandlers,
    server_version: ArcSwap<String>,
    state: Mutex<CacheState>,
}

/// Handle to one cluster's cache; cheap to clone.
#[derive(Clone)]
pub struct ClusterCache {
    inner: Arc<Inner>,
}

impl ClusterCache {
    pub fn new(
        provider: Arc<dyn ClusterApi>,
        config: ClusterConfig,
        namespaces: Vec<String>,
        settings: Settings,
        handlers: EventHandlers,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                handlers,
                server_version: ArcSwap::from_pointee(String::new()),
                state: Mutex::new(CacheState {
                    config,
                    namespaces,
                    settings,
                    apis: HashMap::new(),
                    resources: HashMap::new(),
                    ns_index: HashMap::new(),
                    sync_time: None,
                    sync_error: None,
                }),
            }),
        }
    }

    /// Sync the cache if it is not fresh, and return the latched outcome.
    ///
    /// A successful sync stays fresh for 24 hours, a failed one for 10
    /// seconds; within those windows this returns without doing any work.
    /// The cache-wide lock is held across the whole resync, serializing
    /// concurrent callers.
    pub async fn ensure_synced(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if Self::synced(&state) {
            return Self::latched(&state);
        }

        let result = self.sync_locked(&mut state).await;
        state.sync_time = Some(SystemTime::now());
        state.sync_error = match result {
            Ok(()) => None,
            Err(err) => {
                error!(
                    server = %state.config.host(),
                    error = %format!("{err:#}"),
                    "failed to sync cluster"
                );
                Some(SyncError::new(err))
            }
        };
        Self::latched(&state)
    }

    /// Mark the cache unsynced, cancel every watch, and clear the API table.
    ///
    /// The callback, if given, atomically replaces the connection config,
    /// namespace scope and settings before the next sync. Watchers are only
    /// signalled; this never waits for them to terminate.
    pub async fn invalidate(&self, settings_callback: Option<SettingsCallback>) {
        let mut state = self.inner.state.lock().await;
        state.sync_time = None;
        for meta in state.apis.values() {
            meta.watch_cancel.cancel();
        }
        state.apis.clear();
        if let Some(callback) = settings_callback {
            let namespaces = std::mem::take(&mut state.namespaces);
            let (config, namespaces, settings) =
                callback(state.config.clone(), namespaces, state.settings.clone());
            state.config = config;
            state.namespaces = namespaces;
            state.settings = settings;
        }
        info!(server = %state.config.host(), "invalidated cluster cache");
    }

    /// The remote's version string as captured at the last successful sync.
    pub fn server_version(&self) -> String {
        self.inner.server_version.load().as_ref().clone()
    }

    /// Whether instances of the kind are namespace-scoped.
    ///
    /// Unknown kinds default to namespaced, the safe over-approximation for
    /// managed-object reconciliation.
    pub async fn is_namespaced(&self, gk: &GroupKind) -> bool {
        let state = self.inner.state.lock().await;
        if let Some(meta) = state.apis.get(gk) {
            if !meta.namespaced {
                return false;
            }
        }
        true
    }

    /// Snapshot of every cached resource in `namespace` with no owners.
    pub async fn namespace_top_level_resources(
        &self,
        namespace: &str,
    ) -> HashMap<ResourceKey, Arc<Resource>> {
        let state = self.inner.state.lock().await;
        let mut resources = HashMap::new();
        if let Some(bucket) = state.ns_index.get(namespace) {
            for (key, node) in bucket {
                if node.owner_refs.is_empty() {
                    resources.insert(key.clone(), node.clone());
                }
            }
        }
        resources
    }

    /// Walk the ownership hierarchy rooted at `key`, depth first, within a
    /// single namespace.
    ///
    /// `action` receives each visited node together with the namespace
    /// bucket and runs under the cache lock; it must not re-enter the cache.
    /// Duplicate children sharing a uid (the same logical object exposed
    /// under multiple API groups) are collapsed to the one whose key sorts
    /// first, so repeated traversals visit the same nodes in the same order.
    /// A visited-set bounds recursion over cyclic owner graphs.
    pub async fn iterate_hierarchy<F>(&self, key: &ResourceKey, mut action: F)
    where
        F: FnMut(&Arc<Resource>, &HashMap<ResourceKey, Arc<Resource>>),
    {
        let state = self.inner.state.lock().await;
        let Some(root) = state.resources.get(key) else {
            return;
        };
        let empty = HashMap::new();
        let ns_nodes = state.ns_index.get(&key.namespace).unwrap_or(&empty);
        action(root, ns_nodes);
        let mut visited: HashSet<ResourceKey> = HashSet::new();
        visited.insert(key.clone());
        Self::iterate_children(root, ns_nodes, &mut visited, &mut action);
    }

    /// Live objects corresponding to a controller's desired objects,
    /// suitable for diffing.
    ///
    /// Seeds the result with every managed, owner-less node whose full
    /// manifest was retained, then resolves each target: cached manifests
    /// are used directly, nodes without a retained manifest and targets of
    /// unwatched kinds are fetched from the cluster, and every candidate is
    /// converted to the target's API version (falling back to a refetch when
    /// conversion fails). Objects missing from the cluster are skipped.
    pub async fn managed_live_objs<F>(
        &self,
        target_objs: &[DynamicObject],
        is_managed: F,
    ) -> Result<HashMap<ResourceKey, DynamicObject>>
    where
        F: Fn(&Resource) -> bool,
    {
        enum Candidate {
            Use(DynamicObject),
            FetchExisting { name: String, namespace: String },
            FetchTarget,
            Absent,
        }

        let state = self.inner.state.lock().await;
        let mut managed: HashMap<ResourceKey, DynamicObject> = HashMap::new();
        for (key, node) in &state.resources {
            if node.owner_refs.is_empty() && is_managed(node) {
                if let Some(manifest) = &node.manifest {
                    managed.insert(key.clone(), manifest.clone());
                }
            }
        }

        let mut work = Vec::with_capacity(target_objs.len());
        for target in target_objs {
            let key = resource::object_key(target);
            let gvk = resource::gvk_of(target);
            let candidate = if let Some(seeded) = managed.get(&key) {
                Candidate::Use(seeded.clone())
            } else if let Some(existing) = state.resources.get(&key) {
                match &existing.manifest {
                    Some(manifest) => Candidate::Use(manifest.clone()),
                    None => Candidate::FetchExisting {
                        name: existing.object_ref.name.clone(),
                        namespace: existing.object_ref.namespace.clone(),
                    },
                }
            } else if !state.apis.contains_key(&key.group_kind()) {
                Candidate::FetchTarget
            } else {
                // The kind is watched, so the object is known not to exist.
                Candidate::Absent
            };
            let target_name = target.metadata.name.clone().unwrap_or_default();
            let target_namespace = target.metadata.namespace.clone().unwrap_or_default();
            work.push((key, gvk, target_name, target_namespace, candidate));
        }

        let config = state.config.clone();
        let provider = self.inner.provider.clone();
        let mut results = futures::stream::iter(work.into_iter().map(
            |(key, gvk, target_name, target_namespace, candidate)| {
                let provider = provider.clone();
                let config = config.clone();
                async move {
                    let live = match candidate {
                        Candidate::Use(obj) => Some(obj),
                        Candidate::FetchExisting { name, namespace } => {
                            match provider.get_resource(&config, &gvk, &name, &namespace).await {
                                Ok(obj) => Some(obj),
                                Err(err) if provider::is_not_found(&err) => None,
                                Err(err) => return Err(err),
                            }
                        }
                        Candidate::FetchTarget => {
                            match provider
                                .get_resource(&config, &gvk, &target_name, &target_namespace)
                                .await
                            {
                                Ok(obj) => Some(obj),
                                Err(err) if provider::is_not_found(&err) => None,
                                Err(err) => return Err(err),
                            }
                        }
                        Candidate::Absent => None,
                    };
                    let Some(live) = live else {
                        return Ok((key, None));
                    };
                    match provider
                        .convert_to_version(&live, &gvk.group, &gvk.version)
                        .await
                    {
                        Ok(converted) => Ok((key, Some(converted))),
                        Err(err) => {
                            // Fall back to refetching at the target version.
                            warn!(
                                key = %key,
                                error = %format!("{err:#}"),
                                "failed to convert resource"
                            );
                            let name = live.metadata.name.clone().unwrap_or_default();
                            let namespace = live.metadata.namespace.clone().unwrap_or_default();
                            match provider.get_resource(&config, &gvk, &name, &namespace).await {
                                Ok(obj) => Ok((key, Some(obj))),
                                Err(err) if provider::is_not_found(&err) => Ok((key, None)),
                                Err(err) => Err(err),
                            }
                        }
                    }
                }
            },
        ))
        .buffer_unordered(LIST_PARALLELISM);

        while let Some(resolved) = results.next().await {
            let (key, obj) = resolved?;
            match obj {
                Some(obj) => {
                    managed.insert(key, obj);
                }
                None => {
                    managed.remove(&key);
                }
            }
        }
        drop(results);

        Ok(managed)
    }

    /// Counts and timestamps describing the cache state.
    pub async fn cluster_info(&self) -> ClusterInfo {
        let state = self.inner.state.lock().await;
        ClusterInfo {
            apis_count: state.apis.len(),
            resources_count: state.resources.len(),
            server: state.config.host(),
            server_version: self.server_version(),
            last_cache_sync_time: state.sync_time,
        }
    }

    fn synced(state: &CacheState) -> bool {
        let Some(sync_time) = state.sync_time else {
            return false;
        };
        let window = if state.sync_error.is_some() {
            CLUSTER_RETRY_TIMEOUT
        } else {
            CLUSTER_SYNC_TIMEOUT
        };
        match SystemTime::now().duration_since(sync_time) {
            Ok(age) => age < window,
            Err(_) => true,
        }
    }

    fn latched(state: &CacheState) -> Result<()> {
        match &state.sync_error {
            Some(err) => Err(err.clone().into()),
            None => Ok(()),
        }
    }

    async fn sync_locked(&self, state: &mut CacheState) -> Result<()> {
        let server = state.config.host();
        info!(server = %server, "start syncing cluster");

        for meta in state.apis.values() {
            meta.watch_cancel.cancel();
        }
        state.apis.clear();
        state.resources.clear();
        state.ns_index.clear();

        let version = self.inner.provider.server_version(&state.config).await?;
        self.inner.server_version.store(Arc::new(version));

        let apis = self
            .inner
            .provider
            .api_resources(&state.config, state.settings.resources_filter.clone())
            .await?;

        let mut targets = Vec::new();
        for api in &apis {
            for (client, namespace) in self.resource_clients(state, api).await? {
                targets.push((api.group_kind.clone(), client, namespace));
            }
        }

        // Kinds are listed concurrently; the loop below applies the index
        // inserts one at a time.
        let mut lists =
            futures::stream::iter(targets.into_iter().map(|(gk, client, _namespace)| {
                async move {
                    client
                        .list()
                        .await
                        .with_context(|| format!("failed to list {}", gk))
                }
            }))
            .buffer_unordered(LIST_PARALLELISM);

        while let Some(listed) = lists.next().await {
            let list = listed?;
            for obj in &list.items {
                Self::set_node(state, Arc::new(self.new_resource(obj)));
            }
        }
        drop(lists);

        self.start_missing_watches(state).await?;
        info!(server = %server, "cluster successfully synced");
        Ok(())
    }

    /// Clients for one kind, honoring the namespace scope: with no
    /// configured namespaces a single all-namespace client, otherwise one
    /// client per namespace, skipping cluster-scoped kinds entirely.
    async fn resource_clients(
        &self,
        state: &CacheState,
        api: &ApiResourceInfo,
    ) -> Result<Vec<(Box<dyn ResourceClient>, String)>> {
        let provider = &self.inner.provider;
        if state.namespaces.is_empty() {
            let client = provider.resource_client(&state.config, api, None).await?;
            return Ok(vec![(client, String::new())]);
        }
        if !api.namespaced {
            return Ok(Vec::new());
        }
        let mut clients = Vec::with_capacity(state.namespaces.len());
        for namespace in &state.namespaces {
            let client = provider
                .resource_client(&state.config, api, Some(namespace))
                .await?;
            clients.push((client, namespace.clone()));
        }
        Ok(clients)
    }

    /// Discover served kinds and start watching any that are not yet
    /// watched. Runs under the cache lock.
    async fn start_missing_watches(&self, state: &mut CacheState) -> Result<()> {
        let apis = self
            .inner
            .provider
            .api_resources(&state.config, state.settings.resources_filter.clone())
            .await?;

        for api in apis {
            if state.apis.contains_key(&api.group_kind) {
                continue;
            }
            let clients = self.resource_clients(state, &api).await?;
            if clients.is_empty() {
                continue;
            }
            let cancel = CancellationToken::new();
            state.apis.insert(
                api.group_kind.clone(),
                ApiMeta {
                    namespaced: api.namespaced,
                    resource_version: String::new(),
                    watch_cancel: cancel.clone(),
                },
            );
            for (client, namespace) in clients {
                self.spawn_watch(api.clone(), client, namespace, cancel.clone());
            }
        }
        Ok(())
    }

    /// Spawn the long-lived watch task for one kind (and namespace, when
    /// scoped). Failed attempts retry at a fixed interval; a panic inside an
    /// attempt is recovered and treated as a failure.
    fn spawn_watch(
        &self,
        api: ApiResourceInfo,
        client: Box<dyn ResourceClient>,
        namespace: String,
        cancel: CancellationToken,
    ) {
        let cache = self.clone();
        tokio::spawn(async move {
            let gk = api.group_kind.clone();
            loop {
                let attempt =
                    AssertUnwindSafe(cache.watch_once(&api, client.as_ref(), &namespace))
                        .catch_unwind();
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = attempt => outcome,
                };
                match outcome {
                    Ok(Ok(())) => break,
                    Ok(Err(err)) => {
                        warn!(
                            group_kind = %gk,
                            error = %format!("{err:#}"),
                            "watch failed, retrying"
                        );
                    }
                    Err(payload) => {
                        warn!(
                            group_kind = %gk,
                            panic = %panic_message(payload),
                            "recovered from panic in watch, retrying"
                        );
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(WATCH_RESOURCES_RETRY_TIMEOUT) => {}
                }
            }
            debug!(group_kind = %gk, "watch stopped");
        });
    }

    /// One watch attempt: relist when no resume point is cached, then stream
    /// events until the watch fails or is cancelled.
    async fn watch_once(
        &self,
        api: &ApiResourceInfo,
        client: &dyn ResourceClient,
        namespace: &str,
    ) -> Result<()> {
        let gk = &api.group_kind;
        let resource_version = {
            let state = self.inner.state.lock().await;
            match state.apis.get(gk) {
                Some(meta) => meta.resource_version.clone(),
                // The kind is no longer watched.
                None => return Ok(()),
            }
        };

        let resource_version = if resource_version.is_empty() {
            let list = client.list().await?;
            let list_version = list.metadata.resource_version.clone().unwrap_or_default();
            let mut state = self.inner.state.lock().await;
            self.replace_resource_cache(&mut state, gk, &list_version, &list.items, namespace);
            list_version
        } else {
            resource_version
        };

        let mut stream = match client.watch(&resource_version).await {
            Ok(stream) => stream,
            Err(err) => {
                if provider::is_not_found(&err) {
                    // The kind was removed from the cluster.
                    self.stop_watching(gk, namespace).await;
                    return Ok(());
                }
                if provider::is_gone(&err) {
                    self.clear_resource_version(gk).await;
                    warn!(group_kind = %gk, "resource version too old, relisting");
                }
                return Err(err);
            }
        };

        while let Some(event) = stream.next().await {
            let event = event.context("watch stream error")?;
            match event {
                WatchEvent::Added(obj) => {
                    self.process_watch_event(gk, EventType::Added, obj, namespace)
                        .await;
                }
                WatchEvent::Modified(obj) => {
                    self.process_watch_event(gk, EventType::Modified, obj, namespace)
                        .await;
                }
                WatchEvent::Deleted(obj) => {
                    self.process_watch_event(gk, EventType::Deleted, obj, namespace)
                        .await;
                }
                WatchEvent::Bookmark(bookmark) => {
                    let mut state = self.inner.state.lock().await;
                    if let Some(meta) = state.apis.get_mut(gk) {
                        meta.resource_version = bookmark.metadata.resource_version.clone();
                    }
                }
                WatchEvent::Error(response) => {
                    // A gone indication may also surface as an in-stream
                    // error event rather than on the watch open.
                    if provider::is_gone_response(&response) {
                        self.clear_resource_version(gk).await;
                        warn!(group_kind = %gk, "resource version too old, relisting");
                    }
                    return Err(kube::Error::Api(response).into());
                }
            }
        }
        Err(anyhow!("watch {} has closed", gk))
    }

    /// Dispatch one streamed change: advance the kind's resume point, apply
    /// the index mutation, and handle CRD side effects.
    async fn process_watch_event(
        &self,
        gk: &GroupKind,
        event: EventType,
        obj: DynamicObject,
        namespace: &str,
    ) {
        if let Some(on_event) = &self.inner.handlers.on_event {
            on_event(event, &obj);
        }

        {
            let mut state = self.inner.state.lock().await;
            if let Some(meta) = state.apis.get_mut(gk) {
                meta.resource_version = obj.metadata.resource_version.clone().unwrap_or_default();
            }
            let key = resource::object_key(&obj);
            if event == EventType::Deleted {
                self.on_node_removed(&mut state, &key);
            } else {
                let old = state.resources.get(&key).cloned();
                self.on_node_updated(&mut state, old, &obj);
            }
        }

        if resource::is_crd(&obj) {
            if event == EventType::Deleted {
                if let Some(crd_gk) = resource::crd_group_kind(&obj) {
                    self.stop_watching(&crd_gk, namespace).await;
                }
            } else {
                let mut state = self.inner.state.lock().await;
                if let Err(err) = self.start_missing_watches(&mut state).await {
                    warn!(error = %format!("{err:#}"), "failed to start missing watches");
                }
            }
        }
    }

    async fn clear_resource_version(&self, gk: &GroupKind) {
        let mut state = self.inner.state.lock().await;
        if let Some(meta) = state.apis.get_mut(gk) {
            meta.resource_version.clear();
        }
    }

    /// Stop watching a kind entirely: cancel its watch, drop its API-table
    /// entry, and remove its cached objects.
    async fn stop_watching(&self, gk: &GroupKind, namespace: &str) {
        let mut state = self.inner.state.lock().await;
        if let Some(meta) = state.apis.remove(gk) {
            meta.watch_cancel.cancel();
            self.replace_resource_cache(&mut state, gk, "", &[], namespace);
            warn!(group_kind = %gk, "stopped watching kind no longer served by the cluster");
        }
    }

    /// Replace this kind's slice of the cache with the listed objects:
    /// insert or replace every listed object, then delete every cached entry
    /// of the kind (scoped to `namespace` when non-empty) that the list did
    /// not contain.
    fn replace_resource_cache(
        &self,
        state: &mut CacheState,
        gk: &GroupKind,
        resource_version: &str,
        objs: &[DynamicObject],
        namespace: &str,
    ) {
        let listed: HashSet<ResourceKey> = objs.iter().map(resource::object_key).collect();
        for obj in objs {
            let key = resource::object_key(obj);
            let old = state.resources.get(&key).cloned();
            self.on_node_updated(state, old, obj);
        }
        let stale: Vec<ResourceKey> = state
            .resources
            .keys()
            .filter(|key| {
                key.group == gk.group
                    && key.kind == gk.kind
                    && (namespace.is_empty() || key.namespace == namespace)
                    && !listed.contains(key)
            })
            .cloned()
            .collect();
        for key in stale {
            self.on_node_removed(state, &key);
        }
        if let Some(meta) = state.apis.get_mut(gk) {
            meta.resource_version = resource_version.to_string();
        }
    }

    fn new_resource(&self, obj: &DynamicObject) -> Resource {
        let owner_refs = resource::effective_owner_refs(obj);
        let mut info = None;
        let mut cache_manifest = false;
        if let Some(populate) = &self.inner.handlers.on_populate_resource_info {
            let (payload, cache) = populate(obj, owner_refs.is_empty());
            info = payload;
            cache_manifest = cache;
        }
        Resource {
            resource_version: obj.metadata.resource_version.clone().unwrap_or_default(),
            object_ref: resource::object_ref(obj),
            owner_refs,
            info,
            manifest: cache_manifest.then(|| obj.clone()),
        }
    }

    fn set_node(state: &mut CacheState, node: Arc<Resource>) {
        let key = node.resource_key();
        state.resources.insert(key.clone(), node.clone());
        state
            .ns_index
            .entry(key.namespace.clone())
            .or_default()
            .insert(key, node);
    }

    fn on_node_updated(
        &self,
        state: &mut CacheState,
        old: Option<Arc<Resource>>,
        obj: &DynamicObject,
    ) {
        let new_node = Arc::new(self.new_resource(obj));
        let namespace = new_node.object_ref.namespace.clone();
        Self::set_node(state, new_node.clone());
        if let Some(on_resource_updated) = &self.inner.handlers.on_resource_updated {
            let empty = HashMap::new();
            let bucket = state.ns_index.get(&namespace).unwrap_or(&empty);
            on_resource_updated(Some(&new_node), old.as_ref(), bucket);
        }
    }

    fn on_node_removed(&self, state: &mut CacheState, key: &ResourceKey) {
        let Some(existing) = state.resources.remove(key) else {
            return;
        };
        if let Some(bucket) = state.ns_index.get_mut(&key.namespace) {
            bucket.remove(key);
            if bucket.is_empty() {
                state.ns_index.remove(&key.namespace);
            }
        }
        if let Some(on_resource_updated) = &self.inner.handlers.on_resource_updated {
            let empty = HashMap::new();
            let bucket = state.ns_index.get(&key.namespace).unwrap_or(&empty);
            on_resource_updated(None, Some(&existing), bucket);
        }
    }

    /// Direct children of `parent` within the namespace bucket, deduplicated
    /// by uid (key-sort order breaks ties) and sorted by key so traversal
    /// order is stable across invocations.
    fn deterministic_children(
        parent: &Resource,
        ns_nodes: &HashMap<ResourceKey, Arc<Resource>>,
    ) -> Vec<Arc<Resource>> {
        let mut by_uid: HashMap<&str, Vec<&Arc<Resource>>> = HashMap::new();
        for child in ns_nodes.values() {
            if parent.is_parent_of(child) {
                by_uid
                    .entry(child.object_ref.uid.as_str())
                    .or_default()
                    .push(child);
            }
        }
        let mut chosen: Vec<Arc<Resource>> = by_uid
            .into_values()
            .map(|mut group| {
                group.sort_by_key(|child| child.resource_key().to_string());
                group[0].clone()
            })
            .collect();
        chosen.sort_by_key(|child| child.resource_key().to_string());
        chosen
    }

    fn iterate_children<F>(
        parent: &Resource,
        ns_nodes: &HashMap<ResourceKey, Arc<Resource>>,
        visited: &mut HashSet<ResourceKey>,
        action: &mut F,
    ) where
        F: FnMut(&Arc<Resource>, &HashMap<ResourceKey, Arc<Resource>>),
    {
        for child in Self::deterministic_children(parent, ns_nodes) {
            let child_key = child.resource_key();
            if !visited.insert(child_key.clone()) {
                debug!(key = %child_key, "skipping already visited node in ownership cycle");
                continue;
            }
            action(&child, ns_nodes);
            Self::iterate_children(&child, ns_nodes, visited, action);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
