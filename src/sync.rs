// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Sync lifecycle vocabulary shared with the reconciliation engine.
//!
//! These are value types only: the cache never drives a sync operation, it
//! just carries the tags that the surrounding engine attaches to resources.

use serde::{Deserialize, Serialize};

use crate::resource::ResourceKey;

/// Phase of a multi-phase sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    PreSync,
    Sync,
    PostSync,
    SyncFail,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::PreSync => "PreSync",
            SyncPhase::Sync => "Sync",
            SyncPhase::PostSync => "PostSync",
            SyncPhase::SyncFail => "SyncFail",
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncPhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PreSync" => Ok(SyncPhase::PreSync),
            "Sync" => Ok(SyncPhase::Sync),
            "PostSync" => Ok(SyncPhase::PostSync),
            "SyncFail" => Ok(SyncPhase::SyncFail),
            _ => Err(anyhow::anyhow!("Unknown sync phase: {}", s)),
        }
    }
}

/// State of an operation (sync or hook execution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationPhase {
    Running,
    Terminating,
    Failed,
    Error,
    Succeeded,
}

impl OperationPhase {
    /// Whether the operation has reached a terminal state.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            OperationPhase::Failed | OperationPhase::Error | OperationPhase::Succeeded
        )
    }

    pub fn is_running(&self) -> bool {
        *self == OperationPhase::Running
    }

    pub fn is_successful(&self) -> bool {
        *self == OperationPhase::Succeeded
    }

    pub fn is_failed(&self) -> bool {
        *self == OperationPhase::Failed
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationPhase::Running => "Running",
            OperationPhase::Terminating => "Terminating",
            OperationPhase::Failed => "Failed",
            OperationPhase::Error => "Error",
            OperationPhase::Succeeded => "Succeeded",
        }
    }
}

impl std::fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome code attached to a single resource after a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Synced,
    SyncFailed,
    Pruned,
    PruneSkipped,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Synced => "Synced",
            ResultCode::SyncFailed => "SyncFailed",
            ResultCode::Pruned => "Pruned",
            ResultCode::PruneSkipped => "PruneSkipped",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook kind declared on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookType {
    PreSync,
    Sync,
    PostSync,
    Skip,
    SyncFail,
}

impl HookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::PreSync => "PreSync",
            HookType::Sync => "Sync",
            HookType::PostSync => "PostSync",
            HookType::Skip => "Skip",
            HookType::SyncFail => "SyncFail",
        }
    }
}

impl std::fmt::Display for HookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HookType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PreSync" => Ok(HookType::PreSync),
            "Sync" => Ok(HookType::Sync),
            "PostSync" => Ok(HookType::PostSync),
            "Skip" => Ok(HookType::Skip),
            "SyncFail" => Ok(HookType::SyncFail),
            _ => Err(anyhow::anyhow!("Unknown hook type: {}", s)),
        }
    }
}

/// When a hook resource should be deleted relative to its execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookDeletePolicy {
    HookSucceeded,
    HookFailed,
    BeforeHookCreation,
}

impl HookDeletePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookDeletePolicy::HookSucceeded => "HookSucceeded",
            HookDeletePolicy::HookFailed => "HookFailed",
            HookDeletePolicy::BeforeHookCreation => "BeforeHookCreation",
        }
    }
}

impl std::fmt::Display for HookDeletePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HookDeletePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HookSucceeded" => Ok(HookDeletePolicy::HookSucceeded),
            "HookFailed" => Ok(HookDeletePolicy::HookFailed),
            "BeforeHookCreation" => Ok(HookDeletePolicy::BeforeHookCreation),
            _ => Err(anyhow::anyhow!("Unknown hook delete policy: {}", s)),
        }
    }
}

/// Per-resource outcome record produced by a sync attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSyncResult {
    /// Key of the resource this result is for.
    pub resource_key: ResourceKey,
    /// Resource version observed during the sync.
    pub version: String,
    /// Execution order within the sync.
    pub order: usize,
    /// Result code.
    pub status: ResultCode,
    /// Message for the last sync or operation.
    pub message: String,
    /// Hook kind, absent for non-hook resources.
    pub hook_type: Option<HookType>,
    /// State of any operation associated with this resource or hook.
    pub hook_phase: Option<OperationPhase>,
    /// The sync phase this result belongs to.
    pub sync_phase: Option<SyncPhase>,
}
