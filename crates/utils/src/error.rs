//! Error taxonomy for the lifecycle coordinator.
//!
//! Sentinel variants carry stable identity across `#[from]` wrapping so callers can
//! match on them with `matches!` the way `ProcessInspectorError::ProcessNotFound` is
//! matched by its callers.

use thiserror::Error;

/// Mirrors the sentinel shape of `executors::CrdCacheError` so `InitError::CrdCache`
/// keeps that failure's identity across the wrap, without `utils` taking on a
/// dependency on `executors` to name the type directly.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CrdCacheFailureKind {
    #[error("no YAML manifests were found under the CRD directory")]
    NoYamlFiles,
    #[error("a CRD manifest was missing a required field")]
    MissingKind,
    #[error("CRDs did not reach Established before the timeout")]
    EstablishTimeout,
    #[error("CRD cache build failed for another reason")]
    Other,
}

/// Errors surfaced while the Manager is bringing the harness up.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("harness is already shutting down")]
    ShuttingDown,
    #[error("failed to create base data directory: {0}")]
    BaseDir(#[source] std::io::Error),
    #[error("CRD cache build failed: {source}")]
    CrdCache {
        kind: CrdCacheFailureKind,
        #[source]
        source: anyhow::Error,
    },
    #[error("factory failed to construct instance: {0}")]
    Factory(#[source] anyhow::Error),
}

/// Errors surfaced while an Instance is starting its process stack.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("process stack failed to start: {0}")]
    Stack(#[source] anyhow::Error),
    #[error("timed out waiting for system namespaces to appear")]
    NamespaceWaitTimeout,
    #[error("caller context is already cancelled")]
    ContextCancelled,
    #[error("exhausted {0} start retries")]
    RetriesExhausted(u32),
}

/// Errors surfaced while an Instance is being reconditioned for its next caller.
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("discovery of namespaced resources failed: {0}")]
    Discovery(#[source] anyhow::Error),
    #[error("namespace sweep did not converge after {0} iterations")]
    NotConverged(u32),
    #[error("namespace sweep aborted: context expired")]
    ContextExpired,
    #[error("direct-storage purge failed: {0}")]
    Purge(#[source] anyhow::Error),
    #[error("stop failed during reconditioning: {0}")]
    Stop(#[source] anyhow::Error),
}

/// Errors returned by `Instance::Config`.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum InstanceError {
    #[error("instance has been released")]
    InstanceReleased,
    #[error("instance has not been started")]
    NotStarted,
}

/// Errors returned at the Manager's public boundary.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("harness has not been initialized")]
    NotInitialized,
    #[error("harness is shutting down")]
    ShuttingDown,
    #[error("pool has been closed")]
    PoolClosed,
    #[error("instance was already released")]
    DoubleRelease,
    #[error("acquire context was already cancelled")]
    ContextCancelled,
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
}

impl ManagerError {
    /// Stable-identity comparison for the fixed sentinel variants; wrapped
    /// operational errors never compare equal to a sentinel.
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, ManagerError::ShuttingDown)
    }

    pub fn is_pool_closed(&self) -> bool {
        matches!(self, ManagerError::PoolClosed)
    }

    pub fn is_not_initialized(&self) -> bool {
        matches!(self, ManagerError::NotInitialized)
    }
}
