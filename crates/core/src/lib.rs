//! The lifecycle coordinator: a bounded pool of lazily-started kine + kube-apiserver
//! test environments, acquired and released through a generation-counter protocol,
//! reconditioned between acquisitions by one of four strategies, and torn down
//! through a TOCTOU-free shutdown drain.

mod instance;
mod manager;
mod pool;
mod release;
mod releaser;
#[cfg(test)]
mod testutil;

pub use instance::{ConnectionConfig, Instance};
pub use manager::{AcquiredInstance, Manager};

pub use utils::{HarnessConfig, ReleaseStrategy};
pub use utils::error::{
    CleanupError, CrdCacheFailureKind, InitError, InstanceError, ManagerError, StartupError,
};

pub use executors::{
    CrdCacheBuilder, CrdCacheConfig, FileCrdCacheBuilder, ProcessStackSupervisor,
    RealProcessStackSupervisor,
};
pub use services::{KubeClientFactory, KubeRsClientFactory};
