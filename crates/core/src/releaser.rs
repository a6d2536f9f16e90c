//! The polymorphic handle an Instance calls back through at the end of Release,
//! without knowing whether the concrete owner is the real Manager or a test double.
//! Breaks the Manager/Pool/Instance ownership cycle: the Pool owns Instances, the
//! Manager owns the Pool, and an Instance holds only a weak reference to this trait.

use std::sync::Arc;

use async_trait::async_trait;

use crate::instance::Instance;

#[async_trait]
pub trait Releaser: Send + Sync {
    /// Returns the Instance to the pool. `false` means the caller (the Instance)
    /// must stop itself instead — the Manager is shutting down and declined the
    /// handoff.
    async fn release_to_pool(&self, instance: Arc<Instance>, token: u64) -> bool;

    /// Marks release as failed; the instance is removed from rotation and left for
    /// Shutdown's sweep (or stopped immediately by the caller).
    async fn release_failed(&self, instance: Arc<Instance>, token: u64);
}
