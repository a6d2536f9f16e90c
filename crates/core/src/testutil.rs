//! Fakes for the two external collaborators, shared by this crate's own tests.
#![cfg(test)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use executors::{ProcessStackSupervisor, StackConfig, StackError, StackHandle};
use services::{CachedClients, ClientError, KubeClientFactory};

/// Always fails to start, recording how many attempts it was asked to make. Enough
/// to exercise `Instance::start`'s retry loop and every Release strategy's
/// `is_started()` early-out, without spawning a real process or apiserver.
#[derive(Default)]
pub struct FailingSupervisor {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl ProcessStackSupervisor for FailingSupervisor {
    async fn start(
        &self,
        _config: &StackConfig,
        _readiness_deadline: Instant,
        _stop_timeout: Duration,
    ) -> Result<StackHandle, StackError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StackError::Spawn {
            process: "kine",
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "fake supervisor never starts anything",
            ),
        })
    }
}

/// Stands in for a real `KubeClientFactory` wherever one is required by a
/// constructor signature but never reached: every test instance here fails to
/// start before `Instance::start_attempt` would call into it.
pub struct UnreachableClientFactory;

#[async_trait]
impl KubeClientFactory for UnreachableClientFactory {
    async fn build(&self, _kubeconfig_path: &Path) -> Result<CachedClients, ClientError> {
        unreachable!("test client factory should never be called")
    }
}
