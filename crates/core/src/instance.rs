//! A single logical test environment: one data directory, one process-stack, one
//! generation counter, and the per-acquisition artifact cache that Release clears.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use executors::{ProcessStackSupervisor, StackConfig, StackHandle};
use services::{CachedClients, DeletableResource, KubeClientFactory};
use utils::config::ReleaseStrategy;
use utils::error::{InstanceError, StartupError};
use utils::{HarnessConfig, PortRegistry};

use crate::releaser::Releaser;

/// Connection coordinates returned to a caller by `Instance::config`. A plain copy
/// of the cached `kube::Config`; cloned out so a later `Stop` nulling the cache can
/// never invalidate a config a caller is still holding.
pub type ConnectionConfig = kube::Config;

/// Cleared in one shot by Stop; rebuilt lazily (the discovery list and purge handle)
/// or eagerly (the clients) as each first becomes useful after a Start.
pub(crate) struct CachedArtifacts {
    pub connection_config: ConnectionConfig,
    pub clients: CachedClients,
    pub deletable_resources: AsyncMutex<Option<Vec<DeletableResource>>>,
    pub purge_handle: AsyncMutex<Option<Arc<db::PurgeHandle>>>,
}

struct RunningState {
    started: bool,
    handle: Option<StackHandle>,
    cancel: Option<CancellationToken>,
}

pub struct Instance {
    id: String,
    data_dir: PathBuf,
    db_path: PathBuf,
    kubeconfig_path: PathBuf,
    generation: AtomicU64,
    running: AsyncMutex<RunningState>,
    last_error: StdMutex<Option<String>>,
    cached: AsyncMutex<Option<Arc<CachedArtifacts>>>,
    config: Arc<HarnessConfig>,
    port_registry: Arc<PortRegistry>,
    supervisor: Arc<dyn ProcessStackSupervisor>,
    client_factory: Arc<dyn KubeClientFactory>,
    releaser: StdMutex<Option<Weak<dyn Releaser>>>,
}

impl Instance {
    pub fn new(
        id: String,
        base_data_dir: &std::path::Path,
        config: Arc<HarnessConfig>,
        port_registry: Arc<PortRegistry>,
        supervisor: Arc<dyn ProcessStackSupervisor>,
        client_factory: Arc<dyn KubeClientFactory>,
    ) -> Self {
        let data_dir = base_data_dir.join(&id);
        Self {
            db_path: data_dir.join("db").join("state.db"),
            kubeconfig_path: data_dir.join("kubeconfig.yaml"),
            data_dir,
            id,
            generation: AtomicU64::new(0),
            running: AsyncMutex::new(RunningState {
                started: false,
                handle: None,
                cancel: None,
            }),
            last_error: StdMutex::new(None),
            cached: AsyncMutex::new(None),
            config,
            port_registry,
            supervisor,
            client_factory,
            releaser: StdMutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kubeconfig_path(&self) -> &std::path::Path {
        &self.kubeconfig_path
    }

    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    /// Called once by the Pool right after construction, breaking the
    /// Instance -> Releaser -> Pool -> Instance cycle with a weak reference.
    pub(crate) fn attach_releaser(&self, releaser: Weak<dyn Releaser>) {
        *self.releaser.lock().unwrap() = Some(releaser);
    }

    fn releaser(&self) -> Arc<dyn Releaser> {
        self.releaser
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .expect("instance used before a releaser was attached")
    }

    // --- generation protocol -------------------------------------------------

    /// Increments the generation and returns the new (odd) value: the release token.
    pub(crate) fn mark_acquired(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// CAS from `token` to `token + 1`. `false` means the token is stale.
    pub(crate) fn try_release(&self, token: u64) -> bool {
        self.generation
            .compare_exchange(token, token + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_current_token(&self, token: u64) -> bool {
        self.generation.load(Ordering::Acquire) == token
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn record_last_error(&self, message: String) {
        *self.last_error.lock().unwrap() = Some(message);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    // --- lifecycle -------------------------------------------------------------

    pub async fn is_started(&self) -> bool {
        self.running.lock().await.started
    }

    /// Serialized by the running-state lock. A no-op if already started.
    pub async fn start(&self, ctx: CancellationToken) -> Result<(), StartupError> {
        let mut running = self.running.lock().await;
        if running.started {
            return Ok(());
        }
        if ctx.is_cancelled() {
            return Err(StartupError::ContextCancelled);
        }
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| StartupError::Stack(anyhow::anyhow!(e)))?;

        let mut last_err: Option<StartupError> = None;
        for attempt in 0..self.config.max_start_retries {
            tracing::debug!(id = %self.id, attempt, "starting process stack");
            match self.start_attempt(&ctx).await {
                Ok((handle, cancel, artifacts)) => {
                    running.handle = Some(handle);
                    running.cancel = Some(cancel);
                    running.started = true;
                    *self.cached.lock().await = Some(Arc::new(artifacts));
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(id = %self.id, attempt, error = %e, "start attempt failed");
                    self.record_last_error(e.to_string());
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(StartupError::RetriesExhausted(self.config.max_start_retries)))
    }

    async fn start_attempt(
        &self,
        ctx: &CancellationToken,
    ) -> Result<(StackHandle, CancellationToken, CachedArtifacts), StartupError> {
        let process_cancel = CancellationToken::new();
        let stack_config = StackConfig {
            data_dir: self.data_dir.clone(),
            storage_path: self.db_path.clone(),
            kubeconfig_path: self.kubeconfig_path.clone(),
            kine_binary: self.config.kine_binary.clone(),
            apiserver_binary: self.config.apiserver_binary.clone(),
            template_db_path: self.config.template_db_path.clone(),
            storage_ready_timeout: self.config.start_timeout,
            apiserver_ready_timeout: self.config.start_timeout,
            port_registry: self.port_registry.clone(),
        };
        let readiness_deadline = Instant::now() + self.config.start_timeout;

        // Not raced against `ctx.cancelled()`: once this future starts it owns live
        // child processes, and dropping it here would abandon them with no cleanup
        // path back (`ProcessStackSupervisor::start` takes no cancellation signal of
        // its own). `readiness_deadline` already bounds how long it can run.
        if ctx.is_cancelled() {
            return Err(StartupError::ContextCancelled);
        }
        let mut handle = self
            .supervisor
            .start(&stack_config, readiness_deadline, self.config.stop_timeout)
            .await
            .map_err(|e| StartupError::Stack(anyhow::anyhow!(e)))?;

        let namespace_deadline = std::cmp::min(
            readiness_deadline,
            Instant::now() + Duration::from_secs(30),
        );
        match self
            .wait_system_namespaces(&handle, namespace_deadline, ctx)
            .await
        {
            Ok(artifacts) => Ok((handle, process_cancel, artifacts)),
            Err(e) => {
                let _ = handle.stop(self.config.stop_timeout, &self.port_registry).await;
                Err(e)
            }
        }
    }

    async fn wait_system_namespaces(
        &self,
        handle: &StackHandle,
        deadline: Instant,
        ctx: &CancellationToken,
    ) -> Result<CachedArtifacts, StartupError> {
        let clients = self
            .client_factory
            .build(&self.kubeconfig_path)
            .await
            .map_err(|e| StartupError::Stack(anyhow::anyhow!(e)))?;

        let api: kube::Api<k8s_openapi::api::core::v1::Namespace> =
            kube::Api::all(clients.core.clone());

        loop {
            let present = api
                .list(&kube::api::ListParams::default())
                .await
                .ok()
                .map(|list| {
                    list.items
                        .into_iter()
                        .filter_map(|ns| ns.metadata.name)
                        .collect::<std::collections::HashSet<_>>()
                })
                .unwrap_or_default();

            if utils::config::SYSTEM_NAMESPACES
                .iter()
                .all(|ns| present.contains(*ns))
            {
                let _ = handle.apiserver_port();

                // The Purge baseline must be the row-id observed right here, at first
                // successful namespace readiness — not whatever the row-id happens to
                // be the first time a caller calls Release.
                let purge_handle = if self.config.release_strategy == ReleaseStrategy::Purge {
                    let opened = db::PurgeHandle::open(&self.db_path)
                        .await
                        .map_err(|e| StartupError::Stack(anyhow::anyhow!(e)))?;
                    Some(Arc::new(opened))
                } else {
                    None
                };

                return Ok(CachedArtifacts {
                    connection_config: clients.config.clone(),
                    clients,
                    deletable_resources: AsyncMutex::new(None),
                    purge_handle: AsyncMutex::new(purge_handle),
                });
            }
            if ctx.is_cancelled() || Instant::now() >= deadline {
                return Err(StartupError::NamespaceWaitTimeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Idempotent. Cancels process lifetime, clears every cache, and stops the
    /// process stack under `timeout`.
    pub async fn stop(&self, ctx: CancellationToken, timeout: Duration) -> anyhow::Result<()> {
        if ctx.is_cancelled() {
            anyhow::bail!("stop context already cancelled");
        }
        let mut running = self.running.lock().await;
        let handle = running.handle.take();
        let cancel = running.cancel.take();
        running.started = false;
        drop(running);

        *self.cached.lock().await = None;

        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        if let Some(mut handle) = handle {
            let effective = std::cmp::min(timeout, self.config.stop_timeout)
                .max(Duration::from_millis(1));
            handle.stop(effective, &self.port_registry).await?;
        }
        Ok(())
    }

    /// Returns a copy of the cached connection config, or the appropriate
    /// `InstanceError` if this acquisition has been released or never started.
    pub async fn config(&self) -> Result<ConnectionConfig, InstanceError> {
        if self.generation.load(Ordering::Acquire) % 2 == 0 {
            return Err(InstanceError::InstanceReleased);
        }
        if !self.is_started().await {
            return Err(InstanceError::NotStarted);
        }
        let cached = self.cached.lock().await;
        match cached.as_ref() {
            Some(artifacts) => Ok(artifacts.connection_config.clone()),
            None => Err(InstanceError::NotStarted),
        }
    }

    pub(crate) async fn cached_artifacts(&self) -> Option<Arc<CachedArtifacts>> {
        self.cached.lock().await.clone()
    }

    pub fn harness_config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The central Release state machine: dispatches on configured strategy, then
    /// hands the instance back through the (weak) releaser.
    pub async fn release(self: &Arc<Self>, token: u64) -> Result<(), utils::ManagerError> {
        if !self.is_current_token(token) {
            panic!("double release: internal generation token mismatch for instance {}", self.id);
        }
        crate::release::dispatch(self.clone(), token, self.releaser()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use utils::HarnessConfig;

    use crate::testutil::{FailingSupervisor, UnreachableClientFactory};

    fn test_instance(tmp: &std::path::Path) -> Instance {
        let config = Arc::new(
            HarnessConfig::new("kine".into(), "kube-apiserver".into())
                .with_base_data_dir(tmp.to_path_buf()),
        );
        Instance::new(
            "inst-test".to_string(),
            tmp,
            config,
            Arc::new(PortRegistry::new()),
            Arc::new(FailingSupervisor::default()),
            Arc::new(UnreachableClientFactory),
        )
    }

    #[test]
    fn mark_acquired_yields_increasing_odd_tokens() {
        let tmp = tempfile::tempdir().unwrap();
        let instance = test_instance(tmp.path());
        let first = instance.mark_acquired();
        assert_eq!(first, 1);
        assert!(instance.try_release(first));
        let second = instance.mark_acquired();
        assert_eq!(second, 3);
    }

    #[test]
    fn try_release_rejects_a_stale_token() {
        let tmp = tempfile::tempdir().unwrap();
        let instance = test_instance(tmp.path());
        let token = instance.mark_acquired();
        assert!(instance.try_release(token));
        assert!(!instance.try_release(token), "a second release of the same token must fail");
    }

    #[tokio::test]
    async fn config_before_any_acquire_reports_released() {
        let tmp = tempfile::tempdir().unwrap();
        let instance = test_instance(tmp.path());
        let err = instance.config().await.unwrap_err();
        assert_eq!(err, InstanceError::InstanceReleased);
    }

    #[tokio::test]
    async fn config_after_acquire_without_start_reports_not_started() {
        let tmp = tempfile::tempdir().unwrap();
        let instance = test_instance(tmp.path());
        instance.mark_acquired();
        let err = instance.config().await.unwrap_err();
        assert_eq!(err, InstanceError::NotStarted);
    }

    #[tokio::test]
    async fn stop_is_a_no_op_when_never_started() {
        let tmp = tempfile::tempdir().unwrap();
        let instance = test_instance(tmp.path());
        instance
            .stop(CancellationToken::new(), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!instance.is_started().await);
    }

    #[tokio::test]
    async fn stop_rejects_an_already_cancelled_context() {
        let tmp = tempfile::tempdir().unwrap();
        let instance = test_instance(tmp.path());
        let ctx = CancellationToken::new();
        ctx.cancel();
        let result = instance.stop(ctx, Duration::from_millis(50)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn start_exhausts_retries_against_a_supervisor_that_always_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(
            HarnessConfig::new("kine".into(), "kube-apiserver".into())
                .with_base_data_dir(tmp.path().to_path_buf()),
        );
        let supervisor = Arc::new(FailingSupervisor::default());
        let instance = Instance::new(
            "inst-retry".to_string(),
            tmp.path(),
            config,
            Arc::new(PortRegistry::new()),
            supervisor.clone(),
            Arc::new(UnreachableClientFactory),
        );

        let err = instance.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StartupError::Stack(_)));
        assert_eq!(
            supervisor.attempts.load(std::sync::atomic::Ordering::SeqCst),
            instance.harness_config().max_start_retries as usize
        );
        assert!(instance.last_error().is_some());
        assert!(!instance.is_started().await);
    }
}
