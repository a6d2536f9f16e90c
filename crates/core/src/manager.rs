//! Top-level state machine: Created → Initializing → Ready → ShuttingDown. Owns
//! the Pool, mediates the Acquire/shutdown race, and drives a bounded-inflight
//! drain before sweeping every Instance it ever produced.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use executors::{
    CrdCacheBuilder, CrdCacheConfig, FileCrdCacheBuilder, ProcessStackSupervisor,
    RealProcessStackSupervisor,
};
use services::{KubeClientFactory, KubeRsClientFactory};
use utils::error::{CrdCacheFailureKind, InitError, ManagerError};
use utils::{HarnessConfig, PortRegistry};

use crate::instance::{ConnectionConfig, Instance};
use crate::pool::Pool;
use crate::releaser::Releaser;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created = 0,
    Initializing = 1,
    Ready = 2,
    ShuttingDown = 3,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Created,
            1 => State::Initializing,
            2 => State::Ready,
            _ => State::ShuttingDown,
        }
    }
}

/// The shared, releaser-facing half of the Manager. Held by Instances via a weak
/// reference so the Pool's `all` list does not keep a Manager-side cycle alive.
pub(crate) struct ManagerInner {
    state: AtomicU8,
    init_lock: AsyncMutex<()>,
    pool: RwLock<Option<Arc<Pool>>>,
    template_db_path: RwLock<Option<std::path::PathBuf>>,
    inflight: AtomicI64,
    drain_done: Notify,
    config: Arc<HarnessConfig>,
    port_registry: Arc<PortRegistry>,
    supervisor: Arc<dyn ProcessStackSupervisor>,
    client_factory: Arc<dyn KubeClientFactory>,
    crd_cache_builder: Option<Arc<dyn CrdCacheBuilder>>,
}

/// Decrements `inflight` on drop (even if the release critical section panics)
/// and fires the drain signal if that decrement was the one that reached zero
/// while the Manager is shutting down — the Rust stand-in for the deferred
/// decrement a `defer` statement would give in a language that has one.
struct InflightGuard<'a> {
    inner: &'a ManagerInner,
}

impl<'a> InflightGuard<'a> {
    fn enter(inner: &'a ManagerInner) -> Self {
        inner.inflight.fetch_add(1, Ordering::AcqRel);
        Self { inner }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.inner.inflight.fetch_sub(1, Ordering::AcqRel) == 1
            && State::from_u8(self.inner.state.load(Ordering::Acquire)) == State::ShuttingDown
        {
            self.inner.drain_done.notify_waiters();
        }
    }
}

#[async_trait]
impl Releaser for ManagerInner {
    async fn release_to_pool(&self, instance: Arc<Instance>, token: u64) -> bool {
        let _guard = InflightGuard::enter(self);
        self.release_to_pool_inner(instance, token).await
    }

    async fn release_failed(&self, instance: Arc<Instance>, token: u64) {
        if let Some(pool) = self.pool.read().await.clone() {
            pool.release_failed(instance, token).await;
        }
    }
}

impl ManagerInner {
    async fn release_to_pool_inner(&self, instance: Arc<Instance>, token: u64) -> bool {
        if State::from_u8(self.state.load(Ordering::Acquire)) == State::ShuttingDown {
            return false;
        }
        let pool = self.pool.read().await.clone();
        match pool {
            Some(pool) => {
                pool.release(instance, token).await;
                true
            }
            None => false,
        }
    }
}

/// The public handle callers hold. Thin wrapper around `Arc<ManagerInner>` so the
/// public surface stays small while `ManagerInner` carries the releaser identity
/// Instances hold a weak reference to.
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// The constructor a top-level singleton accessor calls: real process-stack
    /// supervisor, real `kube`-backed client factory, and (if `crd_dir` is set) a
    /// real CRD cache builder. Does not touch the filesystem or spawn anything —
    /// that is `initialize`'s job.
    pub fn new(config: HarnessConfig) -> Self {
        let port_registry = Arc::new(PortRegistry::new());
        let supervisor: Arc<dyn ProcessStackSupervisor> =
            Arc::new(RealProcessStackSupervisor);
        let client_factory: Arc<dyn KubeClientFactory> = Arc::new(KubeRsClientFactory);
        let crd_cache_builder: Option<Arc<dyn CrdCacheBuilder>> = if config.crd_dir.is_some() {
            Some(Arc::new(FileCrdCacheBuilder::new(RealProcessStackSupervisor)))
        } else {
            None
        };
        Self::with_collaborators(
            config,
            port_registry,
            supervisor,
            client_factory,
            crd_cache_builder,
        )
    }

    /// Full constructor for callers that substitute fakes for the external
    /// collaborators — tests, mainly.
    pub fn with_collaborators(
        config: HarnessConfig,
        port_registry: Arc<PortRegistry>,
        supervisor: Arc<dyn ProcessStackSupervisor>,
        client_factory: Arc<dyn KubeClientFactory>,
        crd_cache_builder: Option<Arc<dyn CrdCacheBuilder>>,
    ) -> Self {
        config.validate();
        let template_db_path = config.template_db_path.clone();
        let config = Arc::new(config);
        Self {
            inner: Arc::new(ManagerInner {
                state: AtomicU8::new(State::Created as u8),
                init_lock: AsyncMutex::new(()),
                pool: RwLock::new(None),
                template_db_path: RwLock::new(template_db_path),
                inflight: AtomicI64::new(0),
                drain_done: Notify::new(),
                config,
                port_registry,
                supervisor,
                client_factory,
                crd_cache_builder,
            }),
        }
    }

    /// Serialized by the init-lock so concurrent Initialize calls converge on one
    /// outcome. A no-op if already Ready; fails fast if ShuttingDown.
    pub async fn initialize(&self) -> Result<(), ManagerError> {
        let _guard = self.inner.init_lock.lock().await;

        match State::from_u8(self.inner.state.load(Ordering::Acquire)) {
            State::Ready => return Ok(()),
            State::ShuttingDown => return Err(ManagerError::ShuttingDown),
            _ => {}
        }

        self.inner
            .state
            .store(State::Initializing as u8, Ordering::Release);

        match self.try_initialize().await {
            Ok(()) => {
                self.inner
                    .state
                    .store(State::Ready as u8, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.rollback_pool().await;
                self.inner
                    .state
                    .store(State::Created as u8, Ordering::Release);
                Err(ManagerError::Init(e))
            }
        }
    }

    async fn try_initialize(&self) -> Result<(), InitError> {
        std::fs::create_dir_all(&self.inner.config.base_data_dir).map_err(InitError::BaseDir)?;

        if let (Some(crd_dir), Some(builder)) =
            (&self.inner.config.crd_dir, &self.inner.crd_cache_builder)
        {
            let cache_config = CrdCacheConfig {
                crd_dir: crd_dir.clone(),
                cache_dir: self.inner.config.base_data_dir.join("crd-cache"),
                kine_binary: self.inner.config.kine_binary.clone(),
                apiserver_binary: self.inner.config.apiserver_binary.clone(),
                timeout: self.inner.config.crd_cache_timeout,
                stop_timeout: self.inner.config.stop_timeout,
                port_registry: self.inner.port_registry.clone(),
            };
            let template_path = builder
                .ensure_cache(&cache_config)
                .await
                .map_err(|e| {
                    let kind = match &e {
                        executors::CrdCacheError::NoYamlFiles(_) => {
                            CrdCacheFailureKind::NoYamlFiles
                        }
                        executors::CrdCacheError::MissingKind { .. } => {
                            CrdCacheFailureKind::MissingKind
                        }
                        executors::CrdCacheError::EstablishTimeout => {
                            CrdCacheFailureKind::EstablishTimeout
                        }
                        _ => CrdCacheFailureKind::Other,
                    };
                    InitError::CrdCache {
                        kind,
                        source: anyhow::anyhow!(e),
                    }
                })?;
            *self.inner.template_db_path.write().await = Some(template_path);
        }

        let inner = self.inner.clone();
        let template_db_path = self.inner.template_db_path.read().await.clone();
        let factory_config = Arc::new(HarnessConfig {
            template_db_path,
            ..(*self.inner.config).clone()
        });

        let weak_inner: std::sync::Weak<dyn Releaser> = {
            let strong: Arc<dyn Releaser> = inner.clone();
            Arc::downgrade(&strong)
        };

        let port_registry = self.inner.port_registry.clone();
        let supervisor = self.inner.supervisor.clone();
        let client_factory = self.inner.client_factory.clone();
        let base_dir = self.inner.config.base_data_dir.clone();

        let pool = Pool::new(
            Box::new(move |idx| {
                let id = format!("inst-{idx}-{:08x}", rand_suffix(idx));
                let instance = Arc::new(Instance::new(
                    id,
                    &base_dir,
                    factory_config.clone(),
                    port_registry.clone(),
                    supervisor.clone(),
                    client_factory.clone(),
                ));
                instance.attach_releaser(weak_inner.clone());
                instance
            }),
            self.inner.config.pool_size,
        );

        *self.inner.pool.write().await = Some(pool);
        Ok(())
    }

    async fn rollback_pool(&self) {
        let pool = self.inner.pool.write().await.take();
        if let Some(pool) = pool {
            let instances = pool.all();
            let stops = instances.into_iter().map(|instance| {
                let stop_timeout = self.inner.config.stop_timeout;
                async move {
                    let ctx = CancellationToken::new();
                    if let Err(e) = instance.stop(ctx, stop_timeout).await {
                        tracing::warn!(id = instance.id(), error = %e, "rollback stop failed");
                    }
                }
            });
            futures::future::join_all(stops).await;
        }
        *self.inner.template_db_path.write().await = self.inner.config.template_db_path.clone();
    }

    pub async fn acquire(&self, ctx: CancellationToken) -> Result<AcquiredInstance, ManagerError> {
        match State::from_u8(self.inner.state.load(Ordering::Acquire)) {
            State::ShuttingDown => return Err(ManagerError::ShuttingDown),
            State::Created | State::Initializing => return Err(ManagerError::NotInitialized),
            State::Ready => {}
        }

        let pool = self
            .inner
            .pool
            .read()
            .await
            .clone()
            .ok_or(ManagerError::NotInitialized)?;

        // The per-acquire deadline bounds the whole call; dropping `pool.acquire`'s
        // future on timeout simply abandons that attempt; any semaphore permit it
        // was mid-wait on is never taken.
        let (instance, token) = tokio::select! {
            biased;
            res = pool.acquire(ctx.clone()) => res?,
            _ = tokio::time::sleep(self.inner.config.acquire_timeout) => {
                return Err(ManagerError::ContextCancelled)
            }
        };

        if State::from_u8(self.inner.state.load(Ordering::Acquire)) == State::ShuttingDown {
            if !instance.try_release(token) {
                panic!("double release detected while racing shutdown");
            }
            let stop_ctx = CancellationToken::new();
            let _ = instance
                .stop(stop_ctx, self.inner.config.stop_timeout)
                .await;
            return Err(ManagerError::ShuttingDown);
        }

        if !instance.is_started().await {
            if let Err(e) = instance.start(ctx.clone()).await {
                instance.record_last_error(e.to_string());
                if let Some(pool) = self.inner.pool.read().await.clone() {
                    pool.release_failed(instance, token).await;
                }
                return Err(ManagerError::Startup(e));
            }
        }

        Ok(AcquiredInstance {
            instance,
            token,
            manager: self.inner.clone(),
        })
    }

    /// Publishes ShuttingDown, drains in-flight releases, closes the pool, then
    /// stops every Instance the pool ever produced.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        self.inner
            .state
            .store(State::ShuttingDown as u8, Ordering::SeqCst);

        // `enable()` registers this waiter before the inflight check below runs, so
        // a release that drains to zero between the check and the `.await` can
        // never be missed — the alternative order (check, then create the
        // Notified future) is the textbook Notify lost-wakeup race.
        let notified = self.inner.drain_done.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.inner.inflight.load(Ordering::Acquire) > 0 {
            let timeout = tokio::time::sleep(self.inner.config.shutdown_drain_timeout);
            tokio::pin!(timeout);
            tokio::select! {
                _ = &mut notified => {}
                _ = &mut timeout => {
                    tracing::warn!("shutdown drain timed out waiting for in-flight releases");
                }
            }
        }

        let pool = self.inner.pool.read().await.clone();
        let Some(pool) = pool else {
            return Ok(());
        };
        pool.close();

        let instances = pool.all();
        let stops = instances.into_iter().map(|instance| {
            let stop_timeout = self.inner.config.stop_timeout;
            async move {
                if instance.is_started().await {
                    tracing::warn!(id = instance.id(), "instance still acquired at shutdown");
                }
                let ctx = CancellationToken::new();
                instance.stop(ctx, stop_timeout).await
            }
        });
        let results = futures::future::join_all(stops).await;
        let mut first_err = None;
        for r in results {
            if let Err(e) = r {
                tracing::warn!(error = %e, "instance failed to stop during shutdown");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(ManagerError::Cleanup(utils::error::CleanupError::Stop(e))),
            None => Ok(()),
        }
    }
}

/// An acquired Instance together with the token that must accompany its Release.
/// Double-release at this layer is reported as an error rather than a panic; the
/// panic remains reserved for a stale *internal* token, a programming error one
/// layer down.
pub struct AcquiredInstance {
    instance: Arc<Instance>,
    token: u64,
    manager: Arc<ManagerInner>,
}

impl AcquiredInstance {
    pub fn id(&self) -> &str {
        self.instance.id()
    }

    pub async fn config(&self) -> Result<ConnectionConfig, utils::error::InstanceError> {
        self.instance.config().await
    }

    pub async fn release(&self) -> Result<(), ManagerError> {
        if self.instance.generation() != self.token {
            return Err(ManagerError::DoubleRelease);
        }
        self.instance.release(self.token).await
    }
}

/// Deterministic, distinguishing suffix for an instance's directory name. Real
/// collision resistance comes from `idx` being strictly monotonic; this only
/// needs to look like the hex suffix the spec's directory naming describes.
fn rand_suffix(idx: u64) -> u32 {
    let mut x = idx.wrapping_mul(0x9E3779B97F4A7C15) ^ 0xA5A5A5A5;
    x ^= x >> 33;
    (x & 0xFFFF_FFFF) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutil::{FailingSupervisor, UnreachableClientFactory};

    fn test_manager(pool_size: u32, base_dir: &std::path::Path) -> Manager {
        let config = HarnessConfig::new("kine".into(), "kube-apiserver".into())
            .with_pool_size(pool_size)
            .with_base_data_dir(base_dir.to_path_buf());
        let supervisor: Arc<dyn ProcessStackSupervisor> = Arc::new(FailingSupervisor::default());
        let client_factory: Arc<dyn KubeClientFactory> = Arc::new(UnreachableClientFactory);
        Manager::with_collaborators(
            config,
            Arc::new(PortRegistry::new()),
            supervisor,
            client_factory,
            None,
        )
    }

    #[tokio::test]
    async fn acquire_before_initialize_is_not_initialized() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(1, tmp.path());
        let err = manager.acquire(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotInitialized));
    }

    #[tokio::test]
    async fn initialize_is_idempotent_once_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(1, tmp.path());
        manager.initialize().await.unwrap();
        manager.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn acquire_surfaces_startup_failure_and_does_not_wedge_the_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(1, tmp.path());
        manager.initialize().await.unwrap();

        let first = manager.acquire(CancellationToken::new()).await;
        assert!(matches!(first, Err(ManagerError::Startup(_))));

        // The failed instance's slot must have been returned: a second acquire
        // does not block forever waiting on the bounded semaphore.
        let second = tokio::time::timeout(
            Duration::from_millis(500),
            manager.acquire(CancellationToken::new()),
        )
        .await
        .expect("acquire must not hang after a failed start freed its slot");
        assert!(matches!(second, Err(ManagerError::Startup(_))));
    }

    #[tokio::test]
    async fn shutdown_then_acquire_reports_shutting_down() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(1, tmp.path());
        manager.initialize().await.unwrap();
        manager.shutdown().await.unwrap();

        let err = manager.acquire(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ManagerError::ShuttingDown));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(1, tmp.path());
        manager.initialize().await.unwrap();
        manager.shutdown().await.unwrap();
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn initialize_after_shutdown_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(1, tmp.path());
        manager.initialize().await.unwrap();
        manager.shutdown().await.unwrap();

        let err = manager.initialize().await.unwrap_err();
        assert!(matches!(err, ManagerError::ShuttingDown));
    }

    #[tokio::test]
    async fn wrapper_level_double_release_is_reported_not_panicked() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(0, tmp.path());
        manager.initialize().await.unwrap();

        let pool = manager
            .inner
            .pool
            .read()
            .await
            .clone()
            .expect("pool must exist once Ready");
        let (instance, token) = pool.acquire(CancellationToken::new()).await.unwrap();

        let acquired = AcquiredInstance {
            instance,
            token,
            manager: manager.inner.clone(),
        };
        acquired.release().await.unwrap();

        let err = acquired.release().await.unwrap_err();
        assert!(matches!(err, ManagerError::DoubleRelease));
    }
}
