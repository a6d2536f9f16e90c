//! Bounded LIFO collection of Instances: on-demand creation, blocking acquisition
//! when saturated, and one-shot closure semantics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use utils::error::ManagerError;

use crate::instance::Instance;

type Factory = Box<dyn Fn(u64) -> Arc<Instance> + Send + Sync>;

struct Inner {
    free: Vec<Arc<Instance>>,
    all: Vec<Arc<Instance>>,
    closed: bool,
}

pub struct Pool {
    inner: Mutex<Inner>,
    factory: Factory,
    next_idx: AtomicU64,
    /// `None` means unbounded: Acquire never blocks on a semaphore slot.
    semaphore: Option<Semaphore>,
    max_size: usize,
    closed_signal: CancellationToken,
}

impl Pool {
    pub fn new(factory: Factory, max_size: u32) -> Arc<Self> {
        let semaphore = if max_size == 0 {
            None
        } else {
            Some(Semaphore::new(max_size as usize))
        };
        Arc::new(Self {
            inner: Mutex::new(Inner {
                free: Vec::new(),
                all: Vec::new(),
                closed: false,
            }),
            factory,
            next_idx: AtomicU64::new(0),
            semaphore,
            max_size: max_size as usize,
            closed_signal: CancellationToken::new(),
        })
    }

    pub fn all(&self) -> Vec<Arc<Instance>> {
        self.inner.lock().unwrap().all.clone()
    }

    pub async fn acquire(
        self: &Arc<Self>,
        ctx: CancellationToken,
    ) -> Result<(Arc<Instance>, u64), ManagerError> {
        if ctx.is_cancelled() {
            return Err(ManagerError::ContextCancelled);
        }

        // Reserve a slot in bounded mode before touching the lock, racing the
        // pool-closed and caller-cancellation signals the same way Acquire races
        // the semaphore against both in the spec.
        let _permit = if let Some(sem) = &self.semaphore {
            tokio::select! {
                biased;
                _ = self.closed_signal.cancelled() => return Err(ManagerError::PoolClosed),
                _ = ctx.cancelled() => return Err(ManagerError::ContextCancelled),
                permit = sem.acquire() => Some(permit.expect("semaphore never closed directly")),
            }
        } else {
            None
        };

        let existing = {
            let mut guard = self.inner.lock().unwrap();
            if guard.closed {
                drop(guard);
                return Err(ManagerError::PoolClosed);
            }
            guard.free.pop()
        };

        let instance = match existing {
            Some(instance) => instance,
            None => {
                let idx = self.next_idx.fetch_add(1, Ordering::AcqRel);
                let instance = (self.factory)(idx);

                let mut guard = self.inner.lock().unwrap();
                guard.all.push(instance.clone());
                let closed_during_factory = guard.closed;
                drop(guard);

                if closed_during_factory {
                    let stop_ctx = CancellationToken::new();
                    let _ = instance.stop(stop_ctx, Duration::from_secs(5)).await;
                    return Err(ManagerError::PoolClosed);
                }
                instance
            }
        };

        // The permit is handed off to the instance's occupancy of a slot, not to
        // this call frame: forget it so it survives past this function returning,
        // and only `release`/`release_failed` hand an equivalent slot back.
        if let Some(permit) = _permit {
            permit.forget();
        }

        let token = instance.mark_acquired();
        Ok((instance, token))
    }

    /// Normal-path release: push back onto `free` unless the pool has been
    /// closed, in which case stop the instance instead.
    pub async fn release(self: &Arc<Self>, instance: Arc<Instance>, token: u64) {
        if !instance.try_release(token) {
            panic!("double release detected at pool layer");
        }
        let closed = {
            let mut guard = self.inner.lock().unwrap();
            if !guard.closed {
                guard.free.push(instance.clone());
            }
            guard.closed
        };
        if closed {
            let ctx = CancellationToken::new();
            let _ = instance.stop(ctx, Duration::from_secs(5)).await;
        }
        self.return_slot();
    }

    pub async fn release_failed(self: &Arc<Self>, instance: Arc<Instance>, token: u64) {
        if !instance.try_release(token) {
            panic!("double release detected at pool layer");
        }
        let ctx = CancellationToken::new();
        let _ = instance.stop(ctx, Duration::from_secs(5)).await;
        self.return_slot();
    }

    fn return_slot(&self) {
        if let Some(sem) = &self.semaphore {
            // During normal operation a full semaphore is a bookkeeping bug: every
            // slot consumed by Acquire must be matched by exactly one release.
            // After Close, Acquire callers parked on the semaphore unblock via the
            // cancellation signal rather than by draining permits, so a refill can
            // legitimately find the semaphore already full; that case is handled
            // by `close`, which never calls `return_slot`.
            assert!(
                sem.available_permits() < self.max_size,
                "pool semaphore over-filled: more releases than acquires"
            );
            sem.add_permits(1);
        }
    }

    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        if guard.closed {
            return;
        }
        guard.closed = true;
        guard.free.clear();
        drop(guard);
        self.closed_signal.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use utils::{HarnessConfig, PortRegistry};

    use crate::instance::Instance;
    use crate::testutil::{FailingSupervisor, UnreachableClientFactory};

    fn test_config(pool_size: u32, base_dir: &std::path::Path) -> Arc<HarnessConfig> {
        Arc::new(
            HarnessConfig::new("kine".into(), "kube-apiserver".into())
                .with_pool_size(pool_size)
                .with_base_data_dir(base_dir.to_path_buf()),
        )
    }

    fn test_pool(pool_size: u32) -> Arc<Pool> {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(pool_size, tmp.path());
        let port_registry = Arc::new(PortRegistry::new());
        let supervisor: Arc<dyn executors::ProcessStackSupervisor> =
            Arc::new(FailingSupervisor::default());
        let client_factory: Arc<dyn services::KubeClientFactory> =
            Arc::new(UnreachableClientFactory);
        // Leak the TempDir so the data directory outlives the pool for the life of
        // the test process; these tests never touch the filesystem anyway.
        std::mem::forget(tmp);

        Pool::new(
            Box::new(move |idx| {
                Arc::new(Instance::new(
                    format!("inst-{idx}"),
                    &config.base_data_dir,
                    config.clone(),
                    port_registry.clone(),
                    supervisor.clone(),
                    client_factory.clone(),
                ))
            }),
            pool_size,
        )
    }

    #[tokio::test]
    async fn acquire_then_release_reuses_the_same_instance() {
        let pool = test_pool(1);
        let (instance, token) = pool.acquire(CancellationToken::new()).await.unwrap();
        assert_eq!(instance.generation(), token);
        pool.release(instance.clone(), token).await;

        let (again, token2) = pool.acquire(CancellationToken::new()).await.unwrap();
        assert_eq!(again.id(), instance.id(), "LIFO free-list should hand back the same instance");
        assert!(token2 > token, "release-then-acquire must mint a fresh token");
        assert_eq!(pool.all().len(), 1, "no second instance should have been created");
    }

    #[tokio::test]
    async fn acquire_blocks_while_saturated_and_unblocks_on_release() {
        let pool = test_pool(1);
        let (instance, token) = pool.acquire(CancellationToken::new()).await.unwrap();

        let pool2 = pool.clone();
        let mut pending = Box::pin(pool2.acquire(CancellationToken::new()));
        let raced = tokio::time::timeout(Duration::from_millis(50), &mut pending).await;
        assert!(raced.is_err(), "second acquire must block while the pool is saturated");

        pool.release(instance, token).await;
        let (_second, _token2) = tokio::time::timeout(Duration::from_millis(200), pending)
            .await
            .expect("acquire should unblock once the slot is released")
            .unwrap();
    }

    #[tokio::test]
    async fn unbounded_pool_never_blocks() {
        let pool = test_pool(0);
        let first = pool.acquire(CancellationToken::new()).await.unwrap();
        let second = pool.acquire(CancellationToken::new()).await.unwrap();
        assert_ne!(first.0.id(), second.0.id());
        assert_eq!(pool.all().len(), 2);
    }

    #[tokio::test]
    #[should_panic(expected = "double release")]
    async fn double_release_panics() {
        let pool = test_pool(1);
        let (instance, token) = pool.acquire(CancellationToken::new()).await.unwrap();
        pool.release(instance.clone(), token).await;
        pool.release(instance, token).await;
    }

    #[tokio::test]
    async fn close_rejects_further_acquires_and_drops_the_free_list() {
        let pool = test_pool(1);
        let (instance, token) = pool.acquire(CancellationToken::new()).await.unwrap();
        pool.release(instance, token).await;

        pool.close();
        let err = pool.acquire(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ManagerError::PoolClosed));
    }

    #[tokio::test]
    async fn close_unblocks_a_pending_acquire_with_pool_closed() {
        let pool = test_pool(1);
        let (_instance, _token) = pool.acquire(CancellationToken::new()).await.unwrap();

        let pool2 = pool.clone();
        let pending = tokio::spawn(async move { pool2.acquire(CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close();

        let result = tokio::time::timeout(Duration::from_millis(200), pending)
            .await
            .expect("close must wake a pending acquire")
            .unwrap();
        assert!(matches!(result, Err(ManagerError::PoolClosed)));
    }
}
