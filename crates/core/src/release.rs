//! The four reconditioning pipelines dispatched from `Instance::release`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use services::resources::{DeletableResource, KubeResourceOps, ResourceOps};
use services::namespaces::{KubeNamespaceOps, NamespaceOps};
use utils::config::ReleaseStrategy;
use utils::error::{CleanupError, ManagerError};

use crate::instance::Instance;
use crate::releaser::Releaser;

const SWEEP_FANOUT: usize = 10;
const NAMESPACE_SWEEP_MAX_ITERATIONS: u32 = 100;
const NAMESPACE_SWEEP_POLL: Duration = Duration::from_millis(10);

pub(crate) async fn dispatch(
    instance: Arc<Instance>,
    token: u64,
    releaser: Arc<dyn Releaser>,
) -> Result<(), ManagerError> {
    let strategy = instance.harness_config().release_strategy;
    let result: Result<(), ManagerError> = match strategy {
        ReleaseStrategy::None => Ok(()),
        ReleaseStrategy::Restart => restart(&instance).await,
        ReleaseStrategy::Clean => clean(&instance).await,
        ReleaseStrategy::Purge => purge(&instance).await,
    };

    match result {
        Ok(()) => {
            if !releaser.release_to_pool(instance.clone(), token).await {
                let ctx = CancellationToken::new();
                let timeout = instance.harness_config().stop_timeout;
                if let Err(e) = instance.stop(ctx, timeout).await {
                    tracing::warn!(id = instance.id(), error = %e, "stop-on-shutdown-handoff failed");
                }
            }
            Ok(())
        }
        Err(e) => {
            releaser.release_failed(instance.clone(), token).await;
            Err(e)
        }
    }
}

async fn restart(instance: &Arc<Instance>) -> Result<(), ManagerError> {
    let ctx = CancellationToken::new();
    let timeout = instance.harness_config().stop_timeout;
    instance
        .stop(ctx, timeout)
        .await
        .map_err(|e| ManagerError::Cleanup(CleanupError::Stop(e)))
}

/// **Purge**: a single prepared DELETE against a baseline-anchored handle, opened
/// once per Instance right after its first successful system-namespace readiness
/// (`Instance::wait_system_namespaces`) and reused for every subsequent Release.
async fn purge(instance: &Arc<Instance>) -> Result<(), ManagerError> {
    if !instance.is_started().await {
        return Ok(());
    }
    let artifacts = match instance.cached_artifacts().await {
        Some(a) => a,
        None => return Ok(()),
    };

    let handle = artifacts.purge_handle.lock().await.clone().ok_or_else(|| {
        ManagerError::Cleanup(CleanupError::Purge(anyhow::anyhow!(
            "purge handle missing on a started instance; Purge strategy requires \
             release_strategy to be set to Purge at construction"
        )))
    })?;

    handle
        .purge()
        .await
        .map(|_| ())
        .map_err(|e| ManagerError::Cleanup(CleanupError::Purge(anyhow::anyhow!(e))))
}

/// **Clean**: API-driven teardown of every user namespace and the resources inside
/// it. Only meaningful while the process stack is live.
async fn clean(instance: &Arc<Instance>) -> Result<(), ManagerError> {
    if !instance.is_started().await {
        return Ok(());
    }
    let artifacts = match instance.cached_artifacts().await {
        Some(a) => a,
        None => return Ok(()),
    };

    let ns_ops = KubeNamespaceOps::new(artifacts.clients.core.clone());
    let user_namespaces = ns_ops
        .list_user_namespaces()
        .await
        .map_err(|e| ManagerError::Cleanup(CleanupError::Discovery(anyhow::anyhow!(e))))?;

    if user_namespaces.is_empty() {
        return Ok(());
    }

    let res_ops = Arc::new(KubeResourceOps::new(artifacts.clients.discovery.clone()));
    let resource_types = {
        let mut slot = artifacts.deletable_resources.lock().await;
        if slot.is_none() {
            let discovered = res_ops
                .discover_namespaced_resources()
                .await
                .map_err(|e| ManagerError::Cleanup(CleanupError::Discovery(anyhow::anyhow!(e))))?;
            *slot = Some(discovered);
        }
        slot.as_ref().unwrap().clone()
    };

    clean_namespaced_resources(res_ops.as_ref(), &resource_types, &user_namespaces).await;

    clean_namespaces(
        &ns_ops,
        user_namespaces,
        instance.harness_config().cleanup_timeout,
    )
    .await?;

    Ok(())
}

/// Deletes every object of every discovered resource type inside `user_namespaces`.
/// Individual resource-type failures are logged and swallowed; only discovery
/// failure (already surfaced by the caller) is fatal to the Release.
async fn clean_namespaced_resources(
    res_ops: &dyn ResourceOps,
    resource_types: &[DeletableResource],
    user_namespaces: &[String],
) {
    let user_set: HashSet<&str> = user_namespaces.iter().map(String::as_str).collect();

    stream::iter(resource_types.iter())
        .for_each_concurrent(SWEEP_FANOUT, |resource| {
            let user_set = &user_set;
            async move {
                if let Err(e) = sweep_one_resource_type(res_ops, resource, user_set).await {
                    tracing::debug!(kind = %resource.kind, error = %e, "resource sweep entry failed, skipping");
                }
            }
        })
        .await;
}

async fn sweep_one_resource_type(
    res_ops: &dyn ResourceOps,
    resource: &DeletableResource,
    user_namespaces: &HashSet<&str>,
) -> Result<(), services::resources::ResourceError> {
    let all = res_ops.list_all(resource).await?;
    let mut by_namespace: HashMap<&str, Vec<String>> = HashMap::new();
    for (ns, name) in &all {
        if let Some(&interned) = user_namespaces.get(ns.as_str()) {
            by_namespace.entry(interned).or_default().push(name.clone());
        }
    }
    if by_namespace.is_empty() {
        return Ok(());
    }

    for (namespace, names) in by_namespace {
        if names.is_empty() {
            continue;
        }
        let supported = res_ops.delete_collection(resource, namespace).await?;
        if !supported {
            for name in &names {
                if let Err(e) = res_ops.delete_one(resource, namespace, name).await {
                    tracing::debug!(kind = %resource.kind, namespace, name, error = %e, "fallback delete-each failed");
                }
            }
            continue;
        }

        let remaining = res_ops.list_names(resource, namespace).await.unwrap_or_default();
        for name in remaining {
            let _ = res_ops.clear_finalizers(resource, namespace, &name).await;
            if let Err(e) = res_ops.delete_one(resource, namespace, &name).await {
                tracing::debug!(kind = %resource.kind, namespace, name, error = %e, "finalizer-stuck delete failed");
            }
        }
    }
    Ok(())
}

/// Deletes namespaces themselves, looping until a clean observation confirms none
/// remain, finalizing any that are stuck in `Terminating`.
async fn clean_namespaces(
    ns_ops: &dyn NamespaceOps,
    initial: Vec<String>,
    cleanup_timeout: Duration,
) -> Result<(), ManagerError> {
    let deadline = Instant::now() + cleanup_timeout;
    let mut pending = initial;

    for iteration in 0..NAMESPACE_SWEEP_MAX_ITERATIONS {
        if iteration > 0 {
            pending = ns_ops
                .list_user_namespaces()
                .await
                .map_err(|e| ManagerError::Cleanup(CleanupError::Discovery(anyhow::anyhow!(e))))?;
        }

        if !pending.is_empty() {
            stream::iter(pending.iter())
                .for_each_concurrent(SWEEP_FANOUT, |ns| async move {
                    if let Err(e) = ns_ops.delete_namespace(ns).await {
                        tracing::debug!(namespace = %ns, error = %e, "namespace delete failed");
                    }
                    if let Err(e) = ns_ops.finalize_namespace(ns).await {
                        tracing::debug!(namespace = %ns, error = %e, "namespace finalize failed");
                    }
                })
                .await;

            if Instant::now() >= deadline {
                return Err(ManagerError::Cleanup(CleanupError::ContextExpired));
            }
            tokio::time::sleep(NAMESPACE_SWEEP_POLL).await;
            continue;
        }

        // One empty read is enough: reads are strongly consistent with the
        // watch-cache disabled, so there is nothing further to converge on.
        return Ok(());
    }

    Err(ManagerError::Cleanup(CleanupError::NotConverged(
        NAMESPACE_SWEEP_MAX_ITERATIONS,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use services::namespaces::NamespaceError;
    use services::resources::ResourceError;

    /// Shrinks its namespace list by one on every call to `list_user_namespaces`,
    /// simulating namespaces disappearing as deletes land.
    struct ShrinkingNamespaces {
        remaining: Mutex<Vec<String>>,
        delete_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl NamespaceOps for ShrinkingNamespaces {
        async fn list_user_namespaces(&self) -> Result<Vec<String>, NamespaceError> {
            Ok(self.remaining.lock().unwrap().clone())
        }
        async fn delete_namespace(&self, name: &str) -> Result<(), NamespaceError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            self.remaining.lock().unwrap().retain(|n| n != name);
            Ok(())
        }
        async fn finalize_namespace(&self, _name: &str) -> Result<(), NamespaceError> {
            Ok(())
        }
    }

    struct NeverEmptyNamespaces;

    #[async_trait::async_trait]
    impl NamespaceOps for NeverEmptyNamespaces {
        async fn list_user_namespaces(&self) -> Result<Vec<String>, NamespaceError> {
            Ok(vec!["stuck-ns".to_string()])
        }
        async fn delete_namespace(&self, _name: &str) -> Result<(), NamespaceError> {
            Ok(())
        }
        async fn finalize_namespace(&self, _name: &str) -> Result<(), NamespaceError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn clean_namespaces_converges_once_the_list_empties() {
        let ops = ShrinkingNamespaces {
            remaining: Mutex::new(vec!["a".to_string(), "b".to_string()]),
            delete_calls: AtomicUsize::new(0),
        };
        let result = clean_namespaces(
            &ops,
            vec!["a".to_string(), "b".to_string()],
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_ok());
        assert!(ops.delete_calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn clean_namespaces_gives_up_after_the_iteration_cap() {
        let ops = NeverEmptyNamespaces;
        let result = clean_namespaces(&ops, vec!["stuck-ns".to_string()], Duration::from_secs(30)).await;
        assert!(matches!(
            result,
            Err(ManagerError::Cleanup(CleanupError::NotConverged(n))) if n == NAMESPACE_SWEEP_MAX_ITERATIONS
        ));
    }

    /// Records every (kind, namespace) pair a DeleteCollection was issued against;
    /// everything else is a no-op success.
    struct RecordingResourceOps {
        all: Vec<(String, String)>,
        delete_collection_calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ResourceOps for RecordingResourceOps {
        async fn discover_namespaced_resources(&self) -> Result<Vec<DeletableResource>, ResourceError> {
            unreachable!("not exercised by this test")
        }
        async fn list_names(
            &self,
            _resource: &DeletableResource,
            _namespace: &str,
        ) -> Result<Vec<String>, ResourceError> {
            Ok(Vec::new())
        }
        async fn delete_collection(
            &self,
            _resource: &DeletableResource,
            namespace: &str,
        ) -> Result<bool, ResourceError> {
            self.delete_collection_calls
                .lock()
                .unwrap()
                .push(namespace.to_string());
            Ok(true)
        }
        async fn delete_one(
            &self,
            _resource: &DeletableResource,
            _namespace: &str,
            _name: &str,
        ) -> Result<(), ResourceError> {
            Ok(())
        }
        async fn clear_finalizers(
            &self,
            _resource: &DeletableResource,
            _namespace: &str,
            _name: &str,
        ) -> Result<(), ResourceError> {
            Ok(())
        }
        async fn list_all(&self, _resource: &DeletableResource) -> Result<Vec<(String, String)>, ResourceError> {
            Ok(self.all.clone())
        }
    }

    fn configmap_resource() -> DeletableResource {
        DeletableResource {
            group: String::new(),
            version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            plural: "configmaps".to_string(),
        }
    }

    #[tokio::test]
    async fn sweep_skips_namespaces_outside_the_user_set() {
        let ops = RecordingResourceOps {
            all: vec![
                ("tenant-a".to_string(), "cm-1".to_string()),
                ("kube-system".to_string(), "cm-2".to_string()),
            ],
            delete_collection_calls: Mutex::new(Vec::new()),
        };
        let user_namespaces: HashSet<&str> = ["tenant-a"].into_iter().collect();

        sweep_one_resource_type(&ops, &configmap_resource(), &user_namespaces)
            .await
            .unwrap();

        let calls = ops.delete_collection_calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["tenant-a"]);
    }

    #[tokio::test]
    async fn sweep_is_a_no_op_when_nothing_belongs_to_a_user_namespace() {
        let ops = RecordingResourceOps {
            all: vec![("kube-system".to_string(), "cm-2".to_string())],
            delete_collection_calls: Mutex::new(Vec::new()),
        };
        let user_namespaces: HashSet<&str> = ["tenant-a"].into_iter().collect();

        sweep_one_resource_type(&ops, &configmap_resource(), &user_namespaces)
            .await
            .unwrap();

        assert!(ops.delete_collection_calls.lock().unwrap().is_empty());
    }
}
