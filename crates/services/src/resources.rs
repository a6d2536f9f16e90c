//! Primitive, per-resource-type operations the Clean release strategy's sweep
//! algorithm drives. Discovery, listing, deletion and finalizer-stripping are each one
//! call; the fan-out across resource types, the iteration cap, and the decision to
//! fall back from a collection delete to per-object deletes all live in `core`.

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::{verbs, Discovery};
use kube::Client;

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("discovery failed: {0}")]
    Discovery(#[source] kube::Error),
    #[error("list failed for {kind}: {source}")]
    List {
        kind: String,
        #[source]
        source: kube::Error,
    },
    #[error("delete-collection failed for {kind}: {source}")]
    DeleteCollection {
        kind: String,
        #[source]
        source: kube::Error,
    },
    #[error("delete failed for {kind}/{name}: {source}")]
    Delete {
        kind: String,
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("finalizer patch failed for {kind}/{name}: {source}")]
    Finalize {
        kind: String,
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// A namespaced, deletable resource type discovered from the apiserver's preferred
/// API versions. Two instances are the same resource type iff group+version+kind
/// match, regardless of where discovery found them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeletableResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl DeletableResource {
    fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: if self.group.is_empty() {
                self.version.clone()
            } else {
                format!("{}/{}", self.group, self.version)
            },
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

#[async_trait]
pub trait ResourceOps: Send + Sync {
    /// Every namespaced resource type in the apiserver's preferred versions that
    /// supports both `list` and `delete`. Resource types that support only a subset
    /// of verbs (most commonly a read-only aggregated view) are skipped.
    async fn discover_namespaced_resources(
        &self,
    ) -> Result<Vec<DeletableResource>, ResourceError>;

    /// Object names currently present for `resource` in `namespace`.
    async fn list_names(
        &self,
        resource: &DeletableResource,
        namespace: &str,
    ) -> Result<Vec<String>, ResourceError>;

    /// Attempts a single DeleteCollection call. `Ok(true)` means the apiserver
    /// accepted it; `Ok(false)` means the resource type does not support
    /// DeleteCollection and the caller should fall back to per-object deletes.
    async fn delete_collection(
        &self,
        resource: &DeletableResource,
        namespace: &str,
    ) -> Result<bool, ResourceError>;

    /// Deletes one object by name. A `NotFound` response is treated as success.
    async fn delete_one(
        &self,
        resource: &DeletableResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ResourceError>;

    /// Clears `metadata.finalizers` on one object so a stuck terminating delete can
    /// complete. Used only after an object has been observed present for more than
    /// one sweep iteration.
    async fn clear_finalizers(
        &self,
        resource: &DeletableResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ResourceError>;

    /// Cluster-wide `(namespace, name)` pairs for every object of this resource
    /// type, used to fast-reject namespaces that hold nothing of this type before
    /// issuing a DeleteCollection against them.
    async fn list_all(
        &self,
        resource: &DeletableResource,
    ) -> Result<Vec<(String, String)>, ResourceError>;
}

pub struct KubeResourceOps {
    client: Client,
}

impl KubeResourceOps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &DeletableResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &resource.api_resource())
    }
}

#[async_trait]
impl ResourceOps for KubeResourceOps {
    async fn discover_namespaced_resources(
        &self,
    ) -> Result<Vec<DeletableResource>, ResourceError> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(ResourceError::Discovery)?;

        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if !caps.scope.eq(&kube::discovery::Scope::Namespaced) {
                    continue;
                }
                if !caps.supports_operation(verbs::LIST) || !caps.supports_operation(verbs::DELETE)
                {
                    continue;
                }
                out.push(DeletableResource {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    plural: ar.plural.clone(),
                });
            }
        }
        Ok(out)
    }

    async fn list_names(
        &self,
        resource: &DeletableResource,
        namespace: &str,
    ) -> Result<Vec<String>, ResourceError> {
        let api = self.api(resource, namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|source| ResourceError::List {
                kind: resource.kind.clone(),
                source,
            })?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|o| o.metadata.name)
            .collect())
    }

    async fn delete_collection(
        &self,
        resource: &DeletableResource,
        namespace: &str,
    ) -> Result<bool, ResourceError> {
        let api = self.api(resource, namespace);
        match api
            .delete_collection(&DeleteParams::default(), &ListParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 405 => Ok(false),
            Err(source) => Err(ResourceError::DeleteCollection {
                kind: resource.kind.clone(),
                source,
            }),
        }
    }

    async fn delete_one(
        &self,
        resource: &DeletableResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ResourceError> {
        let api = self.api(resource, namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(source) => Err(ResourceError::Delete {
                kind: resource.kind.clone(),
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn clear_finalizers(
        &self,
        resource: &DeletableResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ResourceError> {
        let api = self.api(resource, namespace);
        let patch = serde_json::json!({ "metadata": { "finalizers": [] } });
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
        .map(|_| ())
        .or_else(|e| match e {
            kube::Error::Api(resp) if resp.code == 404 => Ok(()),
            source => Err(ResourceError::Finalize {
                kind: resource.kind.clone(),
                name: name.to_string(),
                source,
            }),
        })
    }

    async fn list_all(
        &self,
        resource: &DeletableResource,
    ) -> Result<Vec<(String, String)>, ResourceError> {
        let api: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &resource.api_resource());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|source| ResourceError::List {
                kind: resource.kind.clone(),
                source,
            })?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|o| {
                let ns = o.metadata.namespace?;
                let name = o.metadata.name?;
                Some((ns, name))
            })
            .collect())
    }
}
