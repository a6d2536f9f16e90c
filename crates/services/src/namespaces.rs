//! Namespace-level primitives for the Clean release strategy: listing user
//! namespaces and tearing one down once it is empty.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ListParams};
use kube::Client;

use utils::config::SYSTEM_NAMESPACES;

#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    #[error("failed to list namespaces: {0}")]
    List(#[source] kube::Error),
    #[error("failed to delete namespace {name}: {source}")]
    Delete {
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("failed to finalize namespace {name}: {source}")]
    Finalize {
        name: String,
        #[source]
        source: kube::Error,
    },
}

#[async_trait]
pub trait NamespaceOps: Send + Sync {
    /// Namespace names present on the apiserver, excluding the fixed system set.
    async fn list_user_namespaces(&self) -> Result<Vec<String>, NamespaceError>;

    /// Issues the namespace delete with an immediate grace period. Returns without
    /// error whether or not the namespace had already been removed.
    async fn delete_namespace(&self, name: &str) -> Result<(), NamespaceError>;

    /// Clears the `spec.finalizers` list via the `finalize` subresource, unsticking a
    /// namespace parked in `Terminating` with no finalizing controller left to ack it.
    async fn finalize_namespace(&self, name: &str) -> Result<(), NamespaceError>;
}

pub struct KubeNamespaceOps {
    client: Client,
}

impl KubeNamespaceOps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl NamespaceOps for KubeNamespaceOps {
    async fn list_user_namespaces(&self) -> Result<Vec<String>, NamespaceError> {
        let list = self
            .api()
            .list(&ListParams::default())
            .await
            .map_err(NamespaceError::List)?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .filter(|name| !SYSTEM_NAMESPACES.contains(&name.as_str()))
            .collect())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), NamespaceError> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        match self.api().delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(source) => Err(NamespaceError::Delete {
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn finalize_namespace(&self, name: &str) -> Result<(), NamespaceError> {
        // No generic subresource helper covers `/finalize`; issue it as a raw request
        // against the same client the typed API wraps, mirroring how `Api` builds its
        // own request paths.
        let body = serde_json::to_vec(&serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name },
            "spec": { "finalizers": [] }
        }))
        .expect("static namespace finalize payload always serializes");

        let request = http::Request::put(format!("/api/v1/namespaces/{name}/finalize"))
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body)
            .expect("static namespace finalize request always builds");

        match self.client.request::<Namespace>(request).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(source) => Err(NamespaceError::Finalize {
                name: name.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_namespaces_are_filtered_by_construction() {
        let names = vec![
            "default".to_string(),
            "kube-system".to_string(),
            "team-a".to_string(),
        ];
        let user: Vec<_> = names
            .into_iter()
            .filter(|n| !SYSTEM_NAMESPACES.contains(&n.as_str()))
            .collect();
        assert_eq!(user, vec!["team-a".to_string()]);
    }
}
