//! Builds the read-only template database: a throwaway stack gets started once,
//! the declarative resources under a CRD directory are applied and waited on until
//! "established", and the resulting storage file is copied out to a
//! content-addressed cache path so repeat runs over the same CRD set skip the
//! apply step entirely.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use utils::port_registry::PortRegistry;

use crate::stack::{ProcessStackSupervisor, StackConfig, StackError};

#[derive(Debug, thiserror::Error)]
pub enum CrdCacheError {
    #[error("no YAML files found under {0}")]
    NoYamlFiles(PathBuf),
    #[error("manifest {path} is missing a kind field")]
    MissingKind { path: PathBuf },
    #[error("CRDs did not reach Established within the configured timeout")]
    EstablishTimeout,
    #[error("failed to start throwaway stack: {0}")]
    Stack(#[from] StackError),
    #[error("failed to apply manifest {path}: {source}")]
    Apply {
        path: PathBuf,
        #[source]
        source: kube::Error,
    },
    #[error("failed to read CRD directory {0}: {1}")]
    ReadDir(PathBuf, std::io::Error),
    #[error("failed to copy template database: {0}")]
    Copy(#[source] std::io::Error),
}

pub struct CrdCacheConfig {
    pub crd_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub kine_binary: PathBuf,
    pub apiserver_binary: PathBuf,
    pub timeout: Duration,
    pub stop_timeout: Duration,
    pub port_registry: Arc<PortRegistry>,
}

#[async_trait]
pub trait CrdCacheBuilder: Send + Sync {
    async fn ensure_cache(&self, config: &CrdCacheConfig) -> Result<PathBuf, CrdCacheError>;
}

pub struct FileCrdCacheBuilder<S: ProcessStackSupervisor> {
    supervisor: S,
}

impl<S: ProcessStackSupervisor> FileCrdCacheBuilder<S> {
    pub fn new(supervisor: S) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl<S: ProcessStackSupervisor + 'static> CrdCacheBuilder for FileCrdCacheBuilder<S> {
    async fn ensure_cache(&self, config: &CrdCacheConfig) -> Result<PathBuf, CrdCacheError> {
        let manifests = collect_yaml_files(&config.crd_dir)?;
        if manifests.is_empty() {
            return Err(CrdCacheError::NoYamlFiles(config.crd_dir.clone()));
        }

        let digest = content_hash(&manifests)?;
        let cache_path = config.cache_dir.join(format!("{digest}.db"));
        if cache_path.exists() {
            tracing::debug!(path = %cache_path.display(), "template database cache hit");
            return Ok(cache_path);
        }

        std::fs::create_dir_all(&config.cache_dir).ok();
        let work_dir = config.cache_dir.join(format!(".build-{digest}"));
        std::fs::create_dir_all(&work_dir).ok();

        let stack_config = StackConfig {
            data_dir: work_dir.clone(),
            storage_path: work_dir.join("state.db"),
            kubeconfig_path: work_dir.join("kubeconfig.yaml"),
            kine_binary: config.kine_binary.clone(),
            apiserver_binary: config.apiserver_binary.clone(),
            template_db_path: None,
            storage_ready_timeout: config.timeout,
            apiserver_ready_timeout: config.timeout,
            port_registry: config.port_registry.clone(),
        };

        let deadline = Instant::now() + config.timeout;
        let mut handle = self.supervisor.start(&stack_config, deadline, config.stop_timeout).await?;

        let apply_result = apply_and_wait_established(
            &stack_config.kubeconfig_path,
            &manifests,
            deadline,
        )
        .await;

        let stop_result = handle.stop(config.stop_timeout, &config.port_registry).await;
        if let Err(e) = stop_result {
            tracing::warn!(error = %e, "throwaway CRD-cache stack failed to stop cleanly");
        }

        apply_result?;

        std::fs::copy(&stack_config.storage_path, &cache_path).map_err(CrdCacheError::Copy)?;
        let _ = std::fs::remove_dir_all(&work_dir);

        tracing::info!(path = %cache_path.display(), "built template database");
        Ok(cache_path)
    }
}

fn collect_yaml_files(dir: &Path) -> Result<Vec<PathBuf>, CrdCacheError> {
    let mut out = Vec::new();
    let entries =
        std::fs::read_dir(dir).map_err(|e| CrdCacheError::ReadDir(dir.to_path_buf(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CrdCacheError::ReadDir(dir.to_path_buf(), e))?;
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if is_yaml {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn content_hash(manifests: &[PathBuf]) -> Result<String, CrdCacheError> {
    let mut hasher = Sha256::new();
    for path in manifests {
        let bytes = std::fs::read(path).map_err(|e| CrdCacheError::ReadDir(path.clone(), e))?;
        hasher.update(&bytes);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

async fn apply_and_wait_established(
    kubeconfig_path: &Path,
    manifests: &[PathBuf],
    deadline: Instant,
) -> Result<(), CrdCacheError> {
    let kubeconfig = kube::config::Kubeconfig::read_from(kubeconfig_path)
        .map_err(|_| CrdCacheError::EstablishTimeout)?;
    let client_config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &kube::config::KubeConfigOptions::default())
            .await
            .map_err(|_| CrdCacheError::EstablishTimeout)?;
    let client = kube::Client::try_from(client_config).map_err(|_| CrdCacheError::EstablishTimeout)?;

    let mut crd_names = Vec::new();
    for path in manifests {
        let text = std::fs::read_to_string(path).map_err(|e| CrdCacheError::ReadDir(path.clone(), e))?;
        let value: serde_json::Value = serde_yaml_to_json(&text);
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| CrdCacheError::MissingKind { path: path.clone() })?;

        if kind == "CustomResourceDefinition" {
            if let Some(name) = value
                .get("metadata")
                .and_then(|m| m.get("name"))
                .and_then(|n| n.as_str())
            {
                crd_names.push(name.to_string());
            }
        }

        apply_dynamic(&client, &value)
            .await
            .map_err(|source| CrdCacheError::Apply {
                path: path.clone(),
                source,
            })?;
    }

    wait_crds_established(&client, &crd_names, deadline).await
}

/// YAML and JSON are both accepted by the apiserver; manifests on disk are YAML, so
/// this is a thin reparse through `serde_yaml` rather than a hand-rolled parser.
fn serde_yaml_to_json(text: &str) -> serde_json::Value {
    serde_yaml::from_str::<serde_json::Value>(text).unwrap_or(serde_json::Value::Null)
}

/// English-plural heuristic good enough for the built-in CRD manifests this harness
/// applies; exotic irregular kinds are a problem for whoever names their CRD that way.
fn naive_plural(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with('x') {
        format!("{lower}es")
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

async fn apply_dynamic(client: &kube::Client, value: &serde_json::Value) -> Result<(), kube::Error> {
    use kube::api::{Api, DynamicObject, Patch, PatchParams, ResourceExt};
    use kube::discovery::ApiResource;

    let kind = value["kind"].as_str().unwrap_or_default();
    let api_version = value["apiVersion"].as_str().unwrap_or_default();
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    let plural = naive_plural(kind);
    let ar = ApiResource {
        group,
        version,
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        plural,
    };

    let obj: DynamicObject = serde_json::from_value(value.clone())?;
    let namespace = obj.namespace();

    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), &ns, &ar),
        None => Api::all_with(client.clone(), &ar),
    };

    let name = obj.name_any();
    let params = PatchParams::apply("crd-cache-builder").force();
    api.patch(&name, &params, &Patch::Apply(&obj)).await?;
    Ok(())
}

async fn wait_crds_established(
    client: &kube::Client,
    crd_names: &[String],
    deadline: Instant,
) -> Result<(), CrdCacheError> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::Api;

    if crd_names.is_empty() {
        return Ok(());
    }
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());

    loop {
        let mut all_established = true;
        for name in crd_names {
            let crd = api.get(name).await.map_err(|_| CrdCacheError::EstablishTimeout)?;
            let established = crd
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .map(|conds| {
                    conds
                        .iter()
                        .any(|c| c.type_ == "Established" && c.status == "True")
                })
                .unwrap_or(false);
            if !established {
                all_established = false;
                break;
            }
        }
        if all_established {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(CrdCacheError::EstablishTimeout);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naive_plural_handles_the_common_english_cases() {
        assert_eq!(naive_plural("Widget"), "widgets");
        assert_eq!(naive_plural("Proxy"), "proxies");
        assert_eq!(naive_plural("Gateway"), "gateways");
        assert_eq!(naive_plural("Class"), "classes");
        assert_eq!(naive_plural("Match"), "matches");
        assert_eq!(naive_plural("Box"), "boxes");
    }

    #[test]
    fn collect_yaml_files_finds_only_yaml_extensions_in_sorted_order() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("b.yaml"), "b").unwrap();
        std::fs::write(tmp.path().join("a.yml"), "a").unwrap();
        std::fs::write(tmp.path().join("readme.md"), "ignore me").unwrap();

        let files = collect_yaml_files(tmp.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.yml", "b.yaml"]);
    }

    #[test]
    fn collect_yaml_files_errors_on_a_missing_directory() {
        let err = collect_yaml_files(std::path::Path::new("/no/such/crd-dir")).unwrap_err();
        assert!(matches!(err, CrdCacheError::ReadDir(_, _)));
    }

    #[test]
    fn content_hash_is_stable_and_order_sensitive() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.yaml");
        let b = tmp.path().join("b.yaml");
        std::fs::write(&a, "kind: Foo").unwrap();
        std::fs::write(&b, "kind: Bar").unwrap();

        let first = content_hash(&[a.clone(), b.clone()]).unwrap();
        let second = content_hash(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(first, second, "hashing the same files twice must be stable");

        let swapped = content_hash(&[b, a]).unwrap();
        assert_ne!(first, swapped, "file order is part of the cache key");
    }
}
