//! Launches and tears down the two-process backend (kine, then kube-apiserver) one
//! Instance owns. Port allocation, readiness polling and process-group teardown are
//! all on this path; the system-namespace wait that gates Instance::Start is not —
//! that belongs to the caller, since it needs a live Kubernetes client the stack
//! itself has no reason to hold.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::Command;

use utils::port_registry::PortRegistry;

const STOP_GRACE: Duration = Duration::from_secs(5);
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("failed to allocate ports: {0}")]
    PortAllocation(#[source] utils::port_registry::PortRegistryError),
    #[error("failed to spawn {process}: {source}")]
    Spawn {
        process: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{process} did not become ready within the readiness deadline")]
    ReadinessTimeout { process: &'static str },
    #[error("failed to write kubeconfig to {path}: {source}")]
    WriteKubeconfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to stop {process}: {source}")]
    Stop {
        process: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Static, per-Instance configuration the supervisor needs for one Start attempt.
/// Binary paths, the template database and timeouts come from the Instance's
/// immutable configuration; the data directory and kubeconfig path are this
/// Instance's own locations.
#[derive(Clone)]
pub struct StackConfig {
    pub data_dir: PathBuf,
    pub storage_path: PathBuf,
    pub kubeconfig_path: PathBuf,
    pub kine_binary: PathBuf,
    pub apiserver_binary: PathBuf,
    pub template_db_path: Option<PathBuf>,
    pub storage_ready_timeout: Duration,
    pub apiserver_ready_timeout: Duration,
    pub port_registry: Arc<PortRegistry>,
}

/// A live, owned process pair. `stop` is safe to call more than once logically
/// (the caller is expected not to reuse a handle after a successful stop, but the
/// underlying kill calls tolerate an already-exited process).
pub struct StackHandle {
    storage: AsyncGroupChild,
    apiserver: AsyncGroupChild,
    storage_port: u16,
    apiserver_port: u16,
}

impl StackHandle {
    pub fn apiserver_port(&self) -> u16 {
        self.apiserver_port
    }

    pub fn storage_port(&self) -> u16 {
        self.storage_port
    }

    /// Stops the API server then the storage process, escalating SIGTERM to
    /// SIGKILL if either ignores the grace period. Ports are released back to the
    /// registry regardless of outcome.
    pub async fn stop(
        &mut self,
        timeout: Duration,
        registry: &PortRegistry,
    ) -> Result<(), StackError> {
        let per_process = std::cmp::max(timeout / 2, Duration::from_millis(50));
        let apiserver_result = kill_process_group(&mut self.apiserver, "kube-apiserver", per_process).await;
        let storage_result = kill_process_group(&mut self.storage, "kine", per_process).await;
        registry.release(self.apiserver_port);
        registry.release(self.storage_port);
        apiserver_result?;
        storage_result?;
        Ok(())
    }
}

/// Sends SIGTERM to the whole process group, waits up to `timeout`, then SIGKILL if
/// it is still alive. Grounded on the same escalation shape as killing an
/// Instance's process group elsewhere in this codebase's ancestry: try a clean
/// shutdown first, never block teardown indefinitely on an uncooperative child.
async fn kill_process_group(
    child: &mut AsyncGroupChild,
    process: &'static str,
    timeout: Duration,
) -> Result<(), StackError> {
    let Some(pid) = child.id() else {
        // already reaped
        return Ok(());
    };
    let pgid = Pid::from_raw(pid as i32);

    let _ = signal::killpg(pgid, Signal::SIGTERM);

    let wait = tokio::time::timeout(timeout, child.wait());
    match wait.await {
        Ok(Ok(_)) => return Ok(()),
        Ok(Err(source)) => return Err(StackError::Stop { process, source }),
        Err(_) => {}
    }

    let _ = signal::killpg(pgid, Signal::SIGKILL);
    child
        .wait()
        .await
        .map(|_| ())
        .map_err(|source| StackError::Stop { process, source })
}

/// `Start` is invoked once per attempt by the caller's retry loop; a failed
/// attempt must leave nothing running. `stop_timeout` bounds a cleanup-on-failure
/// teardown the same way it bounds a normal Stop.
#[async_trait]
pub trait ProcessStackSupervisor: Send + Sync {
    async fn start(
        &self,
        config: &StackConfig,
        readiness_deadline: Instant,
        stop_timeout: Duration,
    ) -> Result<StackHandle, StackError>;
}

#[derive(Debug, Default)]
pub struct RealProcessStackSupervisor;

#[async_trait]
impl ProcessStackSupervisor for RealProcessStackSupervisor {
    async fn start(
        &self,
        config: &StackConfig,
        readiness_deadline: Instant,
        stop_timeout: Duration,
    ) -> Result<StackHandle, StackError> {
        std::fs::create_dir_all(&config.data_dir).ok();

        let (storage_port, apiserver_port) = config
            .port_registry
            .allocate_pair()
            .map_err(StackError::PortAllocation)?;

        if let Some(template) = &config.template_db_path {
            if let Some(parent) = config.storage_path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let _ = std::fs::copy(template, &config.storage_path);
        }

        let mut storage = spawn_storage(config, storage_port)?;

        if let Err(e) = wait_tcp_ready(storage_port, config.storage_ready_timeout).await {
            let _ = kill_process_group(&mut storage, "kine", stop_timeout).await;
            config.port_registry.release(storage_port);
            config.port_registry.release(apiserver_port);
            return Err(e);
        }

        let mut apiserver = match spawn_apiserver(config, storage_port, apiserver_port) {
            Ok(child) => child,
            Err(e) => {
                let _ = kill_process_group(&mut storage, "kine", stop_timeout).await;
                config.port_registry.release(storage_port);
                config.port_registry.release(apiserver_port);
                return Err(e);
            }
        };

        let remaining = readiness_deadline.saturating_duration_since(Instant::now());
        let apiserver_timeout = std::cmp::min(remaining, config.apiserver_ready_timeout);
        if let Err(e) = wait_http_ready(apiserver_port, apiserver_timeout).await {
            let _ = kill_process_group(&mut apiserver, "kube-apiserver", stop_timeout).await;
            let _ = kill_process_group(&mut storage, "kine", stop_timeout).await;
            config.port_registry.release(storage_port);
            config.port_registry.release(apiserver_port);
            return Err(e);
        }

        write_kubeconfig(&config.kubeconfig_path, apiserver_port)
            .await
            .map_err(|source| StackError::WriteKubeconfig {
                path: config.kubeconfig_path.clone(),
                source,
            })?;

        Ok(StackHandle {
            storage,
            apiserver,
            storage_port,
            apiserver_port,
        })
    }
}

fn spawn_storage(config: &StackConfig, port: u16) -> Result<AsyncGroupChild, StackError> {
    Command::new(&config.kine_binary)
        .arg(format!("--listen-address=0.0.0.0:{port}"))
        .arg(format!(
            "--endpoint=sqlite://{}",
            config.storage_path.display()
        ))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .group_spawn()
        .map_err(|source| StackError::Spawn {
            process: "kine",
            source,
        })
}

fn spawn_apiserver(
    config: &StackConfig,
    storage_port: u16,
    apiserver_port: u16,
) -> Result<AsyncGroupChild, StackError> {
    Command::new(&config.apiserver_binary)
        .arg(format!("--secure-port={apiserver_port}"))
        .arg(format!(
            "--etcd-servers=http://127.0.0.1:{storage_port}"
        ))
        .arg("--service-cluster-ip-range=10.96.0.0/16")
        .arg("--authorization-mode=AlwaysAllow")
        .arg("--anonymous-auth=true")
        .arg(format!(
            "--kubeconfig-output={}",
            config.kubeconfig_path.display()
        ))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .group_spawn()
        .map_err(|source| StackError::Spawn {
            process: "kube-apiserver",
            source,
        })
}

async fn wait_tcp_ready(port: u16, timeout: Duration) -> Result<(), StackError> {
    let deadline = Instant::now() + timeout;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(StackError::ReadinessTimeout { process: "kine" });
        }
        tokio::time::sleep(READINESS_POLL_INTERVAL).await;
    }
}

async fn wait_http_ready(port: u16, timeout: Duration) -> Result<(), StackError> {
    let deadline = Instant::now() + timeout;
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .expect("static client config always builds");
    let url = format!("https://127.0.0.1:{port}/livez");
    loop {
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().as_u16() == 200 {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(StackError::ReadinessTimeout {
                process: "kube-apiserver",
            });
        }
        tokio::time::sleep(READINESS_POLL_INTERVAL).await;
    }
}

async fn write_kubeconfig(path: &Path, apiserver_port: u16) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let contents = format!(
        "apiVersion: v1\n\
kind: Config\n\
clusters:\n\
- cluster:\n    server: https://127.0.0.1:{apiserver_port}\n    insecure-skip-tls-verify: true\n  name: harness\n\
contexts:\n\
- context:\n    cluster: harness\n    user: harness\n  name: harness\n\
current-context: harness\n\
users:\n\
- name: harness\n  user: {{}}\n"
    );
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(contents.as_bytes()).await?;
    Ok(())
}

/// `STOP_GRACE` is the default grace period Instance::Stop falls back to when the
/// caller's own StopTimeout has already been exhausted; kept as a named floor
/// rather than an inline magic number.
pub fn default_stop_grace() -> Duration {
    STOP_GRACE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stop_grace_matches_the_named_floor() {
        assert_eq!(default_stop_grace(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn wait_tcp_ready_returns_once_something_is_listening() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept in the background so the connect in wait_tcp_ready completes rather
        // than piling up in the listener's backlog unacknowledged.
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        wait_tcp_ready(port, Duration::from_secs(2))
            .await
            .expect("a listening socket must satisfy readiness");
    }

    #[tokio::test]
    async fn wait_tcp_ready_times_out_when_nothing_listens() {
        // Port 0 never resolves to a connectable listener, so every attempt in the
        // loop fails immediately and the short timeout is what ends it.
        let err = wait_tcp_ready(0, Duration::from_millis(120)).await.unwrap_err();
        assert!(matches!(err, StackError::ReadinessTimeout { process: "kine" }));
    }
}
