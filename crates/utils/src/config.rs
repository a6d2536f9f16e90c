//! Immutable-after-construction harness configuration.
//!
//! Validation is defensive and panics on programmer error, matching the teacher's
//! posture of checking database integrity before a pool is ever built rather than
//! returning a `Result` a caller could paper over.

use std::path::PathBuf;
use std::time::Duration;

/// Reconditioning policy applied to an Instance on Release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStrategy {
    /// Hard restart of the process stack.
    Restart,
    /// API-driven cleanup: delete user namespaces and their resources.
    Clean,
    /// Direct-storage purge via a single prepared DELETE.
    Purge,
    /// No cleanup at all.
    None,
}

/// System namespaces that cleanup never deletes.
pub const SYSTEM_NAMESPACES: [&str; 4] =
    ["default", "kube-system", "kube-public", "kube-node-lease"];

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub kine_binary: PathBuf,
    pub apiserver_binary: PathBuf,
    pub acquire_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub cleanup_timeout: Duration,
    pub crd_cache_timeout: Duration,
    pub shutdown_drain_timeout: Duration,
    /// 0 means unbounded.
    pub pool_size: u32,
    pub release_strategy: ReleaseStrategy,
    pub base_data_dir: PathBuf,
    pub crd_dir: Option<PathBuf>,
    pub template_db_path: Option<PathBuf>,
    pub max_start_retries: u32,
}

impl HarnessConfig {
    pub fn new(kine_binary: PathBuf, apiserver_binary: PathBuf) -> Self {
        let config = Self {
            kine_binary,
            apiserver_binary,
            acquire_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            cleanup_timeout: Duration::from_secs(20),
            crd_cache_timeout: Duration::from_secs(60),
            shutdown_drain_timeout: Duration::from_secs(15),
            pool_size: 0,
            release_strategy: ReleaseStrategy::Restart,
            base_data_dir: std::env::temp_dir().join("kube-harness"),
            crd_dir: None,
            template_db_path: None,
            max_start_retries: 3,
        };
        config.validate();
        config
    }

    pub fn with_pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self.validate();
        self
    }

    pub fn with_release_strategy(mut self, strategy: ReleaseStrategy) -> Self {
        self.release_strategy = strategy;
        self
    }

    pub fn with_base_data_dir(mut self, dir: PathBuf) -> Self {
        self.base_data_dir = dir;
        self
    }

    pub fn with_crd_dir(mut self, dir: PathBuf) -> Self {
        self.crd_dir = Some(dir);
        self
    }

    /// Panics on any programmer-supplied invalid value. Never returns an error:
    /// there is no recovery a caller can take other than fixing the config.
    pub fn validate(&self) {
        assert!(
            !self.acquire_timeout.is_zero(),
            "AcquireTimeout must be positive"
        );
        assert!(
            !self.start_timeout.is_zero(),
            "StartTimeout must be positive"
        );
        assert!(
            !self.stop_timeout.is_zero(),
            "StopTimeout must be positive"
        );
        assert!(
            !self.cleanup_timeout.is_zero(),
            "CleanupTimeout must be positive"
        );
        assert!(
            !self.crd_cache_timeout.is_zero(),
            "CRDCacheTimeout must be positive"
        );
        assert!(
            !self.shutdown_drain_timeout.is_zero(),
            "ShutdownDrainTimeout must be positive"
        );
        assert!(self.max_start_retries > 0, "max_start_retries must be > 0");
    }
}
