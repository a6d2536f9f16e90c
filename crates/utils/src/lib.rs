pub mod config;
pub mod error;
pub mod port_registry;
pub mod retry;

pub use config::{HarnessConfig, ReleaseStrategy};
pub use error::{
    CleanupError, CrdCacheFailureKind, InitError, InstanceError, ManagerError, StartupError,
};
pub use port_registry::PortRegistry;
