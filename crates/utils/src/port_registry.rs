//! Process-wide registry of reserved loopback ports.
//!
//! Shared by every Instance and by the CRD cache builder's throwaway stack so that
//! two concurrently-starting stacks never race each other onto the same port.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

const ALLOCATE_RETRIES: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum PortRegistryError {
    #[error("failed to bind an ephemeral port: {0}")]
    Bind(#[source] std::io::Error),
    #[error("could not allocate two distinct free ports after {0} attempts")]
    NoDistinctPair(u32),
}

#[derive(Default)]
pub struct PortRegistry {
    reserved: Mutex<HashSet<u16>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self {
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Inserts `port` if absent. Returns whether the reservation was newly made.
    pub fn reserve(&self, port: u16) -> bool {
        self.reserved.lock().unwrap().insert(port)
    }

    pub fn release(&self, port: u16) {
        self.reserved.lock().unwrap().remove(&port);
    }

    fn allocate_one(&self) -> Result<u16, PortRegistryError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(PortRegistryError::Bind)?;
        let port = listener
            .local_addr()
            .map_err(PortRegistryError::Bind)?
            .port();
        drop(listener);
        Ok(port)
    }

    /// Allocates two distinct, currently-unreserved ephemeral ports and reserves both.
    pub fn allocate_pair(&self) -> Result<(u16, u16), PortRegistryError> {
        for _ in 0..ALLOCATE_RETRIES {
            let a = self.allocate_one()?;
            let b = self.allocate_one()?;
            if a == b {
                tracing::debug!(port = a, "allocate_pair: kernel handed back the same port twice");
                continue;
            }
            let mut guard = self.reserved.lock().unwrap();
            if guard.contains(&a) || guard.contains(&b) {
                tracing::debug!(a, b, "allocate_pair: close-race against an existing reservation");
                continue;
            }
            guard.insert(a);
            guard.insert(b);
            return Ok((a, b));
        }
        Err(PortRegistryError::NoDistinctPair(ALLOCATE_RETRIES))
    }
}
