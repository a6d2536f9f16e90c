//! Kubernetes API-client collaborator: builds the cached per-acquisition clients an
//! Instance needs and exposes the primitive list/delete/discovery operations the
//! Clean release strategy's sweep algorithm (owned by `core`) drives.
//!
//! This crate is the "Kubernetes API-client library" the specification treats as an
//! external collaborator: it is a real, usable implementation (backed by `kube`), but
//! the cleanup *algorithm* — fan-out, iteration caps, finalizer handling — lives in
//! `core`, which only calls the primitives here.

pub mod client;
pub mod namespaces;
pub mod resources;

pub use client::{CachedClients, ClientError, KubeClientFactory, KubeRsClientFactory};
pub use namespaces::NamespaceOps;
pub use resources::{DeletableResource, ResourceOps};
