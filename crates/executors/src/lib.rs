//! Process-stack supervision: launching and tearing down the two-process
//! (kine + kube-apiserver) backend an Instance owns, and building the read-only
//! template database a fresh Instance starts from.

pub mod crd_cache;
pub mod stack;

pub use crd_cache::{CrdCacheBuilder, CrdCacheConfig, CrdCacheError, FileCrdCacheBuilder};
pub use stack::{
    ProcessStackSupervisor, RealProcessStackSupervisor, StackConfig, StackError, StackHandle,
};
