//! Cluster-wide mutual-exclusion locks.
//!
//! A named lock is granted to one process at a time. The grant is made by
//! creating a node in the lock registry and completes once every live
//! member of the cluster has acknowledged it, so each process can observe
//! locally whether a given lock is held anywhere.
//!
//! This crate provides:
//! - `DistributedMutexLock`, the facade used by each process
//! - `LockHolder`, the per-process table of named locks
//! - `InterMutexLock`, the acquire / ack / release protocol of one lock
//! - `Grant`, identifying one acquisition so stale acks and releases are ignored
//! - `WatchBridge`, turning registry changes into `MutexLockEvent`s
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod deadline;
mod distributed;
mod error;
mod event;
mod grant;
mod holder;
mod inter_mutex;
mod node;
mod state;

pub use config::{
    CHECK_ACK_INTERVAL_MS, DEFAULT_NAMESPACE, DEFAULT_REGISTRY_MS, MAX_TRY_LOCK_MS,
    MIN_TRY_LOCK_MS, MutexLockConfig, SEQUENCE_LOCK_TIMEOUT_MS,
};
pub use deadline::Deadline;
pub use distributed::DistributedMutexLock;
pub use error::Error;
pub use event::{MutexLockEvent, WatchBridge};
pub use grant::Grant;
pub use holder::LockHolder;
pub use inter_mutex::InterMutexLock;
pub use node::{LockNode, LockNodePath};
pub use state::LockState;
