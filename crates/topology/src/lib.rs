//! Cluster membership for compute-node instances
//!
//! This crate provides:
//! - Instance identity (`InstanceId`)
//! - The `Membership` view consumed by cluster-wide locks
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod error;
pub mod instance_id;
pub mod membership;

pub use error::{MembershipError, MembershipErrorKind, TopologyError};
pub use instance_id::InstanceId;
pub use membership::Membership;
