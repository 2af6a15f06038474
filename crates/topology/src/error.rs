//! Error types for instance id validation and membership lookups

use std::error::Error;
use std::fmt::{self, Debug};
use thiserror::Error as ThisError;

/// Topology-related errors
#[derive(Clone, Debug, ThisError)]
pub enum TopologyError {
    /// An instance id was empty or malformed
    #[error("Invalid instance id: {0:?}")]
    InvalidInstanceId(String),
}

/// Marker trait for `Membership` errors
pub trait MembershipError: Debug + Error + Send + Sync + 'static {
    /// Returns the kind of this error
    fn kind(&self) -> MembershipErrorKind;
}

/// The kind of membership error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MembershipErrorKind {
    /// The membership source could not be reached
    Unavailable,

    /// Other/unknown error
    Other,
}

impl fmt::Display for MembershipErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
