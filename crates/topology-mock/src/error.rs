//! Error types for the mock membership implementation.

use conclave_topology::{MembershipError, MembershipErrorKind};
use thiserror::Error;

/// Error type for the mock membership implementation.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The mock was switched off with `MockMembership::set_available`.
    #[error("Membership source unavailable")]
    Unavailable,
}

impl MembershipError for Error {
    fn kind(&self) -> MembershipErrorKind {
        match self {
            Self::Unavailable => MembershipErrorKind::Unavailable,
        }
    }
}
