use conclave_locks::{LockRegistryError, LockRegistryErrorKind};
use conclave_topology::{MembershipError, MembershipErrorKind};
use thiserror::Error;

/// Errors that can occur when using cluster-wide mutex locks.
///
/// Contention and timeouts are not errors: they surface as `Ok(false)`.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Lock names are single path segments: non-empty, without `/`.
    #[error("Invalid lock name: {0:?}")]
    InvalidLockName(String),

    /// The lock registry failed.
    #[error("Lock registry error ({kind}): {message}")]
    Registry {
        /// Classification reported by the registry.
        kind: LockRegistryErrorKind,
        /// The registry's error message.
        message: String,
    },

    /// The membership view failed.
    #[error("Membership error ({kind}): {message}")]
    Membership {
        /// Classification reported by the membership view.
        kind: MembershipErrorKind,
        /// The membership view's error message.
        message: String,
    },

    /// `start` was called on a lock that is already running.
    #[error("Distributed mutex lock already started")]
    AlreadyStarted,

    /// `start` was called after `shutdown`.
    #[error("Distributed mutex lock was shut down")]
    ShutDown,
}

impl Error {
    pub(crate) fn registry<E: LockRegistryError>(error: E) -> Self {
        Self::Registry {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub(crate) fn membership<E: MembershipError>(error: E) -> Self {
        Self::Membership {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Whether the error came from the lock registry being unreachable.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Registry {
                kind: LockRegistryErrorKind::Unavailable,
                ..
            } | Self::Membership {
                kind: MembershipErrorKind::Unavailable,
                ..
            }
        )
    }
}
