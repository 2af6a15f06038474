//! Abstract interface for the lock registry backing cluster-wide mutexes.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::{self, Debug};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Marker trait for `LockRegistry` errors
pub trait LockRegistryError: Debug + Error + Send + Sync + 'static {
    /// Returns the kind of this error
    fn kind(&self) -> LockRegistryErrorKind;
}

/// The kind of lock registry error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockRegistryErrorKind {
    /// The backing store could not be reached.
    Unavailable,

    /// The operation did not complete within the store's own timeout.
    Timeout,

    /// Other/unknown error
    Other,
}

impl fmt::Display for LockRegistryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A change observed on a watched path of the registry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RegistryEvent {
    /// A node was created or overwritten.
    Put {
        /// Full path of the node.
        path: String,

        /// Value stored at the node.
        value: String,
    },

    /// A node was deleted.
    Delete {
        /// Full path of the node.
        path: String,

        /// Value the node held, if the registry reports it.
        value: Option<String>,
    },
}

impl RegistryEvent {
    /// Returns the path the event refers to.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Put { path, .. } | Self::Delete { path, .. } => path,
        }
    }
}

/// Client over the distributed store that holds lock and ack nodes.
///
/// Lock nodes carry the value their creator passed to `try_lock`, and
/// `release_lock` only deletes a node that still carries the given value.
#[async_trait]
pub trait LockRegistry: Send + Sync + 'static {
    /// The error type for registry operations.
    type Error: LockRegistryError;

    /// Atomically creates `path` holding `value` if it is absent.
    ///
    /// Waits up to `timeout` for an existing node to disappear.
    /// Returns `Ok(true)` if the node was created by this call.
    async fn try_lock(&self, path: &str, value: &str, timeout: Duration)
    -> Result<bool, Self::Error>;

    /// Deletes `path` if it still holds `value`; otherwise leaves it in place.
    async fn release_lock(&self, path: &str, value: &str) -> Result<(), Self::Error>;

    /// Best-effort delete of `path` regardless of holder.
    async fn remove_lock(&self, path: &str) -> Result<(), Self::Error>;

    /// Writes an ack marker holding `value` at `ack_path`.
    async fn ack_lock(&self, ack_path: &str, value: &str) -> Result<(), Self::Error>;

    /// Deletes the ack marker at `ack_path`.
    async fn release_ack_lock(&self, ack_path: &str) -> Result<(), Self::Error>;

    /// Lists the direct child segments of `path`.
    async fn children(&self, path: &str) -> Result<Vec<String>, Self::Error>;

    /// Creates or overwrites a plain node.
    async fn persist(&self, path: &str, value: &str) -> Result<(), Self::Error>;

    /// Subscribes to every change at or below `prefix`.
    async fn watch(&self, prefix: &str) -> Result<BoxStream<'static, RegistryEvent>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_path() {
        let put = RegistryEvent::Put {
            path: "/lock/locks/a/leases".to_string(),
            value: "node-1".to_string(),
        };
        let delete = RegistryEvent::Delete {
            path: "/lock/locks/a/ack/node-1".to_string(),
            value: None,
        };

        assert_eq!(put.path(), "/lock/locks/a/leases");
        assert_eq!(delete.path(), "/lock/locks/a/ack/node-1");
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(LockRegistryErrorKind::Unavailable.to_string(), "Unavailable");
    }
}
