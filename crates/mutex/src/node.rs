//! Layout of lock nodes in the registry.
//!
//! ```text
//! <namespace>/sequence
//! <namespace>/locks
//! <namespace>/locks/<lock-name>/leases
//! <namespace>/locks/<lock-name>/ack/<instance-id>
//! ```

use conclave_topology::InstanceId;

use crate::Error;

const SEQUENCE: &str = "sequence";
const LOCKS: &str = "locks";
const LEASES: &str = "leases";
const ACK: &str = "ack";

/// A registry path recognised as belonging to a named lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockNodePath {
    /// The mutex node of `lock_name`.
    Lease {
        /// Name of the lock.
        lock_name: String,
    },

    /// The ack marker written by `instance_id` for `lock_name`.
    Ack {
        /// Name of the lock.
        lock_name: String,
        /// Instance that acknowledged.
        instance_id: InstanceId,
    },
}

/// Builds and parses registry paths under one namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockNode {
    namespace: String,
}

impl LockNode {
    /// Creates the layout rooted at `namespace`, e.g. `/lock`.
    #[must_use]
    pub fn new<S: AsRef<str>>(namespace: S) -> Self {
        Self {
            namespace: namespace.as_ref().trim_end_matches('/').to_string(),
        }
    }

    /// Checks that `lock_name` can be used as a single path segment.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidLockName` for empty names or names containing `/`.
    pub fn validate_lock_name(lock_name: &str) -> Result<(), Error> {
        if lock_name.is_empty() || lock_name.contains('/') {
            return Err(Error::InvalidLockName(lock_name.to_string()));
        }
        Ok(())
    }

    /// Path of the sequence lock serializing acquisition attempts.
    #[must_use]
    pub fn sequence_path(&self) -> String {
        format!("{}/{SEQUENCE}", self.namespace)
    }

    /// Parent of every lock node.
    #[must_use]
    pub fn locks_root(&self) -> String {
        format!("{}/{LOCKS}", self.namespace)
    }

    /// Path of the mutex node for `lock_name`.
    #[must_use]
    pub fn lock_path(&self, lock_name: &str) -> String {
        format!("{}/{LOCKS}/{lock_name}/{LEASES}", self.namespace)
    }

    /// Parent of the ack markers for `lock_name`.
    #[must_use]
    pub fn ack_root(&self, lock_name: &str) -> String {
        format!("{}/{LOCKS}/{lock_name}/{ACK}", self.namespace)
    }

    /// Path of the ack marker of `instance_id` for `lock_name`.
    #[must_use]
    pub fn ack_path(&self, lock_name: &str, instance_id: &InstanceId) -> String {
        format!("{}/{LOCKS}/{lock_name}/{ACK}/{instance_id}", self.namespace)
    }

    /// Recognises lease and ack paths; anything else yields `None`.
    #[must_use]
    pub fn parse(&self, path: &str) -> Option<LockNodePath> {
        let rest = path
            .strip_prefix(self.namespace.as_str())?
            .strip_prefix('/')?
            .strip_prefix(LOCKS)?
            .strip_prefix('/')?;

        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            [lock_name, LEASES] if !lock_name.is_empty() => Some(LockNodePath::Lease {
                lock_name: (*lock_name).to_string(),
            }),
            [lock_name, ACK, instance_id] if !lock_name.is_empty() => {
                let instance_id = InstanceId::new(*instance_id).ok()?;
                Some(LockNodePath::Ack {
                    lock_name: (*lock_name).to_string(),
                    instance_id,
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let node = LockNode::new("/lock/");
        let instance_id = InstanceId::new("node-1").unwrap();

        assert_eq!(node.sequence_path(), "/lock/sequence");
        assert_eq!(node.locks_root(), "/lock/locks");
        assert_eq!(node.lock_path("job"), "/lock/locks/job/leases");
        assert_eq!(node.ack_root("job"), "/lock/locks/job/ack");
        assert_eq!(node.ack_path("job", &instance_id), "/lock/locks/job/ack/node-1");
    }

    #[test]
    fn test_parse() {
        let node = LockNode::new("/lock");

        assert_eq!(
            node.parse("/lock/locks/job/leases"),
            Some(LockNodePath::Lease {
                lock_name: "job".to_string()
            })
        );
        assert_eq!(
            node.parse("/lock/locks/job/ack/node-2"),
            Some(LockNodePath::Ack {
                lock_name: "job".to_string(),
                instance_id: InstanceId::new("node-2").unwrap(),
            })
        );

        assert_eq!(node.parse("/lock/locks"), None);
        assert_eq!(node.parse("/lock/locks/job"), None);
        assert_eq!(node.parse("/lock/locks/job/ack"), None);
        assert_eq!(node.parse("/lock/sequence"), None);
        assert_eq!(node.parse("/lockers/locks/job/leases"), None);
        assert_eq!(node.parse("/other/locks/job/leases"), None);
    }

    #[test]
    fn test_validate_lock_name() {
        assert!(LockNode::validate_lock_name("migration-job-7").is_ok());
        assert!(LockNode::validate_lock_name("").is_err());
        assert!(LockNode::validate_lock_name("a/b").is_err());
    }
}
