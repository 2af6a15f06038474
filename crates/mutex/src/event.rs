//! Lock events and their derivation from registry watch events.

use conclave_locks::RegistryEvent;
use conclave_topology::InstanceId;

use crate::{Grant, LockNode, LockNodePath};

/// A change to a named lock observed somewhere in the cluster.
///
/// `grant` is `None` when the node value is not a valid grant, or when the
/// registry does not report the value of a deleted node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutexLockEvent {
    /// A process created the mutex node of `lock_name`.
    Locked {
        /// Name of the lock.
        lock_name: String,
        /// Grant recorded in the node.
        grant: Option<Grant>,
    },

    /// The mutex node of `lock_name` was deleted.
    LockReleased {
        /// Name of the lock.
        lock_name: String,
        /// Grant the deleted node carried.
        grant: Option<Grant>,
    },

    /// `instance_id` acknowledged a grant of `lock_name`.
    AckLocked {
        /// Name of the lock.
        lock_name: String,
        /// Instance that acknowledged.
        instance_id: InstanceId,
        /// Grant that was acknowledged.
        grant: Option<Grant>,
    },

    /// `instance_id` withdrew its acknowledgment of `lock_name`.
    AckLockReleased {
        /// Name of the lock.
        lock_name: String,
        /// Instance that withdrew.
        instance_id: InstanceId,
        /// Grant the withdrawn ack named.
        grant: Option<Grant>,
    },
}

impl MutexLockEvent {
    /// Name of the lock the event is about.
    #[must_use]
    pub fn lock_name(&self) -> &str {
        match self {
            Self::Locked { lock_name, .. }
            | Self::LockReleased { lock_name, .. }
            | Self::AckLocked { lock_name, .. }
            | Self::AckLockReleased { lock_name, .. } => lock_name,
        }
    }
}

/// Turns raw registry events under one namespace into lock events.
#[derive(Clone, Debug)]
pub struct WatchBridge {
    lock_node: LockNode,
}

impl WatchBridge {
    /// Creates a bridge for the given layout.
    #[must_use]
    pub const fn new(lock_node: LockNode) -> Self {
        Self { lock_node }
    }

    /// Maps a registry event to a lock event; unrelated paths yield `None`.
    #[must_use]
    pub fn translate(&self, event: &RegistryEvent) -> Option<MutexLockEvent> {
        let node_path = self.lock_node.parse(event.path())?;

        let lock_event = match (event, node_path) {
            (RegistryEvent::Put { value, .. }, LockNodePath::Lease { lock_name }) => {
                MutexLockEvent::Locked {
                    lock_name,
                    grant: Grant::parse(value),
                }
            }
            (RegistryEvent::Delete { value, .. }, LockNodePath::Lease { lock_name }) => {
                MutexLockEvent::LockReleased {
                    lock_name,
                    grant: value.as_deref().and_then(Grant::parse),
                }
            }
            (
                RegistryEvent::Put { value, .. },
                LockNodePath::Ack {
                    lock_name,
                    instance_id,
                },
            ) => MutexLockEvent::AckLocked {
                lock_name,
                instance_id,
                grant: Grant::parse(value),
            },
            (
                RegistryEvent::Delete { value, .. },
                LockNodePath::Ack {
                    lock_name,
                    instance_id,
                },
            ) => MutexLockEvent::AckLockReleased {
                lock_name,
                instance_id,
                grant: value.as_deref().and_then(Grant::parse),
            },
        };

        Some(lock_event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(path: &str, value: &str) -> RegistryEvent {
        RegistryEvent::Put {
            path: path.to_string(),
            value: value.to_string(),
        }
    }

    fn delete(path: &str, value: Option<&str>) -> RegistryEvent {
        RegistryEvent::Delete {
            path: path.to_string(),
            value: value.map(str::to_string),
        }
    }

    #[test]
    fn test_translate_lease_events() {
        let bridge = WatchBridge::new(LockNode::new("/lock"));
        let grant = Grant::new(InstanceId::new("node-1").unwrap());
        let value = grant.to_string();

        assert_eq!(
            bridge.translate(&put("/lock/locks/job/leases", &value)),
            Some(MutexLockEvent::Locked {
                lock_name: "job".to_string(),
                grant: Some(grant.clone()),
            })
        );
        assert_eq!(
            bridge.translate(&put("/lock/locks/job/leases", "node-1")),
            Some(MutexLockEvent::Locked {
                lock_name: "job".to_string(),
                grant: None,
            })
        );
        assert_eq!(
            bridge.translate(&delete("/lock/locks/job/leases", Some(&value))),
            Some(MutexLockEvent::LockReleased {
                lock_name: "job".to_string(),
                grant: Some(grant),
            })
        );
        assert_eq!(
            bridge.translate(&delete("/lock/locks/job/leases", None)),
            Some(MutexLockEvent::LockReleased {
                lock_name: "job".to_string(),
                grant: None,
            })
        );
    }

    #[test]
    fn test_translate_ack_events() {
        let bridge = WatchBridge::new(LockNode::new("/lock"));
        let instance_id = InstanceId::new("node-2").unwrap();
        let grant = Grant::new(InstanceId::new("node-1").unwrap());
        let value = grant.to_string();

        let acked = bridge
            .translate(&put("/lock/locks/job/ack/node-2", &value))
            .unwrap();
        assert_eq!(acked.lock_name(), "job");
        assert_eq!(
            acked,
            MutexLockEvent::AckLocked {
                lock_name: "job".to_string(),
                instance_id: instance_id.clone(),
                grant: Some(grant.clone()),
            }
        );

        assert_eq!(
            bridge.translate(&delete("/lock/locks/job/ack/node-2", Some(&value))),
            Some(MutexLockEvent::AckLockReleased {
                lock_name: "job".to_string(),
                instance_id,
                grant: Some(grant),
            })
        );
    }

    #[test]
    fn test_ignores_unrelated_paths() {
        let bridge = WatchBridge::new(LockNode::new("/lock"));

        assert_eq!(bridge.translate(&put("/lock/sequence", "node-1")), None);
        assert_eq!(bridge.translate(&put("/lock/locks", "")), None);
        assert_eq!(
            bridge.translate(&delete("/other/locks/job/leases", None)),
            None
        );
        assert_eq!(bridge.translate(&put("/lock/locks/job/ack", "x")), None);
    }
}
