//! Identity of one acquisition of a named lock.

use std::fmt;

use conclave_topology::InstanceId;
use uuid::Uuid;

/// One grant of a lock: the owning instance plus a token unique to the
/// acquisition.
///
/// Stored as `<owner>/<token>` in the lease node and echoed in every ack
/// node, so events left over from an earlier grant can be told apart from
/// the current one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Grant {
    owner: InstanceId,
    token: Uuid,
}

impl Grant {
    /// Creates a fresh grant for `owner`.
    #[must_use]
    pub fn new(owner: InstanceId) -> Self {
        Self {
            owner,
            token: Uuid::new_v4(),
        }
    }

    /// Instance that acquired the lease.
    #[must_use]
    pub const fn owner(&self) -> &InstanceId {
        &self.owner
    }

    /// Parses a node value written by `to_string`; anything else yields `None`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let (owner, token) = value.split_once('/')?;

        Some(Self {
            owner: InstanceId::new(owner).ok()?,
            token: Uuid::parse_str(token).ok()?,
        })
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.token)
    }
}
