//! Mock cluster membership for tests and local development.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use conclave_topology::{InstanceId, Membership};
use parking_lot::RwLock;

/// Shared, mutable list of live instances.
///
/// Clones share the same list, so one `MockMembership` can back the views
/// of several simulated processes.
#[derive(Clone, Debug)]
pub struct MockMembership {
    members: Arc<RwLock<Vec<InstanceId>>>,
    available: Arc<AtomicBool>,
}

impl MockMembership {
    /// Creates a membership list with the given initial instances.
    #[must_use]
    pub fn new(members: Vec<InstanceId>) -> Self {
        Self {
            members: Arc::new(RwLock::new(members)),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Adds an instance. Joining twice is a no-op.
    pub fn join(&self, instance_id: InstanceId) {
        let mut members = self.members.write();
        if !members.contains(&instance_id) {
            members.push(instance_id);
        }
    }

    /// Removes an instance.
    pub fn leave(&self, instance_id: &InstanceId) {
        self.members.write().retain(|member| member != instance_id);
    }

    /// Returns a copy of the current list.
    #[must_use]
    pub fn members(&self) -> Vec<InstanceId> {
        self.members.read().clone()
    }

    /// Switches lookups on or off. While off `live_instances` fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns the view of the instance `local_instance_id`.
    #[must_use]
    pub fn view_for(&self, local_instance_id: InstanceId) -> MockMembershipView {
        MockMembershipView {
            membership: self.clone(),
            local_instance_id,
        }
    }
}

/// The membership as seen from one instance.
#[derive(Clone, Debug)]
pub struct MockMembershipView {
    membership: MockMembership,
    local_instance_id: InstanceId,
}

#[async_trait]
impl Membership for MockMembershipView {
    type Error = Error;

    fn local_instance_id(&self) -> &InstanceId {
        &self.local_instance_id
    }

    async fn live_instances(&self) -> Result<Vec<InstanceId>, Self::Error> {
        if !self.membership.available.load(Ordering::SeqCst) {
            return Err(Error::Unavailable);
        }
        Ok(self.membership.members())
    }
}
