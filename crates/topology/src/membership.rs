//! Live cluster membership as seen from one instance

use async_trait::async_trait;

use crate::{InstanceId, MembershipError};

/// Read-only view of the live compute-node instances of a cluster.
///
/// The view is a snapshot source: callers that need to react to joins and
/// leaves re-read `live_instances` instead of caching it.
#[async_trait]
pub trait Membership: Send + Sync + 'static {
    /// The error type for membership lookups.
    type Error: MembershipError;

    /// Returns the id of the instance this view belongs to.
    fn local_instance_id(&self) -> &InstanceId;

    /// Returns a snapshot of every live instance, including the local one.
    async fn live_instances(&self) -> Result<Vec<InstanceId>, Self::Error>;
}
