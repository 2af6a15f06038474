//! The acquire / ack / release protocol of one named lock on one process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use conclave_locks::LockRegistry;
use conclave_topology::{InstanceId, Membership};
use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::state::AtomicLockState;
use crate::{Deadline, Error, Grant, LockNode, LockState, MutexLockConfig};

/// One named cluster-wide lock as seen by this process.
///
/// The process that completes the remote acquisition is the owner. Every
/// other live process reaches `Locked` by acknowledging the grant, and the
/// owner's `try_lock` only succeeds once all live instances have acknowledged.
///
/// Acks and releases are scoped to a [`Grant`]; those carrying an earlier
/// grant than the current one are ignored.
#[derive(Debug)]
pub struct InterMutexLock<R, M>
where
    R: LockRegistry,
    M: Membership,
{
    lock_name: String,
    lock_node: LockNode,
    registry: Arc<R>,
    membership: Arc<M>,
    config: Arc<MutexLockConfig>,
    cancellation: CancellationToken,
    state: AtomicLockState,
    is_owner: AtomicBool,
    // Guards every change of `locked_instances` tied to a grant.
    grant: Mutex<Option<Grant>>,
    locked_instances: DashSet<InstanceId>,
}

impl<R, M> InterMutexLock<R, M>
where
    R: LockRegistry,
    M: Membership,
{
    /// Creates an unlocked, non-owned lock.
    ///
    /// In-flight `try_lock` calls give up when `cancellation` is cancelled.
    #[must_use]
    pub fn new(
        lock_name: String,
        lock_node: LockNode,
        registry: Arc<R>,
        membership: Arc<M>,
        config: Arc<MutexLockConfig>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            lock_name,
            lock_node,
            registry,
            membership,
            config,
            cancellation,
            state: AtomicLockState::new(LockState::Unlocked),
            is_owner: AtomicBool::new(false),
            grant: Mutex::new(None),
            locked_instances: DashSet::new(),
        }
    }

    /// Name of the lock.
    #[must_use]
    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    /// Current local state.
    #[must_use]
    pub fn state(&self) -> LockState {
        self.state.load()
    }

    /// Whether the lock is held, by this process or by one it acknowledged.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state() == LockState::Locked
    }

    /// Whether this process performed the remote acquisition of the current grant.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.is_owner.load(Ordering::SeqCst)
    }

    /// The grant this process is acquiring, holds or acknowledged.
    #[must_use]
    pub fn current_grant(&self) -> Option<Grant> {
        self.grant.lock().clone()
    }

    /// Instances known to have acknowledged the current grant, sorted.
    #[must_use]
    pub fn locked_instances(&self) -> Vec<InstanceId> {
        let mut instances: Vec<InstanceId> =
            self.locked_instances.iter().map(|id| id.clone()).collect();
        instances.sort();
        instances
    }

    fn local_instance_id(&self) -> &InstanceId {
        self.membership.local_instance_id()
    }

    /// Attempts to take the lock cluster-wide within `timeout`.
    ///
    /// `timeout` is clamped to the configured bounds and covers both the
    /// lease acquisition and the wait for acknowledgments. Returns
    /// `Ok(false)` on contention or timeout, with all local and remote
    /// partial state undone. Dropping the returned future undoes it as well.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry or the membership view fails. Local
    /// state is rolled back first.
    #[instrument(
        skip(self),
        fields(lock_name = %self.lock_name, instance_id = %self.local_instance_id())
    )]
    pub async fn try_lock(&self, timeout: Duration) -> Result<bool, Error> {
        let timeout = self.config.clamp_try_lock_timeout(timeout);

        if !self
            .state
            .compare_and_set(LockState::Unlocked, LockState::Locking)
        {
            debug!(state = %self.state(), "Lock busy locally");
            return Ok(false);
        }

        if self
            .is_owner
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.state
                .compare_and_set(LockState::Locking, LockState::Unlocked);
            return Ok(false);
        }

        let grant = self.begin_grant();
        let attempt = Attempt {
            lock: self,
            lease_path: self.lock_node.lock_path(&self.lock_name),
            value: grant.to_string(),
            armed: true,
        };
        let deadline = Deadline::after(timeout, self.cancellation.child_token());

        match self
            .acquire_lease(&attempt.lease_path, &attempt.value, &deadline)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(?timeout, "Timed out acquiring lease");
                attempt.rollback(false).await;
                return Ok(false);
            }
            Err(e) => {
                attempt.rollback(false).await;
                return Err(e);
            }
        }

        match self.await_acks(&deadline).await {
            Ok(true) => {}
            Ok(false) => {
                attempt.rollback(true).await;
                return Ok(false);
            }
            Err(e) => {
                attempt.rollback(true).await;
                return Err(e);
            }
        }

        if !self
            .state
            .compare_and_set(LockState::Locking, LockState::Locked)
        {
            warn!(state = %self.state(), "State changed during acquisition");
            attempt.rollback(true).await;
            return Ok(false);
        }

        attempt.complete();
        info!(%grant, "Lock acquired");
        Ok(true)
    }

    /// Starts a new grant owned by this process, forgetting acks of earlier ones.
    fn begin_grant(&self) -> Grant {
        let grant = Grant::new(self.local_instance_id().clone());

        let mut current = self.grant.lock();
        self.locked_instances.clear();
        self.locked_instances.insert(self.local_instance_id().clone());
        *current = Some(grant.clone());

        grant
    }

    /// Polls the registry in slices until the lease is created or the deadline passes.
    async fn acquire_lease(
        &self,
        lease_path: &str,
        value: &str,
        deadline: &Deadline,
    ) -> Result<bool, Error> {
        loop {
            let slice = self.config.registry_interval().min(deadline.remaining());
            let started = Instant::now();

            if self
                .registry
                .try_lock(lease_path, value, slice)
                .await
                .map_err(Error::registry)?
            {
                return Ok(true);
            }

            if deadline.is_expired() {
                return Ok(false);
            }

            // Registries that answer without waiting still get polled once per slice.
            let elapsed = started.elapsed();
            if elapsed < slice && !deadline.sleep(slice - elapsed).await {
                return Ok(false);
            }
        }
    }

    /// Waits until every live instance has acknowledged the grant.
    async fn await_acks(&self, deadline: &Deadline) -> Result<bool, Error> {
        loop {
            let live = self
                .membership
                .live_instances()
                .await
                .map_err(Error::membership)?;

            if !live.contains(self.local_instance_id()) {
                warn!("Local instance is no longer a live member, abandoning acquisition");
                return Ok(false);
            }

            let pending: Vec<InstanceId> = live
                .into_iter()
                .filter(|instance_id| !self.locked_instances.contains(instance_id))
                .collect();
            if pending.is_empty() {
                return Ok(true);
            }

            if !deadline.sleep(self.config.check_ack_interval()).await {
                debug!(?pending, "Timed out waiting for acks");
                return Ok(false);
            }
        }
    }

    /// Clears the local side of an acquisition that did not complete.
    fn abandon_grant(&self) {
        let mut current = self.grant.lock();
        self.locked_instances.clear();
        *current = None;
        self.is_owner.store(false, Ordering::SeqCst);
        self.state
            .compare_and_set(LockState::Locking, LockState::Unlocked);
    }

    /// Releases the lock. A no-op unless the lock is `Locked`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry fails; the lock then stays `Locked`.
    #[instrument(
        skip(self),
        fields(lock_name = %self.lock_name, instance_id = %self.local_instance_id())
    )]
    pub async fn unlock(&self) -> Result<(), Error> {
        if self.state() != LockState::Locked {
            return Ok(());
        }

        let lease_path = self.lock_node.lock_path(&self.lock_name);

        if self.is_owner() {
            if let Some(grant) = self.current_grant() {
                self.registry
                    .release_lock(&lease_path, &grant.to_string())
                    .await
                    .map_err(Error::registry)?;
            }

            let mut current = self.grant.lock();
            self.locked_instances.clear();
            *current = None;
            self.is_owner.store(false, Ordering::SeqCst);
            self.state
                .compare_and_set(LockState::Locked, LockState::Unlocked);

            info!("Lock released");
        } else {
            self.registry
                .remove_lock(&lease_path)
                .await
                .map_err(Error::registry)?;

            let local_instance_id = self.local_instance_id().clone();
            let ack_path = self
                .lock_node
                .ack_path(&self.lock_name, &local_instance_id);
            self.release_ack_lock(&ack_path, &local_instance_id, None)
                .await?;
        }

        Ok(())
    }

    /// Acknowledges `grant`, held by another process.
    ///
    /// Only acts when this process is not the owner and the lock is
    /// `Unlocked`; otherwise the ack arrived late and is ignored. The ack node
    /// is written before the local state changes, and deleted again if a
    /// local acquisition started in the meantime.
    ///
    /// # Errors
    ///
    /// Returns an error if the ack node cannot be written; the local state is
    /// left `Unlocked`.
    pub async fn ack_lock(
        &self,
        ack_path: &str,
        instance_id: &InstanceId,
        grant: &Grant,
    ) -> Result<(), Error> {
        if self.is_owner() || self.state() != LockState::Unlocked {
            debug!(lock_name = %self.lock_name, state = %self.state(), "Ignoring ack");
            return Ok(());
        }

        self.registry
            .ack_lock(ack_path, &grant.to_string())
            .await
            .map_err(Error::registry)?;

        let acked = {
            let mut current = self.grant.lock();
            let acked = self
                .state
                .compare_and_set(LockState::Unlocked, LockState::Locked);
            if acked {
                self.locked_instances.insert(instance_id.clone());
                *current = Some(grant.clone());
            }
            acked
        };

        if !acked {
            debug!(lock_name = %self.lock_name, state = %self.state(), "Withdrawing late ack");
            if let Err(e) = self.registry.release_ack_lock(ack_path).await {
                warn!(error = %e, ack_path, "Failed to withdraw late ack");
            }
            return Ok(());
        }

        debug!(lock_name = %self.lock_name, %instance_id, %grant, "Lock acknowledged");
        Ok(())
    }

    /// Withdraws this process's acknowledgment once the grant is over.
    ///
    /// Ignored while a local acquisition is in flight, and when `grant` is
    /// given but is not the current one, since the release then belongs to
    /// an earlier grant.
    ///
    /// # Errors
    ///
    /// Returns an error if the ack node cannot be deleted.
    pub async fn release_ack_lock(
        &self,
        ack_path: &str,
        instance_id: &InstanceId,
        grant: Option<&Grant>,
    ) -> Result<(), Error> {
        if self.state() == LockState::Locking {
            debug!(lock_name = %self.lock_name, "Ignoring ack release during acquisition");
            return Ok(());
        }

        if let Some(grant) = grant {
            if self.grant.lock().as_ref() != Some(grant) {
                debug!(lock_name = %self.lock_name, %grant, "Ignoring release of earlier grant");
                return Ok(());
            }
        }

        if self.is_owner() {
            self.is_owner.store(false, Ordering::SeqCst);
        } else {
            self.registry
                .release_ack_lock(ack_path)
                .await
                .map_err(Error::registry)?;
        }

        let mut current = self.grant.lock();
        self.locked_instances.remove(instance_id);
        *current = None;
        if self
            .state
            .compare_and_set(LockState::Locked, LockState::Unlocked)
        {
            debug!(lock_name = %self.lock_name, %instance_id, "Acknowledgment released");
        }
        Ok(())
    }

    /// Records that `instance_id` acknowledged `grant`.
    ///
    /// Returns `false` and records nothing if `grant` is not the current one.
    pub fn add_locked_instance(&self, instance_id: InstanceId, grant: &Grant) -> bool {
        let current = self.grant.lock();
        if current.as_ref() != Some(grant) {
            debug!(
                lock_name = %self.lock_name,
                %instance_id,
                %grant,
                "Ack for another grant ignored"
            );
            return false;
        }

        self.locked_instances.insert(instance_id);
        true
    }

    /// Records that `instance_id` withdrew its acknowledgment.
    ///
    /// A withdrawal naming a grant other than the current one is ignored.
    pub fn remove_locked_instance(&self, instance_id: &InstanceId, grant: Option<&Grant>) {
        let current = self.grant.lock();
        if let (Some(grant), Some(current)) = (grant, current.as_ref()) {
            if grant != current {
                return;
            }
        }

        self.locked_instances.remove(instance_id);
    }
}

/// Undoes an in-flight acquisition unless completed.
///
/// Dropping it armed, e.g. when the `try_lock` future is cancelled, resets the
/// local state at once and deletes the lease in the background. The delete
/// only takes effect while the lease still carries this attempt's grant.
struct Attempt<'a, R, M>
where
    R: LockRegistry,
    M: Membership,
{
    lock: &'a InterMutexLock<R, M>,
    lease_path: String,
    value: String,
    armed: bool,
}

impl<R, M> Attempt<'_, R, M>
where
    R: LockRegistry,
    M: Membership,
{
    fn complete(mut self) {
        self.armed = false;
    }

    async fn rollback(mut self, lease_acquired: bool) {
        self.armed = false;

        if lease_acquired {
            if let Err(e) = self
                .lock
                .registry
                .release_lock(&self.lease_path, &self.value)
                .await
            {
                warn!(
                    error = %e,
                    lease_path = %self.lease_path,
                    "Failed to release lease during rollback"
                );
            }
        }

        self.lock.abandon_grant();
    }
}

impl<R, M> Drop for Attempt<'_, R, M>
where
    R: LockRegistry,
    M: Membership,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        self.lock.abandon_grant();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lease_path = %self.lease_path, "No runtime to release abandoned lease");
            return;
        };
        let registry = self.lock.registry.clone();
        let lease_path = std::mem::take(&mut self.lease_path);
        let value = std::mem::take(&mut self.value);
        runtime.spawn(async move {
            if let Err(e) = registry.release_lock(&lease_path, &value).await {
                warn!(error = %e, lease_path, "Failed to release abandoned lease");
            }
        });
    }
}
