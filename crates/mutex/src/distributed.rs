//! Process-facing facade over the named locks and their event handlers.

use std::sync::{Arc, Weak};
use std::time::Duration;

use conclave_locks::{LockRegistry, RegistryEvent};
use conclave_topology::{InstanceId, Membership};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::{Error, Grant, LockHolder, LockNode, MutexLockConfig, MutexLockEvent, WatchBridge};

/// How long `shutdown` waits for the dispatch task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Holds the cluster-wide sequence lock until released or dropped.
struct SequenceGuard<R: LockRegistry> {
    registry: Arc<R>,
    path: String,
    value: String,
    armed: bool,
}

impl<R: LockRegistry> SequenceGuard<R> {
    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.registry.release_lock(&self.path, &self.value).await {
            warn!(error = %e, path = %self.path, "Failed to release sequence lock");
        }
    }
}

impl<R: LockRegistry> Drop for SequenceGuard<R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        // The attempt was abandoned mid-flight; release in the background.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(path = %self.path, "No runtime to release sequence lock");
            return;
        };
        let registry = self.registry.clone();
        let path = std::mem::take(&mut self.path);
        let value = std::mem::take(&mut self.value);
        runtime.spawn(async move {
            if let Err(e) = registry.release_lock(&path, &value).await {
                warn!(error = %e, path, "Failed to release abandoned sequence lock");
            }
        });
    }
}

/// Cluster-wide mutex locks for one process.
///
/// Acquisition attempts are serialized cluster-wide through a sequence lock,
/// and every live process acknowledges a grant before the owner's
/// `try_lock` returns `true`. Call [`start`](Self::start) so this process
/// acknowledges grants made elsewhere.
pub struct DistributedMutexLock<R, M>
where
    R: LockRegistry,
    M: Membership,
{
    holder: Arc<LockHolder<R, M>>,
    local_instance_id: InstanceId,
    bridge: WatchBridge,
    event_guard: Mutex<()>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl<R, M> DistributedMutexLock<R, M>
where
    R: LockRegistry,
    M: Membership,
{
    /// Creates the facade with a fresh `LockHolder`.
    #[must_use]
    pub fn new(registry: Arc<R>, membership: Arc<M>, config: MutexLockConfig) -> Self {
        Self::from_holder(Arc::new(LockHolder::new(registry, membership, config)))
    }

    /// Creates the facade over an existing holder.
    #[must_use]
    pub fn from_holder(holder: Arc<LockHolder<R, M>>) -> Self {
        let local_instance_id = holder.membership().local_instance_id().clone();
        let bridge = WatchBridge::new(holder.lock_node().clone());

        Self {
            holder,
            local_instance_id,
            bridge,
            event_guard: Mutex::new(()),
            dispatch_task: Mutex::new(None),
        }
    }

    /// The holder of this process's locks.
    #[must_use]
    pub const fn holder(&self) -> &Arc<LockHolder<R, M>> {
        &self.holder
    }

    /// Identity of this process in the cluster.
    #[must_use]
    pub const fn local_instance_id(&self) -> &InstanceId {
        &self.local_instance_id
    }

    fn lock_node(&self) -> &LockNode {
        self.holder.lock_node()
    }

    /// Attempts to take `lock_name` within the configured maximum timeout.
    ///
    /// # Errors
    ///
    /// See [`try_lock_with_timeout`](Self::try_lock_with_timeout).
    pub async fn try_lock(&self, lock_name: &str) -> Result<bool, Error> {
        let timeout = self.holder.config().max_try_lock();
        self.try_lock_with_timeout(lock_name, timeout).await
    }

    /// Attempts to take `lock_name` within `timeout`.
    ///
    /// Returns `Ok(false)` if another attempt is running anywhere in the
    /// cluster, if the lock is held, or if the acks did not arrive in time.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidLockName` for malformed names and an error if
    /// the registry or the membership view fails.
    #[instrument(skip(self), fields(instance_id = %self.local_instance_id))]
    pub async fn try_lock_with_timeout(
        &self,
        lock_name: &str,
        timeout: Duration,
    ) -> Result<bool, Error> {
        LockNode::validate_lock_name(lock_name)?;

        let registry = self.holder.registry().clone();
        let sequence_path = self.lock_node().sequence_path();
        let sequence_timeout = self.holder.config().sequence_lock_timeout();
        let value = self.local_instance_id.to_string();

        if !registry
            .try_lock(&sequence_path, &value, sequence_timeout)
            .await
            .map_err(Error::registry)?
        {
            debug!(lock_name, "Another acquisition is in progress");
            return Ok(false);
        }

        let sequence = SequenceGuard {
            registry,
            path: sequence_path,
            value,
            armed: true,
        };

        let result = match self.holder.get_or_create(lock_name) {
            Ok(lock) => lock.try_lock(timeout).await,
            Err(e) => Err(e),
        };

        sequence.release().await;
        result
    }

    /// Releases `lock_name`. Unknown or unheld locks are a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry fails.
    #[instrument(skip(self), fields(instance_id = %self.local_instance_id))]
    pub async fn release_lock(&self, lock_name: &str) -> Result<(), Error> {
        match self.holder.get(lock_name) {
            Some(lock) => lock.unlock().await,
            None => {
                debug!(lock_name, "Release of unknown lock ignored");
                Ok(())
            }
        }
    }

    /// Whether `lock_name` is held, by this process or one it acknowledged.
    #[must_use]
    pub fn is_locked(&self, lock_name: &str) -> bool {
        self.holder
            .get(lock_name)
            .is_some_and(|lock| lock.is_locked())
    }

    /// Applies one lock event to the local locks.
    ///
    /// Deliveries are serialized per facade.
    ///
    /// # Errors
    ///
    /// Returns an error if writing or deleting this process's ack node fails.
    pub async fn handle_event(&self, event: MutexLockEvent) -> Result<(), Error> {
        let _guard = self.event_guard.lock().await;

        match event {
            MutexLockEvent::Locked { lock_name, grant } => self.locked(&lock_name, grant).await,
            MutexLockEvent::LockReleased { lock_name, grant } => {
                self.lock_released(&lock_name, grant.as_ref()).await
            }
            MutexLockEvent::AckLocked {
                lock_name,
                instance_id,
                grant,
            } => {
                self.ack_locked(&lock_name, instance_id, grant.as_ref());
                Ok(())
            }
            MutexLockEvent::AckLockReleased {
                lock_name,
                instance_id,
                grant,
            } => {
                self.ack_lock_released(&lock_name, &instance_id, grant.as_ref());
                Ok(())
            }
        }
    }

    async fn locked(&self, lock_name: &str, grant: Option<Grant>) -> Result<(), Error> {
        let Some(grant) = grant else {
            warn!(lock_name, "Lock node without a valid grant ignored");
            return Ok(());
        };
        if grant.owner() == &self.local_instance_id {
            return Ok(());
        }

        let lock = self.holder.get_or_create(lock_name)?;
        let ack_path = self.lock_node().ack_path(lock_name, &self.local_instance_id);
        lock.ack_lock(&ack_path, &self.local_instance_id, &grant)
            .await
    }

    async fn lock_released(&self, lock_name: &str, grant: Option<&Grant>) -> Result<(), Error> {
        let Some(lock) = self.holder.get(lock_name) else {
            return Ok(());
        };

        let ack_path = self.lock_node().ack_path(lock_name, &self.local_instance_id);
        lock.release_ack_lock(&ack_path, &self.local_instance_id, grant)
            .await
    }

    fn ack_locked(&self, lock_name: &str, instance_id: InstanceId, grant: Option<&Grant>) {
        let (Some(lock), Some(grant)) = (self.holder.get(lock_name), grant) else {
            debug!(lock_name, %instance_id, "Ack for unknown lock or grant ignored");
            return;
        };
        lock.add_locked_instance(instance_id, grant);
    }

    fn ack_lock_released(&self, lock_name: &str, instance_id: &InstanceId, grant: Option<&Grant>) {
        if let Some(lock) = self.holder.get(lock_name) {
            lock.remove_locked_instance(instance_id, grant);
        }
    }

    /// Starts following registry events and materializes existing locks.
    ///
    /// The watch is opened before the registry is read so no grant made in
    /// between is missed.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyStarted` or `Error::ShutDown` on misuse, and an
    /// error if the registry cannot be watched or read.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        let mut dispatch_task = self.dispatch_task.lock().await;
        if dispatch_task.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let cancellation = self.holder.cancellation_token().clone();
        if cancellation.is_cancelled() {
            return Err(Error::ShutDown);
        }

        info!(instance_id = %self.local_instance_id, "Starting distributed mutex lock");

        let prefix = format!("{}/", self.lock_node().locks_root());
        let mut events = self
            .holder
            .registry()
            .watch(&prefix)
            .await
            .map_err(Error::registry)?;

        self.holder.synchronize().await?;

        let this = Arc::downgrade(self);
        *dispatch_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancellation.cancelled() => break,
                    next = events.next() => {
                        let Some(registry_event) = next else {
                            warn!("Registry watch ended");
                            break;
                        };
                        if !Self::dispatch(&this, &registry_event).await {
                            break;
                        }
                    }
                }
            }
            debug!("Lock event dispatch stopped");
        }));

        Ok(())
    }

    /// Returns `false` once the facade is gone.
    async fn dispatch(this: &Weak<Self>, registry_event: &RegistryEvent) -> bool {
        let Some(this) = this.upgrade() else {
            return false;
        };

        if let Some(event) = this.bridge.translate(registry_event) {
            debug!(?event, "Dispatching lock event");
            if let Err(e) = this.handle_event(event).await {
                warn!(error = %e, "Failed to handle lock event");
            }
        }
        true
    }

    /// Stops event dispatch and cancels in-flight acquisitions.
    pub async fn shutdown(&self) {
        info!(instance_id = %self.local_instance_id, "Shutting down distributed mutex lock");

        self.holder.cancellation_token().cancel();

        if let Some(task) = self.dispatch_task.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!("Lock event dispatch task completed"),
                Ok(Err(e)) => warn!(error = %e, "Lock event dispatch task failed"),
                Err(_) => warn!("Lock event dispatch task timed out"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use conclave_locks_memory::{MemoryLockRegistry, MemoryLockStore};
    use conclave_topology_mock::{MockMembership, MockMembershipView};
    use tracing_test::traced_test;

    use crate::LockState;

    type TestLock = DistributedMutexLock<MemoryLockRegistry, MockMembershipView>;

    fn id(s: &str) -> InstanceId {
        InstanceId::new(s).unwrap()
    }

    fn create_lock(store: &MemoryLockStore, membership: &MockMembership, local: &str) -> TestLock {
        DistributedMutexLock::new(
            Arc::new(store.registry(local)),
            Arc::new(membership.view_for(id(local))),
            MutexLockConfig::default()
                .with_registry_interval(Duration::from_millis(10))
                .with_check_ack_interval(Duration::from_millis(10)),
        )
    }

    fn locked(grant: &Grant) -> MutexLockEvent {
        MutexLockEvent::Locked {
            lock_name: "job".to_string(),
            grant: Some(grant.clone()),
        }
    }

    fn released(grant: &Grant) -> MutexLockEvent {
        MutexLockEvent::LockReleased {
            lock_name: "job".to_string(),
            grant: Some(grant.clone()),
        }
    }

    fn acked(instance_id: &str, grant: &Grant) -> MutexLockEvent {
        MutexLockEvent::AckLocked {
            lock_name: "job".to_string(),
            instance_id: id(instance_id),
            grant: Some(grant.clone()),
        }
    }

    /// Waits for the lease of "job" to appear and returns its grant.
    async fn lease_grant(store: &MemoryLockStore) -> Grant {
        for _ in 0..200 {
            if let Some(value) = store.get("/lock/locks/job/leases").await {
                return Grant::parse(&value).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("Lease was never created");
    }

    #[tokio::test]
    async fn test_try_lock_releases_sequence_lock() {
        let store = MemoryLockStore::new();
        let membership = MockMembership::new(vec![id("a")]);
        let lock = create_lock(&store, &membership, "a");

        assert!(lock.try_lock("job").await.unwrap());
        assert!(lock.is_locked("job"));
        assert!(!store.contains("/lock/sequence").await);

        lock.release_lock("job").await.unwrap();
        assert!(!lock.is_locked("job"));
    }

    #[tokio::test]
    async fn test_busy_sequence_lock() {
        let store = MemoryLockStore::new();
        let membership = MockMembership::new(vec![id("a")]);
        let lock = create_lock(&store, &membership, "a");

        let other = store.registry("b");
        assert!(
            other
                .try_lock("/lock/sequence", "b", Duration::ZERO)
                .await
                .unwrap()
        );

        assert!(!lock.try_lock("job").await.unwrap());
        assert!(!lock.is_locked("job"));
        assert_eq!(store.get("/lock/sequence").await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_invalid_lock_name() {
        let store = MemoryLockStore::new();
        let membership = MockMembership::new(vec![id("a")]);
        let lock = create_lock(&store, &membership, "a");

        assert_matches!(lock.try_lock("a/b").await, Err(Error::InvalidLockName(_)));
        assert!(!store.contains("/lock/sequence").await);
    }

    #[tokio::test]
    async fn test_release_unknown_lock_is_noop() {
        let store = MemoryLockStore::new();
        let membership = MockMembership::new(vec![id("a")]);
        let lock = create_lock(&store, &membership, "a");

        lock.release_lock("missing").await.unwrap();
        assert!(!lock.is_locked("missing"));
    }

    #[tokio::test]
    async fn test_handle_remote_grant() {
        let store = MemoryLockStore::new();
        let membership = MockMembership::new(vec![id("a"), id("b")]);
        let lock = create_lock(&store, &membership, "b");
        let grant = Grant::new(id("a"));

        lock.handle_event(locked(&grant)).await.unwrap();

        assert!(lock.is_locked("job"));
        assert!(!lock.holder().get("job").unwrap().is_owner());
        assert_eq!(
            store.get("/lock/locks/job/ack/b").await,
            Some(grant.to_string())
        );

        lock.handle_event(released(&grant)).await.unwrap();

        assert!(!lock.is_locked("job"));
        assert!(!store.contains("/lock/locks/job/ack/b").await);
    }

    #[tokio::test]
    async fn test_lock_node_without_grant_is_ignored() {
        let store = MemoryLockStore::new();
        let membership = MockMembership::new(vec![id("a"), id("b")]);
        let lock = create_lock(&store, &membership, "b");

        lock.handle_event(MutexLockEvent::Locked {
            lock_name: "job".to_string(),
            grant: None,
        })
        .await
        .unwrap();

        assert!(!lock.is_locked("job"));
        assert!(!store.contains("/lock/locks/job/ack/b").await);
    }

    #[tokio::test]
    async fn test_own_grant_is_not_acknowledged() {
        let store = MemoryLockStore::new();
        let membership = MockMembership::new(vec![id("a")]);
        let lock = create_lock(&store, &membership, "a");

        lock.handle_event(locked(&Grant::new(id("a")))).await.unwrap();

        assert!(!lock.is_locked("job"));
        assert!(!store.contains("/lock/locks/job/ack/a").await);
    }

    #[tokio::test]
    async fn test_ack_events_update_instances() {
        let store = MemoryLockStore::new();
        let membership = MockMembership::new(vec![id("a")]);
        let lock = create_lock(&store, &membership, "a");

        assert!(lock.try_lock("job").await.unwrap());
        let inter = lock.holder().get("job").unwrap();
        let grant = inter.current_grant().unwrap();

        lock.handle_event(acked("b", &grant)).await.unwrap();
        lock.handle_event(acked("c", &Grant::new(id("a"))))
            .await
            .unwrap();
        assert_eq!(inter.locked_instances(), vec![id("a"), id("b")]);

        lock.handle_event(MutexLockEvent::AckLockReleased {
            lock_name: "job".to_string(),
            instance_id: id("b"),
            grant: Some(grant),
        })
        .await
        .unwrap();
        assert_eq!(inter.locked_instances(), vec![id("a")]);
        assert_eq!(inter.state(), LockState::Locked);
    }

    #[tokio::test]
    async fn test_late_release_after_reacquire_keeps_lock() {
        let store = MemoryLockStore::new();
        let membership = MockMembership::new(vec![id("a")]);
        let lock = create_lock(&store, &membership, "a");

        assert!(lock.try_lock("job").await.unwrap());
        let first = lock.holder().get("job").unwrap().current_grant().unwrap();
        lock.release_lock("job").await.unwrap();
        assert!(lock.try_lock("job").await.unwrap());

        // Watch events of the first grant are delivered only now.
        lock.handle_event(locked(&first)).await.unwrap();
        lock.handle_event(released(&first)).await.unwrap();

        let inter = lock.holder().get("job").unwrap();
        assert!(lock.is_locked("job"));
        assert!(inter.is_owner());
        assert!(store.contains("/lock/locks/job/leases").await);

        lock.release_lock("job").await.unwrap();
        assert!(!lock.is_locked("job"));
        assert!(!store.contains("/lock/locks/job/leases").await);
        assert!(lock.try_lock("job").await.unwrap());
    }

    #[tokio::test]
    async fn test_new_owner_waits_for_lagging_member() {
        let store = MemoryLockStore::new();
        let membership = MockMembership::new(vec![id("a"), id("b"), id("c")]);
        let a = Arc::new(create_lock(&store, &membership, "a"));
        let b = Arc::new(create_lock(&store, &membership, "b"));
        let c = create_lock(&store, &membership, "c");

        // "a" takes the lock; everyone sees the whole first grant.
        let attempt = tokio::spawn({
            let a = a.clone();
            async move { a.try_lock_with_timeout("job", Duration::from_secs(5)).await }
        });
        let first = lease_grant(&store).await;
        b.handle_event(locked(&first)).await.unwrap();
        c.handle_event(locked(&first)).await.unwrap();
        for process in [&a, &b] {
            process.handle_event(acked("b", &first)).await.unwrap();
            process.handle_event(acked("c", &first)).await.unwrap();
        }
        assert!(attempt.await.unwrap().unwrap());

        // "b" sees the release, "c" lags and keeps its ack of the first grant.
        a.release_lock("job").await.unwrap();
        b.handle_event(released(&first)).await.unwrap();
        a.handle_event(released(&first)).await.unwrap();
        assert!(!b.is_locked("job"));
        assert!(c.is_locked("job"));
        assert!(store.contains("/lock/locks/job/ack/c").await);

        let attempt = tokio::spawn({
            let b = b.clone();
            async move { b.try_lock_with_timeout("job", Duration::from_millis(300)).await }
        });
        let second = lease_grant(&store).await;
        assert_ne!(first, second);
        a.handle_event(locked(&second)).await.unwrap();
        b.handle_event(acked("a", &second)).await.unwrap();
        b.handle_event(acked("c", &first)).await.unwrap();

        let inter = b.holder().get("job").unwrap();
        assert_eq!(inter.locked_instances(), vec![id("a"), id("b")]);
        assert!(!attempt.await.unwrap().unwrap());
        assert!(!b.is_locked("job"));
        assert!(!store.contains("/lock/locks/job/leases").await);

        // Everyone catches up; the next grant completes once "c" acknowledges it.
        a.handle_event(released(&second)).await.unwrap();
        c.handle_event(released(&first)).await.unwrap();
        assert!(!a.is_locked("job") && !c.is_locked("job"));

        let attempt = tokio::spawn({
            let b = b.clone();
            async move { b.try_lock_with_timeout("job", Duration::from_secs(5)).await }
        });
        let third = lease_grant(&store).await;
        a.handle_event(locked(&third)).await.unwrap();
        c.handle_event(locked(&third)).await.unwrap();
        b.handle_event(acked("a", &third)).await.unwrap();
        b.handle_event(acked("c", &third)).await.unwrap();

        assert!(attempt.await.unwrap().unwrap());
        assert_eq!(inter.locked_instances(), vec![id("a"), id("b"), id("c")]);
        assert!(a.is_locked("job") && c.is_locked("job"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_start_twice_and_after_shutdown() {
        let store = MemoryLockStore::new();
        let membership = MockMembership::new(vec![id("a")]);
        let lock = Arc::new(create_lock(&store, &membership, "a"));

        lock.start().await.unwrap();
        assert_matches!(lock.start().await, Err(Error::AlreadyStarted));
        assert!(store.contains("/lock/locks").await);

        lock.shutdown().await;
        assert_matches!(lock.start().await, Err(Error::ShutDown));
        assert!(logs_contain("Shutting down distributed mutex lock"));
    }

    #[tokio::test]
    async fn test_dropped_attempt_releases_sequence_lock() {
        let store = MemoryLockStore::new();
        let membership = MockMembership::new(vec![id("a"), id("b")]);
        let lock = Arc::new(create_lock(&store, &membership, "a"));

        // Waits on an ack from "b" that never comes.
        let attempt = tokio::spawn({
            let lock = lock.clone();
            async move { lock.try_lock("job").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.contains("/lock/sequence").await);
        assert!(store.contains("/lock/locks/job/leases").await);

        attempt.abort();
        let _ = attempt.await;

        let inter = lock.holder().get("job").unwrap();
        assert_eq!(inter.state(), LockState::Unlocked);
        assert!(!inter.is_owner());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!store.contains("/lock/sequence").await);
        assert!(!store.contains("/lock/locks/job/leases").await);

        membership.leave(&id("b"));
        assert!(lock.try_lock("job").await.unwrap());
    }
}
