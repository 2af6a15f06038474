//! Process-wide registry of named locks.

use std::sync::Arc;

use conclave_locks::LockRegistry;
use conclave_topology::Membership;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{Error, InterMutexLock, LockNode, MutexLockConfig};

/// Holds one `InterMutexLock` per lock name, created on first use.
///
/// Every caller asking for the same name gets the same instance.
pub struct LockHolder<R, M>
where
    R: LockRegistry,
    M: Membership,
{
    registry: Arc<R>,
    membership: Arc<M>,
    config: Arc<MutexLockConfig>,
    lock_node: LockNode,
    cancellation: CancellationToken,
    locks: DashMap<String, Arc<InterMutexLock<R, M>>>,
}

impl<R, M> LockHolder<R, M>
where
    R: LockRegistry,
    M: Membership,
{
    /// Creates an empty holder.
    #[must_use]
    pub fn new(registry: Arc<R>, membership: Arc<M>, config: MutexLockConfig) -> Self {
        let lock_node = LockNode::new(&config.namespace);

        Self {
            registry,
            membership,
            config: Arc::new(config),
            lock_node,
            cancellation: CancellationToken::new(),
            locks: DashMap::new(),
        }
    }

    /// Returns the lock for `lock_name`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidLockName` if the name is not a valid path segment.
    pub fn get_or_create(&self, lock_name: &str) -> Result<Arc<InterMutexLock<R, M>>, Error> {
        if let Some(lock) = self.locks.get(lock_name) {
            return Ok(lock.value().clone());
        }

        LockNode::validate_lock_name(lock_name)?;

        let lock = self
            .locks
            .entry(lock_name.to_string())
            .or_insert_with(|| {
                debug!(lock_name, "Creating lock");
                Arc::new(InterMutexLock::new(
                    lock_name.to_string(),
                    self.lock_node.clone(),
                    self.registry.clone(),
                    self.membership.clone(),
                    self.config.clone(),
                    self.cancellation.clone(),
                ))
            })
            .value()
            .clone();

        Ok(lock)
    }

    /// Returns the lock for `lock_name` if it exists.
    #[must_use]
    pub fn get(&self, lock_name: &str) -> Option<Arc<InterMutexLock<R, M>>> {
        self.locks.get(lock_name).map(|entry| entry.value().clone())
    }

    /// Names of all known locks, sorted.
    #[must_use]
    pub fn lock_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .locks
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Number of known locks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no lock has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Path layout used by the held locks.
    #[must_use]
    pub const fn lock_node(&self) -> &LockNode {
        &self.lock_node
    }

    /// Registry backing the held locks.
    #[must_use]
    pub const fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// Membership view used for ack quorums.
    #[must_use]
    pub const fn membership(&self) -> &Arc<M> {
        &self.membership
    }

    /// Configuration shared by the held locks.
    #[must_use]
    pub fn config(&self) -> &MutexLockConfig {
        &self.config
    }

    /// Token cancelling every in-flight acquisition of the held locks.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Materializes a local lock for every lock node already in the registry.
    ///
    /// Creates the locks root if it has no children yet. Returns how many
    /// locks were newly created.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry fails.
    #[instrument(skip(self))]
    pub async fn synchronize(&self) -> Result<usize, Error> {
        let locks_root = self.lock_node.locks_root();
        let lock_names = self
            .registry
            .children(&locks_root)
            .await
            .map_err(Error::registry)?;

        if lock_names.is_empty() {
            self.registry
                .persist(&locks_root, "")
                .await
                .map_err(Error::registry)?;
            debug!(locks_root, "Created locks root");
            return Ok(0);
        }

        let mut created = 0;
        for lock_name in &lock_names {
            if self.get(lock_name).is_some() {
                continue;
            }
            match self.get_or_create(lock_name) {
                Ok(_) => created += 1,
                Err(e) => warn!(error = %e, "Skipping unrecognised lock node"),
            }
        }

        info!(created, total = self.len(), "Synchronized locks");
        Ok(created)
    }
}
