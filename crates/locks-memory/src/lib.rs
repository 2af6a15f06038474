//! In-memory (single process) implementation of the lock registry for local
//! development and tests.
//!
//! A [`MemoryLockStore`] plays the part of the distributed store. Each
//! simulated process talks to it through its own [`MemoryLockRegistry`],
//! whose log spans carry that process's instance id.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conclave_locks::{LockRegistry, RegistryEvent};
use futures::StreamExt;
use futures::future;
use futures::stream::BoxStream;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, instrument, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Inner {
    nodes: Mutex<BTreeMap<String, String>>,
    released: Notify,
    events: broadcast::Sender<RegistryEvent>,
    available: AtomicBool,
}

/// Shared in-memory store of lock and ack nodes.
#[derive(Clone, Debug)]
pub struct MemoryLockStore {
    inner: Arc<Inner>,
}

impl MemoryLockStore {
    /// Creates a new, empty `MemoryLockStore`.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                nodes: Mutex::new(BTreeMap::new()),
                released: Notify::new(),
                events,
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Creates a registry client for the process identified by `local_identifier`.
    #[must_use]
    pub fn registry<S: Into<String>>(&self, local_identifier: S) -> MemoryLockRegistry {
        MemoryLockRegistry {
            store: self.clone(),
            local_identifier: local_identifier.into(),
        }
    }

    /// Switches the store on or off. While off every operation fails with
    /// [`Error::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Returns the value stored at `path`, if any.
    pub async fn get(&self, path: &str) -> Option<String> {
        self.inner.nodes.lock().await.get(path).cloned()
    }

    /// Returns whether a node exists at `path`.
    pub async fn contains(&self, path: &str) -> bool {
        self.inner.nodes.lock().await.contains_key(path)
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Unavailable)
        }
    }

    fn publish(&self, event: RegistryEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    async fn put(&self, path: &str, value: &str) {
        let mut nodes = self.inner.nodes.lock().await;
        nodes.insert(path.to_string(), value.to_string());
        self.publish(RegistryEvent::Put {
            path: path.to_string(),
            value: value.to_string(),
        });
    }

    async fn delete(&self, path: &str) {
        // Absent nodes are fine.
        let _ = self.delete_held_by(path, None).await;
    }

    /// Deletes `path` if it exists and, when `holder` is given, only if the
    /// node carries that value. On refusal the current value is returned.
    async fn delete_held_by(&self, path: &str, holder: Option<&str>) -> Result<(), Option<String>> {
        let mut nodes = self.inner.nodes.lock().await;
        match (nodes.get(path), holder) {
            (None, _) => return Err(None),
            (Some(current), Some(holder)) if current != holder => {
                return Err(Some(current.clone()));
            }
            _ => {}
        }

        let value = nodes.remove(path);
        self.publish(RegistryEvent::Delete {
            path: path.to_string(),
            value,
        });
        drop(nodes);

        self.inner.released.notify_waiters();
        Ok(())
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry client used by one simulated process.
#[derive(Clone, Debug)]
pub struct MemoryLockRegistry {
    store: MemoryLockStore,
    local_identifier: String,
}

impl MemoryLockRegistry {
    /// Returns the identity recorded on this client's log spans.
    #[must_use]
    pub fn local_identifier(&self) -> &str {
        &self.local_identifier
    }

    /// Returns the store this client talks to.
    #[must_use]
    pub const fn store(&self) -> &MemoryLockStore {
        &self.store
    }
}

#[async_trait]
impl LockRegistry for MemoryLockRegistry {
    type Error = Error;

    #[instrument(skip(self), fields(local_id = %self.local_identifier))]
    async fn try_lock(
        &self,
        path: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<bool, Self::Error> {
        let deadline = Instant::now() + timeout;

        loop {
            self.store.check_available()?;

            // Register interest before looking so a release between the check
            // and the wait is not missed.
            let notified = self.store.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut nodes = self.store.inner.nodes.lock().await;
                if !nodes.contains_key(path) {
                    nodes.insert(path.to_string(), value.to_string());
                    self.store.publish(RegistryEvent::Put {
                        path: path.to_string(),
                        value: value.to_string(),
                    });
                    debug!(path, "Lock node created");
                    return Ok(true);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(path, "Lock node still held by another, giving up");
                return Ok(false);
            }
        }
    }

    #[instrument(skip(self), fields(local_id = %self.local_identifier))]
    async fn release_lock(&self, path: &str, value: &str) -> Result<(), Self::Error> {
        self.store.check_available()?;

        match self.store.delete_held_by(path, Some(value)).await {
            Ok(()) => debug!(path, "Lock node released"),
            Err(Some(holder)) => {
                warn!(path, holder = %holder, "Refusing to release lock node held by another");
            }
            Err(None) => debug!(path, "Lock node already absent"),
        }

        Ok(())
    }

    async fn remove_lock(&self, path: &str) -> Result<(), Self::Error> {
        self.store.check_available()?;
        self.store.delete(path).await;
        Ok(())
    }

    async fn ack_lock(&self, ack_path: &str, value: &str) -> Result<(), Self::Error> {
        self.store.check_available()?;
        self.store.put(ack_path, value).await;
        Ok(())
    }

    async fn release_ack_lock(&self, ack_path: &str) -> Result<(), Self::Error> {
        self.store.check_available()?;
        self.store.delete(ack_path).await;
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, Self::Error> {
        self.store.check_available()?;

        let prefix = format!("{}/", path.trim_end_matches('/'));
        let nodes = self.store.inner.nodes.lock().await;

        let mut result: Vec<String> = Vec::new();
        for key in nodes.range(prefix.clone()..).map(|(key, _)| key) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            let segment = rest.split('/').next().unwrap_or_default();
            if !segment.is_empty() && result.last().is_none_or(|last| last != segment) {
                result.push(segment.to_string());
            }
        }

        Ok(result)
    }

    async fn persist(&self, path: &str, value: &str) -> Result<(), Self::Error> {
        self.store.check_available()?;
        self.store.put(path, value).await;
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<BoxStream<'static, RegistryEvent>, Self::Error> {
        self.store.check_available()?;

        let prefix = prefix.to_string();
        let receiver = self.store.inner.events.subscribe();

        Ok(BroadcastStream::new(receiver)
            .filter_map(move |result| {
                let event = match result {
                    Ok(event) if event.path().starts_with(prefix.as_str()) => Some(event),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "Watch subscriber lagged, events dropped");
                        None
                    }
                };
                future::ready(event)
            })
            .boxed())
    }
}
