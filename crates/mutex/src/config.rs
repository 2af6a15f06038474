//! Timeouts and polling intervals of cluster-wide mutex locks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound of a `try_lock` timeout, and the timeout used when none is given.
pub const MAX_TRY_LOCK_MS: u64 = 3 * 60 * 1000;

/// Lower bound of a `try_lock` timeout.
pub const MIN_TRY_LOCK_MS: u64 = 200;

/// Slice handed to each registry acquire call while polling for the lease.
pub const DEFAULT_REGISTRY_MS: u64 = 50;

/// Pause between two checks of the acknowledged instances.
pub const CHECK_ACK_INTERVAL_MS: u64 = 100;

/// How long to wait for the sequence lock before giving up an attempt.
pub const SEQUENCE_LOCK_TIMEOUT_MS: u64 = DEFAULT_REGISTRY_MS;

/// Default registry namespace of lock nodes.
pub const DEFAULT_NAMESPACE: &str = "/lock";

/// Configuration for `DistributedMutexLock` and the locks it creates.
///
/// All durations are plain millisecond integers so the struct can be read
/// from any serde source; missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutexLockConfig {
    /// Registry namespace under which lock nodes live.
    pub namespace: String,

    /// Upper bound of `try_lock` timeouts.
    pub max_try_lock_ms: u64,

    /// Lower bound of `try_lock` timeouts.
    pub min_try_lock_ms: u64,

    /// Slice of each registry acquire call.
    pub registry_interval_ms: u64,

    /// Pause between ack-completion checks.
    pub check_ack_interval_ms: u64,

    /// Wait for the sequence lock.
    pub sequence_lock_timeout_ms: u64,
}

impl Default for MutexLockConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_try_lock_ms: MAX_TRY_LOCK_MS,
            min_try_lock_ms: MIN_TRY_LOCK_MS,
            registry_interval_ms: DEFAULT_REGISTRY_MS,
            check_ack_interval_ms: CHECK_ACK_INTERVAL_MS,
            sequence_lock_timeout_ms: SEQUENCE_LOCK_TIMEOUT_MS,
        }
    }
}

impl MutexLockConfig {
    /// Sets the registry namespace.
    #[must_use]
    pub fn with_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the ack-completion polling interval.
    #[must_use]
    pub fn with_check_ack_interval(mut self, interval: Duration) -> Self {
        self.check_ack_interval_ms = duration_to_millis(interval);
        self
    }

    /// Sets the registry acquire slice.
    #[must_use]
    pub fn with_registry_interval(mut self, interval: Duration) -> Self {
        self.registry_interval_ms = duration_to_millis(interval);
        self
    }

    /// Sets the sequence lock wait.
    #[must_use]
    pub fn with_sequence_lock_timeout(mut self, timeout: Duration) -> Self {
        self.sequence_lock_timeout_ms = duration_to_millis(timeout);
        self
    }

    /// Upper bound of `try_lock` timeouts.
    #[must_use]
    pub const fn max_try_lock(&self) -> Duration {
        Duration::from_millis(self.max_try_lock_ms)
    }

    /// Lower bound of `try_lock` timeouts.
    #[must_use]
    pub const fn min_try_lock(&self) -> Duration {
        Duration::from_millis(self.min_try_lock_ms)
    }

    /// Slice of each registry acquire call.
    #[must_use]
    pub const fn registry_interval(&self) -> Duration {
        Duration::from_millis(self.registry_interval_ms)
    }

    /// Pause between ack-completion checks.
    #[must_use]
    pub const fn check_ack_interval(&self) -> Duration {
        Duration::from_millis(self.check_ack_interval_ms)
    }

    /// Wait for the sequence lock.
    #[must_use]
    pub const fn sequence_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.sequence_lock_timeout_ms)
    }

    /// Clamps a requested `try_lock` timeout into `[min_try_lock, max_try_lock]`.
    ///
    /// A misconfigured minimum above the maximum yields the maximum.
    #[must_use]
    pub fn clamp_try_lock_timeout(&self, timeout: Duration) -> Duration {
        timeout.max(self.min_try_lock()).min(self.max_try_lock())
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_to_millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
