//! Per-lock state machine.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Local state of one named lock on one process.
///
/// Owners move `Unlocked -> Locking -> Locked -> Unlocked`, with
/// `Locking -> Unlocked` as the rollback edge. Non-owners move
/// `Unlocked -> Locked -> Unlocked` when they acknowledge a grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LockState {
    /// Nobody is known to hold the lock.
    Unlocked = 0,

    /// A local acquisition is in flight.
    Locking = 1,

    /// The lock is held, by this process or by another one it acknowledged.
    Locked = 2,
}

impl LockState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Locking,
            2 => Self::Locked,
            _ => Self::Unlocked,
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlocked => f.write_str("UNLOCKED"),
            Self::Locking => f.write_str("LOCKING"),
            Self::Locked => f.write_str("LOCKED"),
        }
    }
}

/// `LockState` cell only changed through compare-and-set.
#[derive(Debug)]
pub(crate) struct AtomicLockState(AtomicU8);

impl AtomicLockState {
    pub(crate) const fn new(state: LockState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> LockState {
        LockState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves from `current` to `new`. Returns `false` if the state was not `current`.
    pub(crate) fn compare_and_set(&self, current: LockState, new: LockState) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
