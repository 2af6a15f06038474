use conclave_locks::{LockRegistryError, LockRegistryErrorKind};
use thiserror::Error;

/// Errors that can occur when using the in-memory lock registry.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The store was switched off with `MemoryLockStore::set_available`.
    #[error("in-memory lock store is unavailable")]
    Unavailable,
}

impl LockRegistryError for Error {
    fn kind(&self) -> LockRegistryErrorKind {
        match self {
            Self::Unavailable => LockRegistryErrorKind::Unavailable,
        }
    }
}
