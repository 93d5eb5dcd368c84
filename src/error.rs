//! Store Errors
//!
//! Errors surfaced by the client-facing read and lock paths of [`EpStore`].
//! Mutations report their outcome as [`MutationStatus`] instead, and
//! persistence failures inside the flusher never reach this type: they are
//! logged and retried.
//!
//! [`EpStore`]: crate::flusher::EpStore
//! [`MutationStatus`]: crate::storage::MutationStatus

use crate::persistence::PersistenceError;
use thiserror::Error;

/// Errors returned by [`EpStore`](crate::flusher::EpStore) operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key has no live document.
    #[error("key not found")]
    KeyNotFound,

    /// The document is locked by another client.
    #[error("document is locked")]
    Locked,

    /// The supplied CAS does not match the document's CAS.
    #[error("cas mismatch: expected {expected}, found {actual}")]
    CasMismatch { expected: u64, actual: u64 },

    /// The document was not locked.
    #[error("document is not locked")]
    NotLocked,

    /// Fetching a non-resident document from the persistence layer failed.
    #[error("background fetch failed: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
