//! Persistence Layer Interface
//!
//! The flusher talks to the on-disk store only through [`KVStore`]. The
//! contract it relies on:
//!
//! - `begin` opens a transaction and must precede any `set` / `del`.
//! - `set` / `del` queue a write in the open transaction. Each takes a
//!   callback that is invoked exactly once, never before the matching
//!   `commit` returns its result.
//! - `commit` is atomic: on `Ok` every queued write is durable and every
//!   callback sees `Ok`; on `Err` none is and every callback sees the error.
//! - `get` and `scan` read back committed state.
//!
//! Writes carry the document's CAS, so replaying a write after a failed
//! commit is idempotent.

pub mod memory;

pub use memory::{MemoryKVStore, PersistedOp};

use crate::storage::Item;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Identifies the shard a persistence call is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Vbid(pub u16);

impl fmt::Display for Vbid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vb:{}", self.0)
    }
}

/// Opaque metadata committed alongside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub uid: u64,
    pub payload: Bytes,
}

/// Errors reported by a persistence layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("i/o error: {0}")]
    Io(String),

    /// `set`, `del` or `commit` without a preceding `begin`.
    #[error("no transaction open")]
    NoTransaction,

    /// `begin` while a transaction is already open.
    #[error("transaction already open")]
    TransactionOpen,

    #[error("commit failed: {0}")]
    CommitFailed(String),
}

/// Completion callback for a queued write.
pub type PersistenceCallback = Box<dyn FnOnce(Result<(), PersistenceError>) + Send>;

/// The narrow interface the flusher and background fetches use.
pub trait KVStore: Send {
    /// Opens a transaction.
    fn begin(&mut self) -> Result<(), PersistenceError>;

    /// Queues a write of `item` in the open transaction.
    fn set(&mut self, item: &Item, callback: PersistenceCallback);

    /// Queues a delete of `item.key` in the open transaction.
    fn del(&mut self, item: &Item, callback: PersistenceCallback);

    /// Commits the open transaction, optionally recording `manifest` with it.
    fn commit(&mut self, manifest: Option<&Manifest>) -> Result<(), PersistenceError>;

    /// Reads the committed document for `key`.
    fn get(&self, key: &[u8], vbid: Vbid) -> Result<Option<Item>, PersistenceError>;

    /// Calls `visitor` for each committed document with `by_seqno >=
    /// start_seqno`, in seqno order, until it returns `false`. Returns the
    /// number of documents visited.
    fn scan(
        &self,
        vbid: Vbid,
        start_seqno: u64,
        visitor: &mut dyn FnMut(&Item) -> bool,
    ) -> Result<usize, PersistenceError>;

    /// Drops all committed state and any open transaction.
    fn reset(&mut self) -> Result<(), PersistenceError>;
}
