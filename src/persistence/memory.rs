//! In-Memory KV Store
//!
//! A transactional [`KVStore`] that keeps committed documents in a
//! `BTreeMap`. Besides the data it records a journal of every committed
//! write, and it can be told to fail or panic on upcoming calls, which makes
//! it the persistence double for flusher tests and the soak binary.
//!
//! The store is a cheap handle: clones share the same state, so a test can
//! keep one clone for inspection while the store owns the other.

use super::{KVStore, Manifest, PersistenceCallback, PersistenceError, Vbid};
use crate::storage::Item;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// A committed write, as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistedOp {
    Set(Item),
    Del(Bytes),
}

enum PendingOp {
    Set(Item, PersistenceCallback),
    Del(Item, PersistenceCallback),
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<Bytes, Item>,
    pending: Option<Vec<PendingOp>>,
    journal: Vec<PersistedOp>,
    commits: usize,
    manifest: Option<Manifest>,
    fail_begins: usize,
    fail_commits: usize,
    panic_commits: usize,
}

/// Shared-state in-memory persistence.
#[derive(Clone, Default)]
pub struct MemoryKVStore {
    vbid: Vbid,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for MemoryKVStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryKVStore")
            .field("vbid", &self.vbid)
            .field("documents", &inner.data.len())
            .field("commits", &inner.commits)
            .finish()
    }
}

impl MemoryKVStore {
    pub fn new(vbid: Vbid) -> Self {
        Self {
            vbid,
            inner: Arc::default(),
        }
    }

    /// The next `n` calls to `begin` fail.
    pub fn fail_next_begins(&self, n: usize) {
        self.inner.lock().fail_begins = n;
    }

    /// The next `n` calls to `commit` fail.
    pub fn fail_next_commits(&self, n: usize) {
        self.inner.lock().fail_commits = n;
    }

    /// The next call to `commit` panics. Queued callbacks are dropped
    /// without being invoked.
    pub fn panic_next_commit(&self) {
        self.inner.lock().panic_commits = 1;
    }

    /// Every committed write, oldest first.
    pub fn journal(&self) -> Vec<PersistedOp> {
        self.inner.lock().journal.clone()
    }

    /// Committed writes that touched `key`, oldest first.
    pub fn journal_for(&self, key: &[u8]) -> Vec<PersistedOp> {
        self.inner
            .lock()
            .journal
            .iter()
            .filter(|op| match op {
                PersistedOp::Set(item) => item.key.as_ref() == key,
                PersistedOp::Del(k) => k.as_ref() == key,
            })
            .cloned()
            .collect()
    }

    /// The committed document for `key`.
    pub fn committed(&self, key: &[u8]) -> Option<Item> {
        self.inner.lock().data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn commit_count(&self) -> usize {
        self.inner.lock().commits
    }

    pub fn last_manifest(&self) -> Option<Manifest> {
        self.inner.lock().manifest.clone()
    }

    fn queue(&self, op: PendingOp) {
        let mut inner = self.inner.lock();
        match inner.pending.as_mut() {
            Some(pending) => pending.push(op),
            None => {
                drop(inner);
                let callback = match op {
                    PendingOp::Set(_, cb) | PendingOp::Del(_, cb) => cb,
                };
                callback(Err(PersistenceError::NoTransaction));
            }
        }
    }
}

impl KVStore for MemoryKVStore {
    fn begin(&mut self) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock();
        if inner.fail_begins > 0 {
            inner.fail_begins -= 1;
            return Err(PersistenceError::Io("injected begin failure".into()));
        }
        if inner.pending.is_some() {
            return Err(PersistenceError::TransactionOpen);
        }
        inner.pending = Some(Vec::new());
        Ok(())
    }

    fn set(&mut self, item: &Item, callback: PersistenceCallback) {
        self.queue(PendingOp::Set(item.clone(), callback));
    }

    fn del(&mut self, item: &Item, callback: PersistenceCallback) {
        self.queue(PendingOp::Del(item.clone(), callback));
    }

    fn commit(&mut self, manifest: Option<&Manifest>) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock();
        let ops = inner.pending.take().ok_or(PersistenceError::NoTransaction)?;

        if inner.panic_commits > 0 {
            inner.panic_commits -= 1;
            drop(inner);
            panic!("injected commit panic with {} queued writes", ops.len());
        }

        let result = if inner.fail_commits > 0 {
            inner.fail_commits -= 1;
            Err(PersistenceError::CommitFailed("injected commit failure".into()))
        } else {
            for op in &ops {
                match op {
                    PendingOp::Set(item, _) => {
                        inner.data.insert(item.key.clone(), item.clone());
                        inner.journal.push(PersistedOp::Set(item.clone()));
                    }
                    PendingOp::Del(item, _) => {
                        inner.data.remove(&item.key);
                        inner.journal.push(PersistedOp::Del(item.key.clone()));
                    }
                }
            }
            inner.commits += 1;
            if let Some(manifest) = manifest {
                inner.manifest = Some(manifest.clone());
            }
            trace!(writes = ops.len(), commits = inner.commits, "transaction committed");
            Ok(())
        };
        drop(inner);

        for op in ops {
            let callback = match op {
                PendingOp::Set(_, cb) | PendingOp::Del(_, cb) => cb,
            };
            callback(result.clone());
        }
        result
    }

    fn get(&self, key: &[u8], vbid: Vbid) -> Result<Option<Item>, PersistenceError> {
        if vbid != self.vbid {
            return Ok(None);
        }
        Ok(self.committed(key))
    }

    fn scan(
        &self,
        vbid: Vbid,
        start_seqno: u64,
        visitor: &mut dyn FnMut(&Item) -> bool,
    ) -> Result<usize, PersistenceError> {
        if vbid != self.vbid {
            return Ok(0);
        }
        let mut items: Vec<Item> = self
            .inner
            .lock()
            .data
            .values()
            .filter(|item| item.by_seqno >= start_seqno)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.by_seqno);

        let mut visited = 0;
        for item in &items {
            visited += 1;
            if !visitor(item) {
                break;
            }
        }
        Ok(visited)
    }

    fn reset(&mut self) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock();
        inner.data.clear();
        inner.pending = None;
        inner.manifest = None;
        Ok(())
    }
}
