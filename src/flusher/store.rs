//! Eventually-Persistent Store
//!
//! [`EpStore`] is one shard's document store: the hash table that serves
//! reads and writes, plus the dirty queue and flush pipeline that drain
//! modified documents to a [`KVStore`].
//!
//! ## Write path
//!
//! ```text
//!   set / del ──> HashTable (slot dirty) ──WasClean──> DirtyQueue
//!                                                      │
//!   flush():  swap queue under coordination lock ◄─────┘
//!             for each batch of txn_size keys:
//!               begin
//!               per key: lock bucket, re-read slot, copy + mark clean,
//!                        unlock, then set / del
//!               commit ──ok──> purge flushed tombstones
//!                      └─err─> re-dirty and re-queue the batch
//! ```
//!
//! A key is only queued on a clean to dirty transition, so any number of
//! mutations between two flushes collapse into one write of the latest
//! state. The flusher decides between `set` and `del` from the slot as it is
//! at flush time, not as it was when the key was queued.
//!
//! ## Failure handling
//!
//! Persistence failures never reach the write path. A failed `begin` or
//! `commit` leaves the affected documents dirty and queued for the next
//! cycle. The same holds if the persistence layer panics: guards re-dirty
//! and re-queue on unwind, and the executor catches the panic.
//!
//! ## Locks
//!
//! - The coordination lock guards the dirty queue, flusher state and flush
//!   statistics. It is never held across I/O.
//! - The persistence lock serializes access to the [`KVStore`]. Bucket locks
//!   may be taken while holding it, never the other way around. A flush
//!   batch holds it from `begin` to `commit`, so background fetches of
//!   non-resident documents wait for the batch in progress; a transaction
//!   has a single owner.
//! - The flusher slot lock (the running flusher task) may be taken after the
//!   coordination lock is released, never while holding it.

use super::queue::DirtyQueue;
use super::task::FlusherTask;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::persistence::{KVStore, Manifest, PersistenceCallback, PersistenceError, Vbid};
use crate::storage::{
    AddStatus, EpStats, EvictionPolicy, HashBucketLock, HashTable, HashTableStats, Item,
    MutationStatus, TrackReference, WantsDeleted,
};
use crate::tasks::{ExTask, ExecutorHandle, Priority};
use crate::time::{Clock, RelTime, SystemClock};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Lock duration used when none (or too long a one) is requested.
pub const DEFAULT_LOCK_TIMEOUT: RelTime = 15;

/// Longest lock a client may ask for.
pub const MAX_LOCK_TIMEOUT: RelTime = 30;

/// Flusher lifecycle.
///
/// ```text
///   Stopped ──start──> Running ──stop──> ShuttingDown ──(final drain)──> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlusherState {
    Stopped,
    Running,
    ShuttingDown,
}

impl fmt::Display for FlusherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlusherState::Stopped => "stopped",
            FlusherState::Running => "running",
            FlusherState::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

/// Cumulative flush statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Flush cycles that found queued keys
    pub cycles: u64,
    pub items_flushed: u64,
    pub deletes_flushed: u64,
    pub commits: u64,
    /// Failed `begin` or `commit` calls
    pub commit_failures: u64,
    /// Writes that failed and were made dirty again
    pub items_redirtied: u64,
    pub tombstones_purged: u64,
    /// Longest time a document of the last batch spent queued
    pub dirty_age: Duration,
    pub dirty_age_high_wat: Duration,
    /// Longest time since the last modification, for the last batch
    pub data_age: Duration,
    pub data_age_high_wat: Duration,
    pub commit_time: Duration,
    pub cumulative_commit_time: Duration,
    pub flush_duration: Duration,
    pub flush_duration_high_wat: Duration,
    pub cumulative_flush_duration: Duration,
    /// Keys swapped out by the cycle in progress and not yet written
    pub flusher_todo: u64,
}

/// What one call to [`EpStore::flush`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Writes acknowledged by the persistence layer
    pub flushed: usize,
    /// Writes that failed and were queued again
    pub failed: usize,
    pub commits: usize,
}

impl FlushReport {
    /// True if the cycle found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.flushed == 0 && self.failed == 0 && self.commits == 0
    }
}

/// A point-in-time view of the store.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub flusher_state: FlusherState,
    pub queue_size: usize,
    pub flush: FlushStats,
    pub table: HashTableStats,
    pub mem_used: usize,
    pub max_data_size: usize,
}

struct Coordination {
    towrite: DirtyQueue,
    state: FlusherState,
    stats: FlushStats,
    manifest: Option<Manifest>,
    /// Bumped by `reset`; writes from an older epoch are not retried.
    epoch: u64,
}

/// One shard's in-memory store and flush pipeline.
pub struct EpStore {
    config: StoreConfig,
    vbid: Vbid,
    table: HashTable,
    kv: Mutex<Box<dyn KVStore>>,
    coord: Mutex<Coordination>,
    work_available: Condvar,
    stopped: Condvar,
    flusher: Mutex<Option<(ExTask, ExecutorHandle)>>,
}

impl fmt::Debug for EpStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpStore")
            .field("vbid", &self.vbid)
            .field("table", &self.table)
            .field("flusher_state", &self.flusher_state())
            .finish()
    }
}

impl EpStore {
    pub fn new(config: StoreConfig, kv: Box<dyn KVStore>) -> Self {
        Self::with_clock(config, kv, SystemClock::shared())
    }

    /// Creates a store whose expiry, lock and deletion times come from
    /// `clock`.
    pub fn with_clock(config: StoreConfig, kv: Box<dyn KVStore>, clock: Arc<dyn Clock>) -> Self {
        let stats = Arc::new(EpStats::with_quota(config.max_data_size));
        let table = HashTable::new(stats, config.ordered, config.ht_size, config.ht_locks)
            .with_clock(clock);

        Self {
            vbid: Vbid(config.vbucket),
            config,
            table,
            kv: Mutex::new(kv),
            coord: Mutex::new(Coordination {
                towrite: DirtyQueue::new(),
                state: FlusherState::Stopped,
                stats: FlushStats::default(),
                manifest: None,
                epoch: 0,
            }),
            work_available: Condvar::new(),
            stopped: Condvar::new(),
            flusher: Mutex::new(None),
        }
    }

    pub fn table(&self) -> &HashTable {
        &self.table
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    pub fn stats(&self) -> StoreStats {
        let coord = self.coord.lock();
        StoreStats {
            flusher_state: coord.state,
            queue_size: coord.towrite.len(),
            flush: coord.stats.clone(),
            table: self.table.stats(),
            mem_used: self.table.ep_stats().current_size(),
            max_data_size: self.table.ep_stats().max_data_size(),
        }
    }

    /// Number of keys waiting for the next flush.
    pub fn queue_size(&self) -> usize {
        self.coord.lock().towrite.len()
    }

    // ------------------------------------------------------------------
    // Dirty queue
    // ------------------------------------------------------------------

    fn queue_dirty(&self, key: Bytes) {
        let was_empty = {
            let mut coord = self.coord.lock();
            let was_empty = coord.towrite.is_empty();
            coord.towrite.push(key);
            was_empty
        };
        self.notify_flusher(was_empty);
    }

    /// Queues keys that just went from clean to dirty.
    pub(crate) fn queue_dirty_many(&self, keys: Vec<Bytes>) {
        if keys.is_empty() {
            return;
        }
        let was_empty = {
            let mut coord = self.coord.lock();
            let was_empty = coord.towrite.is_empty();
            for key in keys {
                coord.towrite.push(key);
            }
            was_empty
        };
        self.notify_flusher(was_empty);
    }

    /// Signals waiters in `flush(true)`; on the first key of an empty queue
    /// also wakes the idle flusher task.
    fn notify_flusher(&self, was_empty: bool) {
        self.work_available.notify_one();
        if !was_empty {
            return;
        }
        if let Some((task, executor)) = self.flusher.lock().as_ref() {
            executor.wake(task);
        }
    }

    /// Queues keys again after a failed write, unless the store was reset
    /// since the write was attempted.
    fn requeue(&self, keys: Vec<Bytes>, epoch: u64) {
        let mut coord = self.coord.lock();
        if coord.epoch != epoch {
            return;
        }
        for key in keys {
            coord.towrite.push(key);
        }
    }

    // ------------------------------------------------------------------
    // Client operations
    // ------------------------------------------------------------------

    /// Stores `item`. A non-zero `item.cas` must match the live document.
    pub fn set(&self, item: &Item) -> MutationStatus {
        let status = self.table.set(item);
        if status == MutationStatus::WasClean {
            self.queue_dirty(item.key.clone());
        }
        status
    }

    /// Stores `item` only if the key has no live document. Under full
    /// eviction a key that is not in memory is looked up on disk first.
    pub fn add(&self, item: &Item) -> AddStatus {
        let mut fetched = false;
        loop {
            let mut hbl = self.table.get_locked_bucket(&item.key);
            let (status, was_dirty) = match self.table.unlocked_find(
                &mut hbl,
                &item.key,
                WantsDeleted::Yes,
                TrackReference::No,
            ) {
                Some(sv) if sv.is_deleted() => (AddStatus::UnDel, sv.is_dirty()),
                Some(sv) if !sv.is_temp() => return AddStatus::Exists,
                Some(_) => (AddStatus::Success, false),
                None if !fetched
                    && self.config.eviction_policy == EvictionPolicy::FullEviction =>
                {
                    drop(hbl);
                    fetched = true;
                    if let Err(err) = self.bg_fetch(&item.key) {
                        warn!(vbid = %self.vbid, error = %err, "add proceeding without disk lookup");
                    }
                    continue;
                }
                None => (AddStatus::Success, false),
            };

            let item = Item { cas: 0, ..item.clone() };
            if self.table.unlocked_set(&mut hbl, &item) == MutationStatus::NoMem {
                return AddStatus::NoMem;
            }
            drop(hbl);

            if !was_dirty {
                self.queue_dirty(item.key);
            }
            return status;
        }
    }

    /// Deletes `key`, leaving a tombstone for the flusher. A non-zero `cas`
    /// must match the document. Returns the tombstone's CAS.
    pub fn del(&self, key: &[u8], cas: u64) -> StoreResult<u64> {
        loop {
            let mut hbl = self.table.get_locked_bucket(key);
            let now = self.table.now();
            match self
                .table
                .unlocked_find(&mut hbl, key, WantsDeleted::Yes, TrackReference::No)
            {
                Some(sv) if sv.is_deleted() => return Err(StoreError::KeyNotFound),
                Some(sv) if !sv.is_temp() => {
                    if sv.is_locked(now) && sv.cas() != cas {
                        return Err(StoreError::Locked);
                    }
                    if cas != 0 && cas != sv.cas() {
                        return Err(StoreError::CasMismatch {
                            expected: cas,
                            actual: sv.cas(),
                        });
                    }
                    let key = sv.key().clone();
                    let status = self.table.unlocked_soft_delete(&mut hbl, &key, false);
                    let new_cas = self
                        .table
                        .unlocked_find(&mut hbl, &key, WantsDeleted::Yes, TrackReference::No)
                        .map_or(0, |sv| sv.cas());
                    drop(hbl);
                    if status == MutationStatus::WasClean {
                        self.queue_dirty(key);
                    }
                    return Ok(new_cas);
                }
                _ => {
                    drop(hbl);
                    if self.config.eviction_policy == EvictionPolicy::FullEviction
                        && self.bg_fetch(key)?
                    {
                        continue;
                    }
                    return Err(StoreError::KeyNotFound);
                }
            }
        }
    }

    /// Reads `key`.
    ///
    /// An expired document is deleted on the spot. A value that was ejected
    /// (or, under full eviction, a document no longer in memory) is fetched
    /// from the persistence layer and re-validated before it is installed.
    pub fn get(&self, key: &[u8]) -> StoreResult<Item> {
        loop {
            let mut hbl = self.table.get_locked_bucket(key);
            let now = self.table.now();
            let Some(sv) =
                self.table
                    .unlocked_find(&mut hbl, key, WantsDeleted::Yes, TrackReference::Yes)
            else {
                drop(hbl);
                if self.config.eviction_policy == EvictionPolicy::FullEviction
                    && self.bg_fetch(key)?
                {
                    continue;
                }
                return Err(StoreError::KeyNotFound);
            };

            if sv.is_temp() {
                drop(hbl);
                if self.bg_fetch(key)? {
                    continue;
                }
                return Err(StoreError::KeyNotFound);
            }
            if sv.is_deleted() {
                return Err(StoreError::KeyNotFound);
            }
            if sv.is_expired(now) {
                let key = sv.key().clone();
                let status = self.table.unlocked_soft_delete(&mut hbl, &key, false);
                drop(hbl);
                trace!(key = ?key, "expired on access");
                if status == MutationStatus::WasClean {
                    self.queue_dirty(key);
                }
                return Err(StoreError::KeyNotFound);
            }
            if sv.is_resident() {
                return Ok(sv.to_item());
            }

            let by_seqno = sv.by_seqno();
            drop(hbl);
            self.restore_from_disk(key, by_seqno)?;
        }
    }

    /// Reads `key` and locks it for `lock_secs` (0 = default). The returned
    /// CAS is the one that unlocks the document or mutates it while locked.
    pub fn get_locked(&self, key: &[u8], lock_secs: RelTime) -> StoreResult<Item> {
        let lock_secs = if lock_secs == 0 || lock_secs > MAX_LOCK_TIMEOUT {
            DEFAULT_LOCK_TIMEOUT
        } else {
            lock_secs
        };

        loop {
            self.get(key)?;
            let mut hbl = self.table.get_locked_bucket(key);
            let now = self.table.now();
            let Some(sv) = self
                .table
                .unlocked_find(&mut hbl, key, WantsDeleted::No, TrackReference::Yes)
            else {
                return Err(StoreError::KeyNotFound);
            };
            if !sv.is_resident() {
                // Ejected between the read and the lock.
                continue;
            }
            if sv.is_locked(now) {
                return Err(StoreError::Locked);
            }
            sv.set_cas(self.table.generate_cas());
            sv.lock(now.saturating_add(lock_secs));
            return Ok(sv.to_item());
        }
    }

    /// Unlocks `key`. `cas` must be the one returned by `get_locked`.
    pub fn unlock_key(&self, key: &[u8], cas: u64) -> StoreResult<()> {
        let mut hbl = self.table.get_locked_bucket(key);
        let now = self.table.now();
        let sv = self
            .table
            .unlocked_find(&mut hbl, key, WantsDeleted::No, TrackReference::No)
            .ok_or(StoreError::KeyNotFound)?;
        if !sv.is_locked(now) {
            return Err(StoreError::NotLocked);
        }
        if sv.cas() != cas {
            return Err(StoreError::CasMismatch {
                expected: cas,
                actual: sv.cas(),
            });
        }
        sv.unlock();
        Ok(())
    }

    /// Ejects `key` under the configured eviction policy. Only clean
    /// documents can be ejected.
    pub fn evict_key(&self, key: &[u8]) -> bool {
        let mut hbl = self.table.get_locked_bucket(key);
        self.table
            .unlocked_eject_item(&mut hbl, key, self.config.eviction_policy)
    }

    /// Reloads an ejected value whose slot still has `by_seqno`.
    fn restore_from_disk(&self, key: &[u8], by_seqno: u64) -> StoreResult<()> {
        let fetched = self.kv.lock().get(key, self.vbid)?;

        let mut hbl = self.table.get_locked_bucket(key);
        if let Some(item) = fetched.as_ref().filter(|item| item.by_seqno == by_seqno) {
            self.table.unlocked_restore_value(&mut hbl, item);
            return Ok(());
        }

        let unchanged = self
            .table
            .unlocked_find(&mut hbl, key, WantsDeleted::Yes, TrackReference::No)
            .is_some_and(|sv| !sv.is_resident() && !sv.is_deleted() && sv.by_seqno() == by_seqno);
        if unchanged {
            warn!(vbid = %self.vbid, key = ?Bytes::copy_from_slice(key), "ejected value missing from persistence");
            return Err(StoreError::KeyNotFound);
        }
        // The slot changed while we were reading; the caller re-resolves.
        Ok(())
    }

    /// Loads a document that is not in memory, through a temp placeholder.
    /// Returns true if there may now be a document in memory for `key`.
    fn bg_fetch(&self, key: &[u8]) -> StoreResult<bool> {
        let key_bytes = Bytes::copy_from_slice(key);
        {
            let mut hbl = self.table.get_locked_bucket(key);
            match self.table.unlocked_add_temp_item(&mut hbl, &key_bytes) {
                AddStatus::Success => {}
                AddStatus::NoMem => return Ok(false),
                _ => {
                    let fetching = self
                        .table
                        .unlocked_find(&mut hbl, key, WantsDeleted::Yes, TrackReference::No)
                        .is_some_and(|sv| sv.is_temp());
                    if !fetching {
                        return Ok(true);
                    }
                }
            }
        }

        let fetched = self.kv.lock().get(key, self.vbid);

        let mut hbl = self.table.get_locked_bucket(key);
        let now = self.table.now();
        match fetched {
            Ok(Some(item)) if !item.deleted && !item.is_expired(now) => {
                if self.table.unlocked_fill_temp_item(&mut hbl, &item) {
                    trace!(key = ?key_bytes, "background fetch complete");
                    return Ok(true);
                }
                // Someone else created or released the slot meanwhile.
                Ok(self
                    .table
                    .unlocked_find(&mut hbl, key, WantsDeleted::Yes, TrackReference::No)
                    .is_some())
            }
            Ok(_) => {
                self.release_temp(&mut hbl, key);
                Ok(false)
            }
            Err(err) => {
                self.release_temp(&mut hbl, key);
                warn!(vbid = %self.vbid, error = %err, "background fetch failed");
                Err(err.into())
            }
        }
    }

    fn release_temp(&self, hbl: &mut HashBucketLock<'_>, key: &[u8]) {
        let is_temp = self
            .table
            .unlocked_find(hbl, key, WantsDeleted::Yes, TrackReference::No)
            .is_some_and(|sv| sv.is_temp());
        if is_temp {
            self.table.unlocked_del(hbl, key);
        }
    }

    // ------------------------------------------------------------------
    // Flush pipeline
    // ------------------------------------------------------------------

    /// Runs one flush cycle.
    ///
    /// With `should_wait`, a running flusher with an empty queue waits up to
    /// `flusher_wait` for work first. The queue is swapped out under the
    /// coordination lock and flushed in batches of `txn_size`. A failed batch
    /// ends the cycle; its keys and every key not reached yet are queued
    /// again.
    pub fn flush(&self, should_wait: bool) -> FlushReport {
        let flush_start = Instant::now();
        let (swapped, epoch) = {
            let mut coord = self.coord.lock();
            if should_wait && coord.towrite.is_empty() && coord.state == FlusherState::Running {
                self.work_available
                    .wait_for(&mut coord, self.config.flusher_wait());
            }
            let swapped = coord.towrite.swap_out();
            coord.stats.flusher_todo = swapped.len() as u64;
            (swapped, coord.epoch)
        };
        if swapped.is_empty() {
            return FlushReport::default();
        }

        let total = swapped.len();
        let mut queue = SwappedQueue {
            store: self,
            keys: swapped,
            epoch,
        };
        let mut report = FlushReport::default();
        while !queue.keys.is_empty() {
            let batch = queue.keys.take(self.config.txn_size);
            let taken = batch.len() as u64;
            let outcome = self.flush_some(batch, epoch);
            {
                let mut coord = self.coord.lock();
                coord.stats.flusher_todo = coord.stats.flusher_todo.saturating_sub(taken);
            }
            report.flushed += outcome.sets + outcome.deletes;
            report.failed += outcome.failed;
            if outcome.committed {
                report.commits += 1;
            } else {
                break;
            }
        }
        drop(queue);

        let elapsed = flush_start.elapsed();
        {
            let mut coord = self.coord.lock();
            let stats = &mut coord.stats;
            stats.cycles += 1;
            stats.flusher_todo = 0;
            stats.flush_duration = elapsed;
            stats.flush_duration_high_wat = stats.flush_duration_high_wat.max(elapsed);
            stats.cumulative_flush_duration += elapsed;
        }
        debug!(
            vbid = %self.vbid,
            keys = total,
            flushed = report.flushed,
            failed = report.failed,
            commits = report.commits,
            elapsed_us = elapsed.as_micros() as u64,
            "flush cycle complete"
        );
        report
    }

    /// Writes one batch in one transaction.
    fn flush_some(&self, batch: Vec<Bytes>, epoch: u64) -> BatchOutcome {
        let mut kv = self.kv.lock();
        if let Err(err) = kv.begin() {
            warn!(vbid = %self.vbid, error = %err, keys = batch.len(), "failed to begin transaction");
            let failed = batch.len();
            self.requeue(batch, epoch);
            self.coord.lock().stats.commit_failures += 1;
            return BatchOutcome {
                failed,
                ..BatchOutcome::default()
            };
        }

        let mut pending = PendingBatch::new(self, epoch);
        for key in &batch {
            self.flush_one(&mut **kv, key, &mut pending);
        }

        let manifest = self.coord.lock().manifest.take();
        let pre_commit = Instant::now();
        let result = kv.commit(manifest.as_ref());
        let commit_time = pre_commit.elapsed();

        if let Err(err) = &result {
            warn!(
                vbid = %self.vbid,
                error = %err,
                writes = pending.entries.len(),
                "commit failed, documents stay dirty"
            );
            if let Some(manifest) = manifest {
                self.coord.lock().manifest.get_or_insert(manifest);
            }
        }

        let dirty_age = pending.dirty_age;
        let data_age = pending.data_age;
        let mut outcome = pending.settle();
        outcome.committed = result.is_ok();
        drop(kv);

        let mut coord = self.coord.lock();
        let stats = &mut coord.stats;
        stats.items_flushed += outcome.sets as u64;
        stats.deletes_flushed += outcome.deletes as u64;
        stats.items_redirtied += outcome.failed as u64;
        stats.tombstones_purged += outcome.purged as u64;
        if outcome.committed {
            stats.commits += 1;
        } else {
            stats.commit_failures += 1;
        }
        stats.commit_time = commit_time;
        stats.cumulative_commit_time += commit_time;
        if let Some(age) = dirty_age {
            stats.dirty_age = age;
            stats.dirty_age_high_wat = stats.dirty_age_high_wat.max(age);
        }
        if let Some(age) = data_age {
            stats.data_age = age;
            stats.data_age_high_wat = stats.data_age_high_wat.max(age);
        }
        outcome
    }

    /// Re-reads `key` and issues the write its current state calls for.
    fn flush_one(&self, kv: &mut dyn KVStore, key: &Bytes, pending: &mut PendingBatch<'_>) {
        let write = {
            let mut hbl = self.table.get_locked_bucket(key);
            match self
                .table
                .unlocked_find(&mut hbl, key, WantsDeleted::Yes, TrackReference::No)
            {
                Some(sv) if sv.is_temp() => None,
                Some(sv) if sv.is_dirty() => {
                    let item = sv.to_item();
                    let by_seqno = sv.by_seqno();
                    if let Some((queued, dirtied)) = sv.mark_clean() {
                        pending.note_ages(queued, dirtied);
                    }
                    Some((item, by_seqno))
                }
                // Clean: an earlier write already covered this state.
                Some(_) => None,
                None => {
                    let mut item = Item::new(key.clone(), 0, 0, Bytes::new());
                    item.deleted = true;
                    Some((item, 0))
                }
            }
        };

        let Some((item, by_seqno)) = write else {
            return;
        };
        if item.deleted {
            let callback = pending.track(key.clone(), by_seqno, PendingWrite::Del);
            kv.del(&item, callback);
        } else {
            let callback = pending.track(key.clone(), by_seqno, PendingWrite::Set(item.clone()));
            kv.set(&item, callback);
        }
    }

    /// Makes a failed write's document dirty again. Returns whether its key
    /// needs queueing.
    fn redirty(&self, entry: &PendingEntry, epoch: u64) -> bool {
        if self.coord.lock().epoch != epoch {
            return false;
        }

        let mut hbl = self.table.get_locked_bucket(&entry.key);
        let state = self
            .table
            .unlocked_find(&mut hbl, &entry.key, WantsDeleted::Yes, TrackReference::No)
            .filter(|sv| !sv.is_temp())
            .map(|sv| (sv.by_seqno(), sv.is_resident()));

        match (state, &entry.write) {
            // Mutated since the flush; that mutation queued the key.
            (Some((seqno, _)), _) if seqno != entry.by_seqno => false,
            (Some((_, resident)), write) => {
                if let (false, PendingWrite::Set(item)) = (resident, write) {
                    self.table.unlocked_restore_value(&mut hbl, item);
                }
                if let Some(sv) =
                    self.table
                        .unlocked_find(&mut hbl, &entry.key, WantsDeleted::Yes, TrackReference::No)
                {
                    sv.mark_dirty();
                }
                true
            }
            // Evicted in between: put the unpersisted document back.
            (None, PendingWrite::Set(item)) => {
                let item = Item { cas: 0, ..item.clone() };
                let status = self.table.unlocked_set(&mut hbl, &item);
                if status == MutationStatus::NoMem {
                    warn!(vbid = %self.vbid, key = ?entry.key, "no memory to restore unpersisted document");
                    return false;
                }
                true
            }
            (None, PendingWrite::Del) => true,
        }
    }

    /// Drops a tombstone whose delete is now durable, unless it changed.
    fn purge_tombstone(&self, entry: &PendingEntry) -> bool {
        let mut hbl = self.table.get_locked_bucket(&entry.key);
        let purge = self
            .table
            .unlocked_find(&mut hbl, &entry.key, WantsDeleted::Yes, TrackReference::No)
            .is_some_and(|sv| {
                sv.is_deleted() && !sv.is_dirty() && sv.by_seqno() == entry.by_seqno
            });
        purge && self.table.unlocked_del(&mut hbl, &entry.key)
    }

    /// Records a manifest to be committed with the next batch.
    pub fn set_manifest(&self, manifest: Manifest) {
        self.coord.lock().manifest = Some(manifest);
    }

    // ------------------------------------------------------------------
    // Flusher control
    // ------------------------------------------------------------------

    pub fn flusher_state(&self) -> FlusherState {
        self.coord.lock().state
    }

    /// Starts the flusher task on `executor`. Only a stopped flusher can be
    /// started.
    pub fn start_flusher(self: &Arc<Self>, executor: &ExecutorHandle) -> bool {
        {
            let mut coord = self.coord.lock();
            if coord.state != FlusherState::Stopped {
                warn!(vbid = %self.vbid, state = %coord.state, "flusher already started");
                return false;
            }
            coord.state = FlusherState::Running;
        }

        let mut slot = self.flusher.lock();
        let task = executor.schedule(
            Box::new(FlusherTask::new(
                Arc::downgrade(self),
                self.vbid,
                self.config.flusher_wait(),
                self.config.flusher_retry_backoff(),
            )),
            Priority::FLUSHER,
            Duration::ZERO,
        );
        *slot = Some((task, executor.clone()));
        drop(slot);
        info!(vbid = %self.vbid, "flusher started");
        true
    }

    /// Asks a running flusher to drain and stop.
    pub fn stop_flusher(&self) -> bool {
        {
            let mut coord = self.coord.lock();
            if coord.state != FlusherState::Running {
                return false;
            }
            coord.state = FlusherState::ShuttingDown;
        }
        self.work_available.notify_all();
        if let Some((task, executor)) = self.flusher.lock().as_ref() {
            executor.wake(task);
        }
        info!(vbid = %self.vbid, "flusher shutting down");
        true
    }

    /// Called when the executor drops flusher task `task_id` before it
    /// stopped itself. The store returns to `Stopped` so a flusher can be
    /// started again; queued keys stay queued.
    pub(crate) fn flusher_abandoned(&self, task_id: u64) {
        {
            let mut flusher = self.flusher.lock();
            if flusher.as_ref().map(|(task, _)| task.id()) != Some(task_id) {
                return;
            }
            flusher.take();
        }
        let state = {
            let mut coord = self.coord.lock();
            std::mem::replace(&mut coord.state, FlusherState::Stopped)
        };
        self.stopped.notify_all();
        warn!(
            vbid = %self.vbid,
            %state,
            queued = self.queue_size(),
            "flusher task dropped by its executor"
        );
    }

    /// Called by the flusher task on exit.
    pub(crate) fn flusher_stopped(&self) {
        self.flusher.lock().take();
        self.coord.lock().state = FlusherState::Stopped;
        self.stopped.notify_all();
        info!(vbid = %self.vbid, "flusher stopped");
    }

    /// Waits until the flusher is stopped. Returns false on timeout.
    pub fn wait_for_flusher_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut coord = self.coord.lock();
        while coord.state != FlusherState::Stopped {
            if self.stopped.wait_until(&mut coord, deadline).timed_out() {
                return coord.state == FlusherState::Stopped;
            }
        }
        true
    }

    /// Stops the flusher after a final drain (or drains inline if no flusher
    /// runs) and stops visits. Returns true if everything queued was
    /// persisted.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let stopped = match self.flusher_state() {
            FlusherState::Stopped => {
                loop {
                    let report = self.flush(false);
                    if report.is_empty() || report.failed > 0 {
                        break;
                    }
                }
                true
            }
            _ => {
                self.stop_flusher();
                self.wait_for_flusher_stopped(timeout)
            }
        };
        self.table.set_active(false);

        let remaining = self.queue_size();
        if remaining > 0 {
            warn!(vbid = %self.vbid, remaining, "shutdown with unpersisted documents");
        }
        stopped && remaining == 0
    }

    /// Drops all state: queued keys, persisted data, in-memory documents and
    /// statistics.
    pub fn reset(&self) -> Result<(), PersistenceError> {
        let mut kv = self.kv.lock();
        {
            let mut coord = self.coord.lock();
            coord.towrite.clear();
            coord.epoch += 1;
            coord.stats = FlushStats::default();
            coord.manifest = None;
        }
        kv.reset()?;
        self.table.clear(false);
        self.table.ep_stats().reset();
        info!(vbid = %self.vbid, "store reset");
        Ok(())
    }

    /// Changes the memory quota. Existing documents are kept even if they
    /// exceed it; new allocations are refused until usage drops.
    pub fn set_max_data_size(&self, bytes: usize) {
        self.table.ep_stats().set_max_data_size(bytes);
        info!(vbid = %self.vbid, max_data_size = bytes, "memory quota changed");
    }

    #[cfg(test)]
    pub(crate) fn force_flusher_state(&self, state: FlusherState) {
        self.coord.lock().state = state;
    }
}

/// The swapped-out queue of a flush cycle. Keys not yet taken when it is
/// dropped go back to the front of the store's queue.
struct SwappedQueue<'a> {
    store: &'a EpStore,
    keys: DirtyQueue,
    epoch: u64,
}

impl Drop for SwappedQueue<'_> {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let mut coord = self.store.coord.lock();
        if coord.epoch != self.epoch {
            return;
        }
        let count = self.keys.len();
        coord.towrite.push_front_all(self.keys.drain());
        debug!(vbid = %self.store.vbid, count, "requeued unflushed keys");
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BatchOutcome {
    sets: usize,
    deletes: usize,
    failed: usize,
    purged: usize,
    committed: bool,
}

enum PendingWrite {
    Set(Item),
    Del,
}

struct PendingEntry {
    key: Bytes,
    by_seqno: u64,
    write: PendingWrite,
}

type Acks = Arc<Mutex<Vec<Option<Result<(), PersistenceError>>>>>;

/// Writes issued in the open transaction, waiting for their callbacks.
///
/// Settling handles each entry by its acknowledgement. If the batch is
/// dropped unsettled (a panic in the persistence layer), every entry is
/// treated as failed.
struct PendingBatch<'a> {
    store: &'a EpStore,
    epoch: u64,
    entries: Vec<PendingEntry>,
    acks: Acks,
    settled: bool,
    dirty_age: Option<Duration>,
    data_age: Option<Duration>,
}

impl<'a> PendingBatch<'a> {
    fn new(store: &'a EpStore, epoch: u64) -> Self {
        Self {
            store,
            epoch,
            entries: Vec::new(),
            acks: Arc::new(Mutex::new(Vec::new())),
            settled: false,
            dirty_age: None,
            data_age: None,
        }
    }

    fn note_ages(&mut self, queued: Instant, dirtied: Instant) {
        let now = Instant::now();
        let dirty_age = now.saturating_duration_since(queued);
        let data_age = now.saturating_duration_since(dirtied);
        self.dirty_age = Some(self.dirty_age.map_or(dirty_age, |a| a.max(dirty_age)));
        self.data_age = Some(self.data_age.map_or(data_age, |a| a.max(data_age)));
    }

    fn track(&mut self, key: Bytes, by_seqno: u64, write: PendingWrite) -> PersistenceCallback {
        let index = self.entries.len();
        self.entries.push(PendingEntry {
            key,
            by_seqno,
            write,
        });
        self.acks.lock().push(None);

        let acks = Arc::clone(&self.acks);
        Box::new(move |result| {
            if let Some(ack) = acks.lock().get_mut(index) {
                *ack = Some(result);
            }
        })
    }

    fn settle(mut self) -> BatchOutcome {
        self.settle_entries()
    }

    fn settle_entries(&mut self) -> BatchOutcome {
        self.settled = true;
        let acks = std::mem::take(&mut *self.acks.lock());
        let mut outcome = BatchOutcome::default();
        let mut retry = Vec::new();

        for (entry, ack) in self.entries.drain(..).zip(acks) {
            match (ack, &entry.write) {
                (Some(Ok(())), PendingWrite::Set(_)) => outcome.sets += 1,
                (Some(Ok(())), PendingWrite::Del) => {
                    outcome.deletes += 1;
                    if self.store.purge_tombstone(&entry) {
                        outcome.purged += 1;
                    }
                }
                _ => {
                    outcome.failed += 1;
                    if self.store.redirty(&entry, self.epoch) {
                        retry.push(entry.key);
                    }
                }
            }
        }

        if !retry.is_empty() {
            self.store.requeue(retry, self.epoch);
        }
        outcome
    }
}

impl Drop for PendingBatch<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let outcome = self.settle_entries();
            warn!(
                vbid = %self.store.vbid,
                redirtied = outcome.failed,
                "flush batch abandoned"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryKVStore, PersistedOp};
    use crate::storage::Datatype;
    use crate::tasks::task::tests::counting;
    use crate::tasks::ExecutorPool;
    use crate::time::ManualClock;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::Ordering;
    use std::thread;

    fn store_with(config: StoreConfig) -> (Arc<EpStore>, MemoryKVStore) {
        let kv = MemoryKVStore::new(Vbid(config.vbucket));
        let store = Arc::new(EpStore::new(config, Box::new(kv.clone())));
        (store, kv)
    }

    fn store() -> (Arc<EpStore>, MemoryKVStore) {
        store_with(StoreConfig::default())
    }

    fn item(key: &str, value: &str) -> Item {
        Item::new(key.to_string(), 0, 0, value.to_string())
    }

    fn is_dirty(store: &EpStore, key: &[u8]) -> bool {
        store
            .table()
            .find(key, TrackReference::No, WantsDeleted::Yes)
            .map(|sv| sv.is_dirty())
            .unwrap_or(false)
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_set_then_flush_writes_once() {
        let (store, kv) = store();
        assert_eq!(store.set(&item("k1", "v1")), MutationStatus::WasClean);
        assert!(is_dirty(&store, b"k1"));
        assert_eq!(store.queue_size(), 1);

        let report = store.flush(false);
        assert_eq!(report.flushed, 1);
        assert_eq!(report.commits, 1);

        assert_eq!(kv.journal_for(b"k1").len(), 1);
        assert!(matches!(&kv.journal_for(b"k1")[0], PersistedOp::Set(i) if i.value.data() == "v1"));
        assert!(!is_dirty(&store, b"k1"));
        assert!(store.flush(false).is_empty());
    }

    #[test]
    fn test_set_then_delete_writes_only_delete() {
        let (store, kv) = store();
        store.set(&item("k1", "v1"));
        store.del(b"k1", 0).unwrap();
        assert_eq!(store.queue_size(), 1);

        store.flush(false);
        assert_eq!(kv.journal_for(b"k1"), vec![PersistedOp::Del(Bytes::from("k1"))]);

        // The durable tombstone is purged from memory.
        assert!(store
            .table()
            .find(b"k1", TrackReference::No, WantsDeleted::Yes)
            .is_none());
        assert_eq!(store.stats().flush.tombstones_purged, 1);
    }

    #[test]
    fn test_two_sets_write_final_value_once() {
        let (store, kv) = store();
        assert_eq!(store.set(&item("k1", "first")), MutationStatus::WasClean);
        assert_eq!(store.set(&item("k1", "second")), MutationStatus::WasDirty);
        assert_eq!(store.queue_size(), 1);

        store.flush(false);
        let writes = kv.journal_for(b"k1");
        assert_eq!(writes.len(), 1);
        assert!(matches!(&writes[0], PersistedOp::Set(i) if i.value.data() == "second"));
    }

    #[test]
    fn test_failed_commit_keeps_document_dirty_until_retry() {
        let (store, kv) = store();
        store.set(&item("k1", "v1"));
        kv.fail_next_commits(1);

        let report = store.flush(false);
        assert_eq!(report.failed, 1);
        assert_eq!(report.commits, 0);
        assert!(is_dirty(&store, b"k1"));
        assert_eq!(store.queue_size(), 1);
        assert!(kv.journal().is_empty());

        let report = store.flush(false);
        assert_eq!(report.flushed, 1);
        assert!(!is_dirty(&store, b"k1"));
        assert_eq!(kv.journal_for(b"k1").len(), 1);

        let stats = store.stats().flush;
        assert_eq!(stats.commit_failures, 1);
        assert_eq!(stats.items_redirtied, 1);
        assert_eq!(stats.commits, 1);
    }

    #[test]
    fn test_failed_begin_requeues_batch() {
        let (store, kv) = store();
        store.set(&item("k1", "v1"));
        kv.fail_next_begins(1);

        let report = store.flush(false);
        assert_eq!(report.failed, 1);
        assert!(is_dirty(&store, b"k1"));
        assert_eq!(store.queue_size(), 1);

        store.flush(false);
        assert_eq!(kv.len(), 1);
    }

    #[test]
    fn test_commit_failure_requeues_unreached_batches() {
        let config = StoreConfig {
            txn_size: 2,
            ..StoreConfig::default()
        };
        let (store, kv) = store_with(config);
        for i in 0..5 {
            store.set(&item(&format!("k{}", i), "v"));
        }
        kv.fail_next_commits(1);

        let report = store.flush(false);
        assert_eq!(report.failed, 2);
        assert_eq!(store.queue_size(), 5);

        let report = store.flush(false);
        assert_eq!(report.flushed, 5);
        assert_eq!(report.commits, 3);
        assert_eq!(kv.len(), 5);
    }

    #[test]
    fn test_panicking_commit_leaves_documents_dirty() {
        let (store, kv) = store();
        store.set(&item("k1", "v1"));
        store.set(&item("k2", "v2"));
        kv.panic_next_commit();

        let result = catch_unwind(AssertUnwindSafe(|| store.flush(false)));
        assert!(result.is_err());
        assert!(is_dirty(&store, b"k1"));
        assert!(is_dirty(&store, b"k2"));
        assert_eq!(store.queue_size(), 2);

        store.flush(false);
        assert_eq!(kv.len(), 2);
    }

    #[test]
    fn test_flusher_task_survives_panicking_commit() {
        let pool = ExecutorPool::with_panic_backoff(2, Duration::from_millis(10)).unwrap();
        let (store, kv) = store();
        kv.panic_next_commit();
        assert!(store.start_flusher(&pool.handle()));

        store.set(&item("k1", "v1"));
        assert!(wait_until(Duration::from_secs(10), || kv.committed(b"k1").is_some()));
        assert!(store.shutdown(Duration::from_secs(10)));
        pool.shutdown();
    }

    #[test]
    fn test_flusher_state_machine() {
        let pool = ExecutorPool::with_panic_backoff(2, Duration::from_millis(10)).unwrap();
        let (store, kv) = store();
        assert_eq!(store.flusher_state(), FlusherState::Stopped);
        assert!(!store.stop_flusher());

        assert!(store.start_flusher(&pool.handle()));
        assert_eq!(store.flusher_state(), FlusherState::Running);
        assert!(!store.start_flusher(&pool.handle()));

        store.set(&item("k1", "v1"));
        assert!(wait_until(Duration::from_secs(10), || kv.len() == 1));

        assert!(store.stop_flusher());
        assert!(store.wait_for_flusher_stopped(Duration::from_secs(10)));
        assert_eq!(store.flusher_state(), FlusherState::Stopped);

        // Restartable once stopped.
        assert!(store.start_flusher(&pool.handle()));
        store.set(&item("k2", "v2"));
        assert!(store.shutdown(Duration::from_secs(10)));
        assert_eq!(kv.len(), 2);
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_without_flusher_drains_inline() {
        let (store, kv) = store();
        store.set(&item("k1", "v1"));
        assert!(store.shutdown(Duration::from_secs(1)));
        assert_eq!(kv.len(), 1);
        assert!(!store.table().is_active());
    }

    #[test]
    fn test_batches_respect_txn_size() {
        let config = StoreConfig {
            txn_size: 3,
            ..StoreConfig::default()
        };
        let (store, kv) = store_with(config);
        for i in 0..10 {
            store.set(&item(&format!("k{}", i), "v"));
        }
        let report = store.flush(false);
        assert_eq!(report.commits, 4);
        assert_eq!(kv.commit_count(), 4);
        assert_eq!(kv.len(), 10);
    }

    #[test]
    fn test_flush_stats_track_ages() {
        let (store, _kv) = store();
        store.set(&item("k1", "v1"));
        std::thread::sleep(Duration::from_millis(20));
        store.set(&item("k1", "v2"));
        store.flush(false);

        let stats = store.stats().flush;
        assert!(stats.dirty_age >= Duration::from_millis(20));
        assert!(stats.dirty_age >= stats.data_age);
        assert_eq!(stats.dirty_age_high_wat, stats.dirty_age);
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.items_flushed, 1);
    }

    #[test]
    fn test_flush_stats_track_duration_and_todo() {
        let config = StoreConfig {
            txn_size: 2,
            ..StoreConfig::default()
        };
        let (store, kv) = store_with(config);
        for i in 0..5 {
            store.set(&item(&format!("k{}", i), "v"));
        }
        kv.fail_next_commits(1);
        store.flush(false);

        let stats = store.stats().flush;
        assert_eq!(stats.flusher_todo, 0);
        assert!(stats.flush_duration_high_wat >= stats.flush_duration);
        let first = stats.flush_duration_high_wat;

        store.flush(false);
        let stats = store.stats().flush;
        assert_eq!(stats.flusher_todo, 0);
        assert_eq!(stats.cycles, 2);
        assert!(stats.flush_duration_high_wat >= first);
        assert!(stats.flush_duration_high_wat >= stats.flush_duration);
        assert_eq!(kv.len(), 5);
    }

    #[test]
    fn test_idle_flusher_leaves_room_for_lower_priority_tasks() {
        let pool = ExecutorPool::with_panic_backoff(1, Duration::from_millis(10)).unwrap();
        let config = StoreConfig {
            flusher_wait_ms: 60_000,
            ..StoreConfig::default()
        };
        let (store, kv) = store_with(config);
        assert!(store.start_flusher(&pool.handle()));
        thread::sleep(Duration::from_millis(50));

        let (work, runs) = counting(1);
        pool.schedule(work, Priority::DEFRAGMENTER, Duration::ZERO);
        assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::SeqCst) == 1));

        // New work wakes the idle flusher long before its wait runs out.
        store.set(&item("k1", "v1"));
        assert!(wait_until(Duration::from_secs(5), || kv.committed(b"k1").is_some()));

        assert!(store.shutdown(Duration::from_secs(5)));
        pool.shutdown();
    }

    #[test]
    fn test_flusher_restarts_after_its_pool_shuts_down() {
        let (store, kv) = store();
        let first = ExecutorPool::with_panic_backoff(1, Duration::from_millis(10)).unwrap();
        assert!(store.start_flusher(&first.handle()));
        first.shutdown();
        assert_eq!(store.flusher_state(), FlusherState::Stopped);

        store.set(&item("k1", "v1"));
        let second = ExecutorPool::with_panic_backoff(1, Duration::from_millis(10)).unwrap();
        assert!(store.start_flusher(&second.handle()));
        assert!(store.shutdown(Duration::from_secs(5)));
        assert_eq!(store.flusher_state(), FlusherState::Stopped);
        assert!(kv.committed(b"k1").is_some());
        second.shutdown();
    }

    #[test]
    fn test_cancelled_flusher_returns_to_stopped() {
        let pool = ExecutorPool::with_panic_backoff(1, Duration::from_millis(10)).unwrap();
        let (store, _kv) = store();
        assert!(store.start_flusher(&pool.handle()));
        let task = store
            .flusher
            .lock()
            .as_ref()
            .map(|(task, _)| Arc::clone(task))
            .unwrap();

        pool.cancel(&task);
        assert!(store.wait_for_flusher_stopped(Duration::from_secs(5)));
        assert!(store.start_flusher(&pool.handle()));
        assert!(store.shutdown(Duration::from_secs(5)));
        pool.shutdown();
    }

    #[test]
    fn test_concurrent_writers_leave_persisted_state_matching_memory() {
        const KEYS: usize = 64;
        let pool = ExecutorPool::with_panic_backoff(2, Duration::from_millis(10)).unwrap();
        let config = StoreConfig {
            txn_size: 8,
            flusher_wait_ms: 5,
            flusher_retry_backoff_ms: 1,
            ..StoreConfig::default()
        };
        let (store, kv) = store_with(config);
        assert!(store.start_flusher(&pool.handle()));

        let key = |n: usize| format!("key:{}", n % KEYS);
        let mut handles = vec![];
        for seed in 0..4u64 {
            let store = Arc::clone(&store);
            let kv = kv.clone();
            handles.push(thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(271828 + seed);
                for i in 0..2000 {
                    // One writer makes a few commits fail while the others keep writing.
                    if seed == 0 && i % 400 == 100 {
                        let before = store.stats().flush.commit_failures;
                        kv.fail_next_commits(1);
                        while store.stats().flush.commit_failures == before {
                            let n = rng.gen_range(0..KEYS);
                            store.set(&item(&key(n), &format!("{}:{}:retry", seed, i)));
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                    let n = rng.gen_range(0..KEYS);
                    match rng.gen_range(0..10) {
                        0..=6 => {
                            store.set(&item(&key(n), &format!("{}:{}", seed, i)));
                        }
                        7 | 8 => {
                            let _ = store.del(key(n).as_bytes(), 0);
                        }
                        _ => {
                            store.evict_key(key(n).as_bytes());
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(store.shutdown(Duration::from_secs(10)));
        assert_eq!(store.queue_size(), 0);
        assert!(store.stats().flush.commit_failures >= 5);

        for n in 0..KEYS {
            let key = key(n);
            let persisted = kv.committed(key.as_bytes());
            let in_memory = store
                .table()
                .find(key.as_bytes(), TrackReference::No, WantsDeleted::No)
                .map(|sv| {
                    assert!(!sv.is_dirty(), "{} still dirty after shutdown", key);
                    (sv.by_seqno(), sv.is_resident().then(|| sv.to_item().value))
                });
            match (in_memory, persisted) {
                (None, None) => {}
                (Some((by_seqno, value)), Some(persisted)) => {
                    assert_eq!(persisted.by_seqno, by_seqno, "{} persisted a stale write", key);
                    if let Some(value) = value {
                        assert_eq!(value.data(), persisted.value.data(), "{}", key);
                    }
                }
                (memory, disk) => panic!(
                    "{}: memory has {:?}, persistence has {:?}",
                    key,
                    memory.map(|(seqno, _)| seqno),
                    disk.map(|item| item.by_seqno)
                ),
            }
        }
        pool.shutdown();
    }

    #[test]
    fn test_manifest_rides_next_commit() {
        let (store, kv) = store();
        let manifest = Manifest {
            uid: 3,
            payload: Bytes::from_static(b"collections"),
        };
        store.set_manifest(manifest.clone());
        store.set(&item("k1", "v1"));
        store.flush(false);
        assert_eq!(kv.last_manifest(), Some(manifest));
    }

    #[test]
    fn test_flush_wait_times_out_when_idle() {
        let config = StoreConfig {
            flusher_wait_ms: 20,
            ..StoreConfig::default()
        };
        let (store, _kv) = store_with(config);
        store.coord.lock().state = FlusherState::Running;
        let start = Instant::now();
        assert!(store.flush(true).is_empty());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_lazy_expiry_on_get() {
        let clock = Arc::new(ManualClock::new(0));
        let kv = MemoryKVStore::new(Vbid(0));
        let store = EpStore::with_clock(StoreConfig::default(), Box::new(kv.clone()), clock.clone());
        store.set(&Item::new("k1", 0, 10, "v1"));
        store.flush(false);

        assert!(store.get(b"k1").is_ok());
        clock.set(10);
        assert_eq!(store.get(b"k1"), Err(StoreError::KeyNotFound));
        assert_eq!(store.table().num_deleted_items(), 1);
        assert_eq!(store.queue_size(), 1);

        store.flush(false);
        assert!(kv.committed(b"k1").is_none());
    }

    #[test]
    fn test_get_reloads_ejected_value() {
        let (store, kv) = store();
        store.set(&item("k1", "v1").with_datatype(Datatype::JSON));
        store.flush(false);

        let before = store.table().stats();
        assert!(store.evict_key(b"k1"));
        assert_eq!(store.table().num_non_resident_items(), 1);

        let got = store.get(b"k1").unwrap();
        assert_eq!(got.value.data().as_ref(), b"v1");
        assert_eq!(got.datatype, Datatype::JSON);
        assert_eq!(store.table().num_non_resident_items(), 0);
        assert!(!is_dirty(&store, b"k1"));

        let mut after = store.table().stats();
        after.num_ejects -= 1;
        assert_eq!(after, before);
        assert_eq!(kv.commit_count(), 1);
    }

    #[test]
    fn test_dirty_documents_are_not_evicted() {
        let (store, _kv) = store();
        store.set(&item("k1", "v1"));
        assert!(!store.evict_key(b"k1"));
        store.flush(false);
        assert!(store.evict_key(b"k1"));
        assert!(!store.evict_key(b"k1"));
    }

    #[test]
    fn test_full_eviction_fetches_through_temp_item() {
        let config = StoreConfig {
            eviction_policy: EvictionPolicy::FullEviction,
            ..StoreConfig::default()
        };
        let (store, _kv) = store_with(config);
        store.set(&item("k1", "v1"));
        store.flush(false);

        assert!(store.evict_key(b"k1"));
        assert_eq!(store.table().num_items(), 0);

        let got = store.get(b"k1").unwrap();
        assert_eq!(got.value.data().as_ref(), b"v1");
        assert_eq!(store.table().num_items(), 1);
        assert_eq!(store.table().num_temp_items(), 0);
        assert!(!is_dirty(&store, b"k1"));

        assert_eq!(store.get(b"missing"), Err(StoreError::KeyNotFound));
        assert_eq!(store.table().num_temp_items(), 0);
    }

    #[test]
    fn test_full_eviction_delete_of_evicted_key() {
        let config = StoreConfig {
            eviction_policy: EvictionPolicy::FullEviction,
            ..StoreConfig::default()
        };
        let (store, kv) = store_with(config);
        store.set(&item("k1", "v1"));
        store.flush(false);
        store.evict_key(b"k1");

        store.del(b"k1", 0).unwrap();
        store.flush(false);
        assert!(kv.committed(b"k1").is_none());
        assert_eq!(store.del(b"k1", 0), Err(StoreError::KeyNotFound));
    }

    #[test]
    fn test_get_locked_and_unlock() {
        let (store, _kv) = store();
        store.set(&item("k1", "v1"));

        let locked = store.get_locked(b"k1", 10).unwrap();
        assert_eq!(store.get_locked(b"k1", 10), Err(StoreError::Locked));
        assert_eq!(store.set(&item("k1", "x")), MutationStatus::IsLocked);
        assert_eq!(store.del(b"k1", 0), Err(StoreError::Locked));

        assert!(matches!(
            store.unlock_key(b"k1", locked.cas + 1),
            Err(StoreError::CasMismatch { .. })
        ));
        store.unlock_key(b"k1", locked.cas).unwrap();
        assert_eq!(store.unlock_key(b"k1", locked.cas), Err(StoreError::NotLocked));
        assert_eq!(store.set(&item("k1", "x")), MutationStatus::WasDirty);
    }

    #[test]
    fn test_locked_document_accepts_its_cas() {
        let (store, _kv) = store();
        store.set(&item("k1", "v1"));
        let locked = store.get_locked(b"k1", 0).unwrap();
        assert_eq!(
            store.set(&item("k1", "v2").with_cas(locked.cas)),
            MutationStatus::WasDirty
        );
        assert_eq!(store.unlock_key(b"k1", locked.cas), Err(StoreError::NotLocked));
    }

    #[test]
    fn test_delete_cas_mismatch() {
        let (store, _kv) = store();
        store.set(&item("k1", "v1"));
        let cas = store.get(b"k1").unwrap().cas;
        assert!(matches!(
            store.del(b"k1", cas + 1),
            Err(StoreError::CasMismatch { .. })
        ));
        let tombstone_cas = store.del(b"k1", cas).unwrap();
        assert_ne!(tombstone_cas, cas);
        assert_eq!(store.get(b"k1"), Err(StoreError::KeyNotFound));
    }

    #[test]
    fn test_add_semantics() {
        let (store, _kv) = store();
        assert_eq!(store.add(&item("k", "v")), AddStatus::Success);
        assert_eq!(store.add(&item("k", "v")), AddStatus::Exists);

        store.del(b"k", 0).unwrap();
        // Tombstone still dirty: not queued twice.
        assert_eq!(store.add(&item("k", "again")), AddStatus::UnDel);
        assert_eq!(store.queue_size(), 1);
        assert_eq!(store.get(b"k").unwrap().value.data().as_ref(), b"again");
    }

    #[test]
    fn test_add_sees_evicted_document() {
        let config = StoreConfig {
            eviction_policy: EvictionPolicy::FullEviction,
            ..StoreConfig::default()
        };
        let (store, _kv) = store_with(config);
        store.set(&item("k", "v"));
        store.flush(false);
        assert!(store.evict_key(b"k"));

        assert_eq!(store.add(&item("k", "other")), AddStatus::Exists);
        assert_eq!(store.add(&item("fresh", "v")), AddStatus::Success);
        assert_eq!(store.table().num_temp_items(), 0);
    }

    #[test]
    fn test_memory_quota_rejects_writes() {
        let config = StoreConfig {
            max_data_size: 200,
            ..StoreConfig::default()
        };
        let (store, _kv) = store_with(config);
        assert_eq!(store.set(&item("k1", "v1")), MutationStatus::WasClean);
        assert_eq!(
            store.set(&Item::new("k2", 0, 0, vec![0u8; 200])),
            MutationStatus::NoMem
        );
        assert_eq!(store.queue_size(), 1);

        store.set_max_data_size(0);
        assert_eq!(
            store.set(&Item::new("k2", 0, 0, vec![0u8; 200])),
            MutationStatus::WasClean
        );
        assert_eq!(store.stats().max_data_size, 0);
    }

    #[test]
    fn test_reset_drops_everything() {
        let (store, kv) = store();
        store.set(&item("k1", "v1"));
        store.flush(false);
        store.set(&item("k2", "v2"));

        store.reset().unwrap();
        assert_eq!(store.queue_size(), 0);
        assert!(kv.is_empty());
        assert_eq!(store.table().num_items(), 0);
        assert_eq!(store.stats().mem_used, 0);
        assert_eq!(store.stats().flush, FlushStats::default());
    }
}
