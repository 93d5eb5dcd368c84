//! Concurrent Resizable Hash Table
//!
//! The hash table holds one [`StoredValue`] per key for a shard. It is the
//! only owner of its slots; callers reach a slot through a
//! [`HashBucketLock`] and never keep a reference past that lock.
//!
//! ## Locking
//!
//! ```text
//!   bucket:   0    1    2    3    4    5    6    7    8   ...
//!   lock:     0    1    2    0    1    2    0    1    2   ...  (bucket % n_locks)
//!
//!   ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//!   │ Mutex<Stripe>│ │ Mutex<Stripe>│ │ Mutex<Stripe>│
//!   │ 0, 3, 6, ... │ │ 1, 4, 7, ... │ │ 2, 5, 8, ... │
//!   └──────────────┘ └──────────────┘ └──────────────┘
//! ```
//!
//! The number of locks is fixed when the table is built. Each lock owns the
//! chains of every bucket that maps to it, so holding the lock is the only
//! way to reach those slots. A normal operation holds exactly one lock.
//! `resize` and `clear` are the only operations that hold all of them, and
//! they always take them in ascending order.
//!
//! Because the bucket count can change, locating a bucket is a loop: compute
//! the bucket from the current size, take its lock, and check that the size
//! did not change in between. Size only changes with every lock held, so a
//! caller holding any lock sees a stable size.
//!
//! ## Accounting
//!
//! Every counter (item counts, byte sizes, datatype counts, and the shared
//! [`EpStats`]) is derived from slot state. Mutations un-account the slot,
//! change it, then account it again, which keeps the counters byte-exact
//! across any sequence of operations.

use super::item::{Blob, Datatype, Item};
use super::stats::EpStats;
use super::stored_value::{SlotKind, StoredValue, SLOT_OVERHEAD};
use crate::time::{Clock, RelTime, SystemClock};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Bucket counts used when auto-sizing.
const PRIME_SIZE_TABLE: &[usize] = &[
    3, 7, 13, 23, 47, 97, 193, 383, 769, 1531, 3079, 6143, 12289, 24571, 49157, 98299,
    196613, 393209, 786433, 1572869, 3145721, 6291449, 12582917, 25165813, 50331653,
    100663291, 201326611, 402653189, 805306357, 1610612741,
];

/// Largest bucket count a resize accepts.
pub const MAX_HT_SIZE: usize = i32::MAX as usize;

/// Outcome of a `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// A CAS was supplied but there is no live document.
    NotFound,
    /// The supplied CAS does not match the document.
    InvalidCas,
    /// The document was clean (or new) before this write.
    WasClean,
    /// The document already had unpersisted changes.
    WasDirty,
    /// The document is locked and the CAS does not match the lock.
    IsLocked,
    /// The write does not fit under the memory quota.
    NoMem,
}

/// Outcome of an `add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddStatus {
    Success,
    NoMem,
    /// A live document (or a placeholder) already exists.
    Exists,
    /// A tombstone was brought back to life.
    UnDel,
}

/// What ejection releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Release the value payload, keep key and metadata.
    #[default]
    ValueOnly,
    /// Release the whole slot.
    FullEviction,
}

/// Whether a lookup returns tombstones and temp placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantsDeleted {
    Yes,
    No,
}

/// Whether a lookup counts as a reference for NRU purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackReference {
    Yes,
    No,
}

/// Failures of the copy-on-write replace.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashTableError {
    /// The slot is no longer in its bucket (released concurrently).
    #[error("slot not found in bucket")]
    NotFound,

    /// The table does not use the ordered slot variant.
    #[error("operation requires an ordered table")]
    NotOrdered,
}

/// The slot chains owned by one lock.
///
/// Bucket `b` lives in stripe `b % n_locks` at index `b / n_locks`.
#[derive(Debug, Default)]
struct LockStripe {
    buckets: Vec<Vec<StoredValue>>,
}

/// Number of buckets in `0..size` that map to `lock`.
fn buckets_for_lock(lock: usize, size: usize, n_locks: usize) -> usize {
    if lock < size {
        (size - 1 - lock) / n_locks + 1
    } else {
        0
    }
}

fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// A held bucket lock.
///
/// All slot access for the bucket happens through this guard. Dropping it
/// releases the lock.
pub struct HashBucketLock<'a> {
    bucket_num: usize,
    lock_num: usize,
    index: usize,
    guard: MutexGuard<'a, LockStripe>,
}

impl<'a> HashBucketLock<'a> {
    pub fn bucket_num(&self) -> usize {
        self.bucket_num
    }

    pub fn lock_num(&self) -> usize {
        self.lock_num
    }

    /// Releases the lock.
    pub fn unlock(self) {}

    fn chain(&self) -> &Vec<StoredValue> {
        &self.guard.buckets[self.index]
    }

    fn chain_mut(&mut self) -> &mut Vec<StoredValue> {
        &mut self.guard.buckets[self.index]
    }

    fn position(&self, key: &[u8]) -> Option<usize> {
        self.chain().iter().position(|sv| sv.key().as_ref() == key)
    }
}

impl fmt::Debug for HashBucketLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashBucketLock")
            .field("bucket_num", &self.bucket_num)
            .field("lock_num", &self.lock_num)
            .finish()
    }
}

/// A slot found by [`HashTable::find`], with its bucket lock held.
pub struct FoundValue<'a> {
    table: &'a HashTable,
    hbl: HashBucketLock<'a>,
    index: usize,
}

impl<'a> FoundValue<'a> {
    pub fn bucket_num(&self) -> usize {
        self.hbl.bucket_num()
    }

    /// Overwrites the slot's value and metadata from `item`. The new value
    /// keeps the item's blob age.
    pub fn set_value(&mut self, item: &Item) {
        let cas = self.table.generate_cas();
        let seqno = self.table.generate_seqno();
        self.table.update_at(&mut self.hbl, self.index, |sv| sv.set_value(item, cas, seqno));
    }

    /// Gives back the bucket lock, e.g. for further `unlocked_*` calls.
    pub fn into_lock(self) -> HashBucketLock<'a> {
        self.hbl
    }
}

impl Deref for FoundValue<'_> {
    type Target = StoredValue;

    fn deref(&self) -> &StoredValue {
        &self.hbl.chain()[self.index]
    }
}

impl DerefMut for FoundValue<'_> {
    fn deref_mut(&mut self) -> &mut StoredValue {
        let index = self.index;
        &mut self.hbl.chain_mut()[index]
    }
}

/// The slot a visitor is looking at, plus the lock covering it.
///
/// The visitor may use [`LockedSlot::lock`] to run further `unlocked_*`
/// operations on the same bucket, including releasing this slot. It must
/// not release other slots of the bucket.
pub struct LockedSlot<'a, 'g> {
    hbl: &'a mut HashBucketLock<'g>,
    index: usize,
}

impl<'a, 'g> LockedSlot<'a, 'g> {
    pub fn value(&self) -> &StoredValue {
        &self.hbl.chain()[self.index]
    }

    pub fn value_mut(&mut self) -> &mut StoredValue {
        let index = self.index;
        &mut self.hbl.chain_mut()[index]
    }

    pub fn key(&self) -> Bytes {
        self.value().key().clone()
    }

    pub fn bucket_num(&self) -> usize {
        self.hbl.bucket_num()
    }

    /// The bucket lock held for this slot.
    pub fn lock(&mut self) -> &mut HashBucketLock<'g> {
        &mut *self.hbl
    }
}

/// Visits slots one at a time. Returning `false` from `visit` stops (or
/// pauses) the traversal.
pub trait HashTableVisitor {
    fn visit(&mut self, slot: &mut LockedSlot<'_, '_>) -> bool;

    /// Called before each bucket is locked.
    fn set_up_hash_bucket_visit(&mut self) {}

    /// Called after each bucket's lock is released.
    fn tear_down_hash_bucket_visit(&mut self) {}
}

/// Visits bucket depths.
pub trait HashTableDepthVisitor {
    fn visit(&mut self, bucket: usize, depth: usize, mem: usize);
}

/// Collects chain depth statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HashTableDepthStatVisitor {
    pub min: Option<usize>,
    pub max: usize,
    pub size: usize,
    pub mem_used: usize,
}

impl HashTableDepthVisitor for HashTableDepthStatVisitor {
    fn visit(&mut self, _bucket: usize, depth: usize, mem: usize) {
        self.min = Some(self.min.map_or(depth, |m| m.min(depth)));
        self.max = self.max.max(depth);
        self.size += depth;
        self.mem_used += mem;
    }
}

/// Where a pause/resume visit stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    ht_size: usize,
    lock: usize,
    hash_bucket: usize,
}

impl Position {
    pub fn ht_size(&self) -> usize {
        self.ht_size
    }

    pub fn lock(&self) -> usize {
        self.lock
    }

    pub fn hash_bucket(&self) -> usize {
        self.hash_bucket
    }
}

/// Counts in-flight visits so resize can refuse to run under them.
struct VisitorTracker<'a>(&'a AtomicUsize);

impl<'a> VisitorTracker<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for VisitorTracker<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks a chronological visit in progress; stale pre-images are kept while
/// any exists.
struct RangeReadGuard<'a>(&'a HashTable);

impl Drop for RangeReadGuard<'_> {
    fn drop(&mut self) {
        let mut stale = self.0.stale.lock();
        if self.0.range_reads.fetch_sub(1, Ordering::SeqCst) == 1 {
            stale.clear();
        }
    }
}

/// A point-in-time copy of the table's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashTableStats {
    pub size: usize,
    pub num_locks: usize,
    pub num_items: usize,
    pub num_deleted_items: usize,
    pub num_temp_items: usize,
    pub num_non_resident_items: usize,
    pub num_ejects: usize,
    pub num_resizes: usize,
    pub mem_size: usize,
    pub cache_size: usize,
    pub meta_data_memory: usize,
    pub datatype_counts: [usize; Datatype::COUNT],
}

/// The per-shard hash table.
pub struct HashTable {
    stripes: Box<[Mutex<LockStripe>]>,
    size: AtomicUsize,
    initial_size: usize,
    ordered: bool,
    active: AtomicBool,
    resize_lock: Mutex<()>,
    visitors: AtomicUsize,
    stats: Arc<EpStats>,
    clock: Arc<dyn Clock>,
    next_cas: AtomicU64,
    next_seqno: AtomicU64,

    num_items: AtomicUsize,
    num_deleted_items: AtomicUsize,
    num_temp_items: AtomicUsize,
    num_non_resident: AtomicUsize,
    num_ejects: AtomicUsize,
    num_resizes: AtomicUsize,
    mem_size: AtomicUsize,
    cache_size: AtomicUsize,
    meta_data_memory: AtomicUsize,
    datatype_counts: [AtomicUsize; Datatype::COUNT],

    /// Ordered tables: every indexed slot by (by_seqno, key).
    seq_index: Mutex<BTreeSet<(u64, Bytes)>>,
    /// Ordered tables: pre-images replaced while a chronological visit runs.
    stale: Mutex<BTreeMap<(u64, Bytes), StoredValue>>,
    range_reads: AtomicUsize,
}

impl fmt::Debug for HashTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTable")
            .field("size", &self.size())
            .field("locks", &self.num_locks())
            .field("ordered", &self.ordered)
            .field("items", &self.num_items())
            .finish()
    }
}

impl HashTable {
    /// Creates a table with `size` buckets and `locks` locks.
    ///
    /// Both are raised to at least one.
    pub fn new(stats: Arc<EpStats>, ordered: bool, size: usize, locks: usize) -> Self {
        let size = size.clamp(1, MAX_HT_SIZE);
        let n_locks = locks.max(1);
        let stripes = (0..n_locks)
            .map(|lock| {
                Mutex::new(LockStripe {
                    buckets: vec![Vec::new(); buckets_for_lock(lock, size, n_locks)],
                })
            })
            .collect();

        Self {
            stripes,
            size: AtomicUsize::new(size),
            initial_size: size,
            ordered,
            active: AtomicBool::new(true),
            resize_lock: Mutex::new(()),
            visitors: AtomicUsize::new(0),
            stats,
            clock: SystemClock::shared(),
            next_cas: AtomicU64::new(1),
            next_seqno: AtomicU64::new(1),
            num_items: AtomicUsize::new(0),
            num_deleted_items: AtomicUsize::new(0),
            num_temp_items: AtomicUsize::new(0),
            num_non_resident: AtomicUsize::new(0),
            num_ejects: AtomicUsize::new(0),
            num_resizes: AtomicUsize::new(0),
            mem_size: AtomicUsize::new(0),
            cache_size: AtomicUsize::new(0),
            meta_data_memory: AtomicUsize::new(0),
            datatype_counts: Default::default(),
            seq_index: Mutex::new(BTreeSet::new()),
            stale: Mutex::new(BTreeMap::new()),
            range_reads: AtomicUsize::new(0),
        }
    }

    /// Replaces the clock used for deletion times, lock and expiry checks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn num_locks(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> RelTime {
        self.clock.now()
    }

    pub fn ep_stats(&self) -> &Arc<EpStats> {
        &self.stats
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Deactivating makes running visits stop at the next bucket.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn num_items(&self) -> usize {
        self.num_items.load(Ordering::Relaxed)
    }

    pub fn num_deleted_items(&self) -> usize {
        self.num_deleted_items.load(Ordering::Relaxed)
    }

    pub fn num_temp_items(&self) -> usize {
        self.num_temp_items.load(Ordering::Relaxed)
    }

    pub fn num_non_resident_items(&self) -> usize {
        self.num_non_resident.load(Ordering::Relaxed)
    }

    /// Items whose value is in memory (tombstones included).
    pub fn num_in_memory_items(&self) -> usize {
        self.num_items()
            .saturating_sub(self.num_non_resident_items())
    }

    pub fn mem_size(&self) -> usize {
        self.mem_size.load(Ordering::Relaxed)
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size.load(Ordering::Relaxed)
    }

    pub fn meta_data_memory(&self) -> usize {
        self.meta_data_memory.load(Ordering::Relaxed)
    }

    pub fn datatype_counts(&self) -> [usize; Datatype::COUNT] {
        std::array::from_fn(|i| self.datatype_counts[i].load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> HashTableStats {
        HashTableStats {
            size: self.size(),
            num_locks: self.num_locks(),
            num_items: self.num_items(),
            num_deleted_items: self.num_deleted_items(),
            num_temp_items: self.num_temp_items(),
            num_non_resident_items: self.num_non_resident_items(),
            num_ejects: self.num_ejects.load(Ordering::Relaxed),
            num_resizes: self.num_resizes.load(Ordering::Relaxed),
            mem_size: self.mem_size(),
            cache_size: self.cache_size(),
            meta_data_memory: self.meta_data_memory(),
            datatype_counts: self.datatype_counts(),
        }
    }

    /// Highest sequence number handed out so far.
    pub fn high_seqno(&self) -> u64 {
        self.next_seqno.load(Ordering::Relaxed) - 1
    }

    pub(crate) fn generate_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed)
    }

    fn generate_seqno(&self) -> u64 {
        self.next_seqno.fetch_add(1, Ordering::Relaxed)
    }

    fn slot_kind(&self) -> SlotKind {
        if self.ordered {
            SlotKind::ordered()
        } else {
            SlotKind::plain()
        }
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    /// Locks the bucket `key` hashes to.
    pub fn get_locked_bucket(&self, key: &[u8]) -> HashBucketLock<'_> {
        let hash = hash_key(key);
        loop {
            let size = self.size();
            let bucket_num = (hash % size as u64) as usize;
            let hbl = self.lock_bucket_num(bucket_num);
            if size == self.size() {
                return hbl;
            }
            // Resized between computing the bucket and taking its lock.
        }
    }

    fn lock_bucket_num(&self, bucket_num: usize) -> HashBucketLock<'_> {
        let n_locks = self.num_locks();
        let lock_num = bucket_num % n_locks;
        HashBucketLock {
            bucket_num,
            lock_num,
            index: bucket_num / n_locks,
            guard: self.stripes[lock_num].lock(),
        }
    }

    /// Takes every lock in ascending order.
    fn lock_all(&self) -> Vec<MutexGuard<'_, LockStripe>> {
        self.stripes.iter().map(|stripe| stripe.lock()).collect()
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    fn account(&self, sv: &StoredValue) {
        if sv.is_temp() {
            self.num_temp_items.fetch_add(1, Ordering::Relaxed);
        } else {
            self.num_items.fetch_add(1, Ordering::Relaxed);
            if sv.is_deleted() {
                self.num_deleted_items.fetch_add(1, Ordering::Relaxed);
            } else if !sv.is_resident() {
                self.num_non_resident.fetch_add(1, Ordering::Relaxed);
            } else {
                self.datatype_counts[sv.datatype().index()].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.meta_data_memory
            .fetch_add(sv.meta_data_size(), Ordering::Relaxed);
        self.mem_size.fetch_add(sv.size(), Ordering::Relaxed);
        self.cache_size.fetch_add(sv.value_size(), Ordering::Relaxed);
        self.stats.add(sv.size());
    }

    fn unaccount(&self, sv: &StoredValue) {
        if sv.is_temp() {
            self.num_temp_items.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.num_items.fetch_sub(1, Ordering::Relaxed);
            if sv.is_deleted() {
                self.num_deleted_items.fetch_sub(1, Ordering::Relaxed);
            } else if !sv.is_resident() {
                self.num_non_resident.fetch_sub(1, Ordering::Relaxed);
            } else {
                self.datatype_counts[sv.datatype().index()].fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.meta_data_memory
            .fetch_sub(sv.meta_data_size(), Ordering::Relaxed);
        self.mem_size.fetch_sub(sv.size(), Ordering::Relaxed);
        self.cache_size.fetch_sub(sv.value_size(), Ordering::Relaxed);
        self.stats.sub(sv.size());
    }

    fn index_seqno(&self, sv: &StoredValue) {
        if self.ordered && !sv.is_temp() {
            self.seq_index.lock().insert((sv.by_seqno(), sv.key().clone()));
        }
    }

    fn unindex_seqno(&self, sv: &StoredValue) {
        if self.ordered && !sv.is_temp() {
            self.seq_index.lock().remove(&(sv.by_seqno(), sv.key().clone()));
        }
    }

    /// Applies `mutate` to the slot at `index` with accounting and the
    /// chronological index kept in step. Ordered tables replace the slot by
    /// a copy first so the pre-image survives for chronological readers.
    fn update_at(
        &self,
        hbl: &mut HashBucketLock<'_>,
        index: usize,
        mutate: impl FnOnce(&mut StoredValue),
    ) {
        if self.ordered {
            let copy = hbl.chain()[index].clone();
            let mut old = std::mem::replace(&mut hbl.chain_mut()[index], copy);
            old.mark_stale();
            self.retire_pre_image(old);
        }
        let sv = &mut hbl.chain_mut()[index];
        self.unaccount(sv);
        self.unindex_seqno(sv);
        mutate(sv);
        self.account(sv);
        self.index_seqno(sv);
    }

    fn retire_pre_image(&self, old: StoredValue) {
        let mut stale = self.stale.lock();
        if self.range_reads.load(Ordering::SeqCst) > 0 && !old.is_temp() {
            stale.insert((old.by_seqno(), old.key().clone()), old);
        }
    }

    fn insert_slot(&self, hbl: &mut HashBucketLock<'_>, sv: StoredValue) {
        self.account(&sv);
        self.index_seqno(&sv);
        hbl.chain_mut().push(sv);
    }

    fn remove_at(&self, hbl: &mut HashBucketLock<'_>, index: usize) -> StoredValue {
        let sv = hbl.chain_mut().remove(index);
        self.unaccount(&sv);
        self.unindex_seqno(&sv);
        sv
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Finds `key`, taking and holding its bucket lock.
    ///
    /// Tombstones and temp placeholders are only returned for
    /// `WantsDeleted::Yes`. `TrackReference::Yes` moves the slot's NRU one
    /// step toward most recently used.
    pub fn find(
        &self,
        key: &[u8],
        track: TrackReference,
        wants: WantsDeleted,
    ) -> Option<FoundValue<'_>> {
        let mut hbl = self.get_locked_bucket(key);
        let index = Self::find_index(&hbl, key, wants)?;
        if track == TrackReference::Yes {
            hbl.chain_mut()[index].referenced();
        }
        Some(FoundValue {
            table: self,
            hbl,
            index,
        })
    }

    fn find_index(hbl: &HashBucketLock<'_>, key: &[u8], wants: WantsDeleted) -> Option<usize> {
        let index = hbl.position(key)?;
        let sv = &hbl.chain()[index];
        if wants == WantsDeleted::No && (sv.is_deleted() || sv.is_temp()) {
            return None;
        }
        Some(index)
    }

    /// Finds `key` in a bucket whose lock the caller holds.
    pub fn unlocked_find<'h>(
        &self,
        hbl: &'h mut HashBucketLock<'_>,
        key: &[u8],
        wants: WantsDeleted,
        track: TrackReference,
    ) -> Option<&'h mut StoredValue> {
        let index = Self::find_index(hbl, key, wants)?;
        let sv = &mut hbl.chain_mut()[index];
        if track == TrackReference::Yes {
            sv.referenced();
        }
        Some(sv)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Stores `item`, creating the slot or updating it in place.
    pub fn set(&self, item: &Item) -> MutationStatus {
        let mut hbl = self.get_locked_bucket(&item.key);
        self.unlocked_set(&mut hbl, item)
    }

    /// [`HashTable::set`] for a caller already holding the bucket lock.
    pub fn unlocked_set(&self, hbl: &mut HashBucketLock<'_>, item: &Item) -> MutationStatus {
        let now = self.clock.now();
        let Some(index) = hbl.position(&item.key) else {
            if item.cas != 0 {
                return MutationStatus::NotFound;
            }
            let needed = SLOT_OVERHEAD + item.key.len() + item.value.len();
            if !self.stats.has_available_space(needed) {
                return MutationStatus::NoMem;
            }
            let sv = StoredValue::new(
                item,
                self.slot_kind(),
                self.generate_cas(),
                self.generate_seqno(),
            );
            self.insert_slot(hbl, sv);
            return MutationStatus::WasClean;
        };

        let existing = &hbl.chain()[index];
        if existing.is_locked(now) && item.cas != existing.cas() {
            return MutationStatus::IsLocked;
        }
        if item.cas != 0 {
            if existing.is_deleted() || existing.is_temp() {
                return MutationStatus::NotFound;
            }
            if item.cas != existing.cas() {
                return MutationStatus::InvalidCas;
            }
        }
        let old_size = existing.size();
        let new_size = existing.meta_data_size() + item.value.len();
        if new_size > old_size && !self.stats.has_available_space(new_size - old_size) {
            return MutationStatus::NoMem;
        }

        let status = if existing.is_dirty() {
            MutationStatus::WasDirty
        } else {
            MutationStatus::WasClean
        };
        let cas = self.generate_cas();
        let seqno = self.generate_seqno();
        self.update_at(hbl, index, |sv| sv.set_value(item, cas, seqno));
        status
    }

    /// Turns a live slot into a tombstone.
    ///
    /// Returns whether the slot was clean or dirty before, or `NotFound`
    /// if there is no live document.
    pub fn unlocked_soft_delete(
        &self,
        hbl: &mut HashBucketLock<'_>,
        key: &[u8],
        only_mark_deleted: bool,
    ) -> MutationStatus {
        let Some(index) = Self::find_index(hbl, key, WantsDeleted::No) else {
            return MutationStatus::NotFound;
        };
        let status = if hbl.chain()[index].is_dirty() {
            MutationStatus::WasDirty
        } else {
            MutationStatus::WasClean
        };
        let now = self.clock.now();
        let cas = self.generate_cas();
        let seqno = self.generate_seqno();
        self.update_at(hbl, index, |sv| sv.soft_delete(only_mark_deleted, now, cas, seqno));
        status
    }

    /// Physically removes `key` from the table, dropping the slot.
    pub fn unlocked_del(&self, hbl: &mut HashBucketLock<'_>, key: &[u8]) -> bool {
        self.unlocked_release(hbl, key).is_some()
    }

    /// Removes `key` from the table and hands the slot to the caller.
    pub fn unlocked_release(&self, hbl: &mut HashBucketLock<'_>, key: &[u8]) -> Option<StoredValue> {
        let index = hbl.position(key)?;
        Some(self.remove_at(hbl, index))
    }

    /// Replaces the slot for `key` by a copy of itself.
    ///
    /// Returns the copy, now in the table, and the original, marked stale
    /// and released to the caller. Counters are unchanged. Only ordered
    /// tables support this.
    pub fn unlocked_replace_by_copy<'h>(
        &self,
        hbl: &'h mut HashBucketLock<'_>,
        key: &[u8],
    ) -> Result<(&'h mut StoredValue, StoredValue), HashTableError> {
        if !self.ordered {
            return Err(HashTableError::NotOrdered);
        }
        let index = hbl.position(key).ok_or(HashTableError::NotFound)?;
        let copy = hbl.chain()[index].clone();
        let mut old = std::mem::replace(&mut hbl.chain_mut()[index], copy);
        old.mark_stale();
        Ok((&mut hbl.chain_mut()[index], old))
    }

    /// Ejects `key` according to `policy`. Only clean, resident documents
    /// can be ejected.
    pub fn unlocked_eject_item(
        &self,
        hbl: &mut HashBucketLock<'_>,
        key: &[u8],
        policy: EvictionPolicy,
    ) -> bool {
        let Some(index) = hbl.position(key) else {
            return false;
        };
        let sv = &hbl.chain()[index];
        if sv.is_dirty() || sv.is_temp() {
            return false;
        }
        match policy {
            EvictionPolicy::ValueOnly => {
                if sv.is_deleted() || !sv.is_resident() {
                    return false;
                }
                let sv = &mut hbl.chain_mut()[index];
                self.unaccount(sv);
                sv.eject_value();
                self.account(sv);
            }
            EvictionPolicy::FullEviction => {
                self.remove_at(hbl, index);
            }
        }
        self.num_ejects.fetch_add(1, Ordering::Relaxed);
        trace!(bucket = hbl.bucket_num(), ?policy, "ejected item");
        true
    }

    /// Puts an ejected value back. `item.by_seqno` must match the slot, so
    /// a value read before a newer mutation is never restored.
    pub fn unlocked_restore_value(&self, hbl: &mut HashBucketLock<'_>, item: &Item) -> bool {
        let Some(index) = hbl.position(&item.key) else {
            return false;
        };
        let sv = &hbl.chain()[index];
        if sv.is_resident() || sv.is_deleted() || sv.is_temp() || sv.by_seqno() != item.by_seqno {
            return false;
        }
        let sv = &mut hbl.chain_mut()[index];
        self.unaccount(sv);
        sv.restore_value(Blob::clone(&item.value));
        self.account(sv);
        true
    }

    /// Reserves `key` with a temp placeholder while it is fetched from disk.
    pub fn unlocked_add_temp_item(&self, hbl: &mut HashBucketLock<'_>, key: &Bytes) -> AddStatus {
        if hbl.position(key).is_some() {
            return AddStatus::Exists;
        }
        let sv = StoredValue::new_temp(key.clone(), self.slot_kind());
        if !self.stats.has_available_space(sv.size()) {
            return AddStatus::NoMem;
        }
        self.insert_slot(hbl, sv);
        AddStatus::Success
    }

    /// Turns a temp placeholder into the document fetched from disk.
    pub fn unlocked_fill_temp_item(&self, hbl: &mut HashBucketLock<'_>, item: &Item) -> bool {
        let Some(index) = hbl.position(&item.key) else {
            return false;
        };
        if !hbl.chain()[index].is_temp() {
            return false;
        }
        self.next_seqno.fetch_max(item.by_seqno + 1, Ordering::Relaxed);
        self.next_cas.fetch_max(item.cas + 1, Ordering::Relaxed);
        let sv = &mut hbl.chain_mut()[index];
        self.unaccount(sv);
        sv.fill_from_disk(item);
        self.account(sv);
        self.index_seqno(sv);
        true
    }

    /// Removes all slots. With `deactivate`, running visits stop as well.
    pub fn clear(&self, deactivate: bool) {
        if deactivate {
            self.set_active(false);
        }
        let mut guards = self.lock_all();
        for guard in guards.iter_mut() {
            for chain in guard.buckets.iter_mut() {
                for sv in chain.drain(..) {
                    self.unaccount(&sv);
                }
            }
        }
        self.seq_index.lock().clear();
        self.stale.lock().clear();
    }

    // ------------------------------------------------------------------
    // Resizing
    // ------------------------------------------------------------------

    /// Resizes to `new_size` buckets; 0 picks a size from the item count.
    ///
    /// Sizes above [`MAX_HT_SIZE`], the current size, and any resize while a
    /// visit is running are no-ops. Returns whether the table was resized.
    pub fn resize(&self, new_size: usize) -> bool {
        let new_size = if new_size == 0 {
            self.auto_size()
        } else {
            new_size
        };
        if new_size > MAX_HT_SIZE {
            return false;
        }

        let _serial = self.resize_lock.lock();
        let old_size = self.size();
        if new_size == old_size {
            return false;
        }

        let mut guards = self.lock_all();
        if self.visitors.load(Ordering::SeqCst) > 0 {
            debug!("resize skipped: visit in progress");
            return false;
        }

        let n_locks = guards.len();
        let mut values = Vec::with_capacity(self.num_items() + self.num_temp_items());
        for guard in guards.iter_mut() {
            for chain in guard.buckets.drain(..) {
                values.extend(chain);
            }
        }
        for (lock, guard) in guards.iter_mut().enumerate() {
            guard.buckets = vec![Vec::new(); buckets_for_lock(lock, new_size, n_locks)];
        }
        for sv in values {
            let bucket = (hash_key(sv.key()) % new_size as u64) as usize;
            guards[bucket % n_locks].buckets[bucket / n_locks].push(sv);
        }

        self.size.store(new_size, Ordering::Release);
        self.num_resizes.fetch_add(1, Ordering::Relaxed);
        debug!(from = old_size, to = new_size, "hash table resized");
        true
    }

    /// The bucket count `resize(0)` would choose.
    pub fn auto_size(&self) -> usize {
        let items = self.num_in_memory_items();
        let current = self.size();
        let i = PRIME_SIZE_TABLE
            .iter()
            .position(|&p| p >= items)
            .unwrap_or(PRIME_SIZE_TABLE.len());

        if i == PRIME_SIZE_TABLE.len() {
            PRIME_SIZE_TABLE[i - 1]
        } else if PRIME_SIZE_TABLE[i] < self.initial_size {
            self.initial_size
        } else if i == 0 {
            PRIME_SIZE_TABLE[0]
        } else {
            let (lower, upper) = (PRIME_SIZE_TABLE[i - 1], PRIME_SIZE_TABLE[i]);
            if current == lower || current == upper {
                // Stay put while either neighbour fits.
                current
            } else if items - lower < upper - items {
                lower
            } else {
                upper
            }
        }
    }

    // ------------------------------------------------------------------
    // Visiting
    // ------------------------------------------------------------------

    /// Visits every live slot and tombstone until the visitor stops.
    pub fn visit(&self, visitor: &mut dyn HashTableVisitor) {
        self.pause_resume_visit(visitor, &Position::default());
    }

    /// Visits from `start`, holding one bucket lock at a time.
    ///
    /// Returns the position to resume from. A visitor that pauses in the
    /// middle of a bucket resumes at the next bucket.
    pub fn pause_resume_visit(&self, visitor: &mut dyn HashTableVisitor, start: &Position) -> Position {
        let _tracker = VisitorTracker::new(&self.visitors);
        // Let a resize that started before we registered finish.
        drop(self.resize_lock.lock());
        let size = self.size();
        let n_locks = self.num_locks();

        let mut paused = false;
        let mut lock = if start.lock < n_locks { start.lock } else { 0 };
        let mut hash_bucket = 0;

        while self.is_active() && !paused && lock < n_locks {
            hash_bucket = lock;
            if start.lock == lock && start.ht_size == size && start.hash_bucket < size {
                hash_bucket = start.hash_bucket;
            }

            while !paused && hash_bucket < size {
                visitor.set_up_hash_bucket_visit();
                {
                    let mut hbl = self.lock_bucket_num(hash_bucket);
                    paused = !Self::visit_bucket(&mut hbl, visitor);
                }
                visitor.tear_down_hash_bucket_visit();
                hash_bucket += n_locks;
            }

            if paused && hash_bucket < size {
                break;
            }
            hash_bucket = size;
            lock += 1;
        }

        Position {
            ht_size: size,
            lock,
            hash_bucket,
        }
    }

    /// True if `position` is past the last bucket.
    pub fn is_end(&self, position: &Position) -> bool {
        position.lock >= self.num_locks()
    }

    fn visit_bucket(hbl: &mut HashBucketLock<'_>, visitor: &mut dyn HashTableVisitor) -> bool {
        let mut i = hbl.chain().len();
        while i > 0 {
            i -= 1;
            if i >= hbl.chain().len() || hbl.chain()[i].is_temp() {
                continue;
            }
            let mut slot = LockedSlot {
                hbl: &mut *hbl,
                index: i,
            };
            if !visitor.visit(&mut slot) {
                return false;
            }
        }
        true
    }

    /// Reports the chain depth and memory of every bucket.
    pub fn visit_depth(&self, visitor: &mut dyn HashTableDepthVisitor) {
        let _tracker = VisitorTracker::new(&self.visitors);
        drop(self.resize_lock.lock());
        let size = self.size();
        for bucket in 0..size {
            let hbl = self.lock_bucket_num(bucket);
            let chain = hbl.chain();
            let mem = chain.iter().map(StoredValue::size).sum();
            visitor.visit(bucket, chain.len(), mem);
        }
    }

    /// Visits an ordered table's slots in by-seqno order, starting at
    /// `from_seqno`.
    ///
    /// The set of slots is fixed when the visit starts. A slot replaced
    /// while the visit runs is seen as it was (its stale pre-image); a slot
    /// released in the meantime is skipped. Returns the number of slots
    /// visited.
    pub fn chronological_visit(
        &self,
        from_seqno: u64,
        mut visitor: impl FnMut(&StoredValue) -> bool,
    ) -> Result<usize, HashTableError> {
        if !self.ordered {
            return Err(HashTableError::NotOrdered);
        }
        self.range_reads.fetch_add(1, Ordering::SeqCst);
        let _guard = RangeReadGuard(self);

        let snapshot: Vec<(u64, Bytes)> = self
            .seq_index
            .lock()
            .range((from_seqno, Bytes::new())..)
            .cloned()
            .collect();

        // The visitor runs with no lock held, so it may write to the table.
        let mut visited = 0;
        for (seqno, key) in snapshot {
            let current = {
                let hbl = self.get_locked_bucket(&key);
                hbl.chain()
                    .iter()
                    .find(|sv| sv.key() == &key && sv.by_seqno() == seqno && !sv.is_temp())
                    .cloned()
            };
            let sv = match current {
                Some(sv) => sv,
                None => match self.stale.lock().get(&(seqno, key)).cloned() {
                    Some(sv) => sv,
                    None => continue,
                },
            };
            visited += 1;
            if !visitor(&sv) {
                break;
            }
        }
        Ok(visited)
    }
}
