//! Document Slots
//!
//! A [`StoredValue`] is the hash table's record for one key: the value
//! payload (which can be ejected while the metadata stays), the version
//! metadata, and the dirty / deleted / locked state.
//!
//! Slots come in two kinds, chosen once per table:
//!
//! - **Plain**: updated in place.
//! - **Ordered**: additionally records when it was deleted and whether it is
//!   a stale pre-image left behind by a copy-on-write replace. Ordered tables
//!   keep a chronological (by-seqno) index over their slots.
//!
//! Slots are owned by their bucket chain and are only reachable while that
//! bucket's lock is held.

use super::item::{Blob, Datatype, Item};
use crate::time::RelTime;
use bytes::Bytes;
use std::time::Instant;

/// Most recently used.
pub const MIN_NRU_VALUE: u8 = 0;
/// NRU value of a freshly stored item.
pub const INITIAL_NRU_VALUE: u8 = 2;
/// Least recently used (first to be evicted).
pub const MAX_NRU_VALUE: u8 = 3;

/// Fixed bytes charged per slot on top of the key and value lengths.
pub const SLOT_OVERHEAD: usize = 64;

/// Extra state carried by slots in an ordered table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedMeta {
    deleted_time: RelTime,
    stale: bool,
}

/// The two slot variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotKind {
    Plain,
    Ordered(OrderedMeta),
}

impl SlotKind {
    pub fn plain() -> Self {
        SlotKind::Plain
    }

    pub fn ordered() -> Self {
        SlotKind::Ordered(OrderedMeta::default())
    }
}

/// One in-memory document record.
#[derive(Debug, Clone)]
pub struct StoredValue {
    key: Bytes,
    value: Option<Blob>,
    cas: u64,
    rev_seqno: u64,
    by_seqno: u64,
    flags: u32,
    exptime: RelTime,
    datatype: Datatype,
    nru: u8,
    dirty: bool,
    deleted: bool,
    temp: bool,
    lock_expiry: RelTime,
    queued_at: Option<Instant>,
    dirtied_at: Option<Instant>,
    kind: SlotKind,
}

impl StoredValue {
    /// Builds a new dirty slot from an item.
    pub(crate) fn new(item: &Item, kind: SlotKind, cas: u64, by_seqno: u64) -> Self {
        let mut sv = Self {
            key: item.key.clone(),
            value: Some(item.value.clone()),
            cas,
            rev_seqno: item.rev_seqno.max(1),
            by_seqno,
            flags: item.flags,
            exptime: item.exptime,
            datatype: item.datatype,
            nru: item.nru.min(MAX_NRU_VALUE),
            dirty: false,
            deleted: false,
            temp: false,
            lock_expiry: 0,
            queued_at: None,
            dirtied_at: None,
            kind,
        };
        sv.mark_dirty();
        sv
    }

    /// Builds a clean placeholder that reserves a key while its document is
    /// fetched from the persistence layer.
    pub(crate) fn new_temp(key: Bytes, kind: SlotKind) -> Self {
        Self {
            key,
            value: None,
            cas: 0,
            rev_seqno: 0,
            by_seqno: 0,
            flags: 0,
            exptime: 0,
            datatype: Datatype::RAW,
            nru: MAX_NRU_VALUE,
            dirty: false,
            deleted: false,
            temp: true,
            lock_expiry: 0,
            queued_at: None,
            dirtied_at: None,
            kind,
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// The resident value, if any.
    pub fn value(&self) -> Option<&Blob> {
        self.value.as_ref()
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn rev_seqno(&self) -> u64 {
        self.rev_seqno
    }

    pub fn by_seqno(&self) -> u64 {
        self.by_seqno
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn exptime(&self) -> RelTime {
        self.exptime
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn nru(&self) -> u8 {
        self.nru
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_temp(&self) -> bool {
        self.temp
    }

    /// True if the value payload is in memory.
    pub fn is_resident(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self.kind, SlotKind::Ordered(_))
    }

    /// True for the pre-image of an ordered slot that was replaced by a copy.
    pub fn is_stale(&self) -> bool {
        matches!(&self.kind, SlotKind::Ordered(meta) if meta.stale)
    }

    /// When the slot was soft-deleted. Only ordered slots record it.
    pub fn deleted_time(&self) -> Option<RelTime> {
        match &self.kind {
            SlotKind::Ordered(meta) if self.deleted => Some(meta.deleted_time),
            _ => None,
        }
    }

    pub fn is_expired(&self, now: RelTime) -> bool {
        !self.deleted && self.exptime != 0 && self.exptime <= now
    }

    pub fn is_locked(&self, now: RelTime) -> bool {
        self.lock_expiry != 0 && now < self.lock_expiry
    }

    /// Locks the slot until `expiry`.
    pub fn lock(&mut self, expiry: RelTime) {
        self.lock_expiry = expiry;
    }

    pub fn unlock(&mut self) {
        self.lock_expiry = 0;
    }

    /// Records a modification. The queued time is only taken on a clean to
    /// dirty transition; the dirtied time on every call.
    pub fn mark_dirty(&mut self) {
        let now = Instant::now();
        if !self.dirty {
            self.queued_at = Some(now);
        }
        self.dirtied_at = Some(now);
        self.dirty = true;
    }

    /// Clears the dirty flag, returning when the slot was queued and when it
    /// was last modified. Returns `None` if the slot was already clean.
    pub fn mark_clean(&mut self) -> Option<(Instant, Instant)> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        let queued = self.queued_at.take()?;
        let dirtied = self.dirtied_at.take().unwrap_or(queued);
        Some((queued, dirtied))
    }

    /// Marks the slot as referenced: NRU moves one step toward most recently
    /// used.
    pub fn referenced(&mut self) {
        self.nru = self.nru.saturating_sub(1).max(MIN_NRU_VALUE);
    }

    /// Moves NRU one step toward least recently used.
    pub fn increment_nru(&mut self) {
        if self.nru < MAX_NRU_VALUE {
            self.nru += 1;
        }
    }

    /// Ages the resident value by one.
    pub fn increment_age(&mut self) {
        if let Some(blob) = self.value.as_mut() {
            blob.increment_age();
        }
    }

    /// Moves the value into a fresh allocation; its age restarts at zero.
    pub fn reallocate(&mut self) {
        if let Some(blob) = self.value.as_ref() {
            self.value = Some(blob.reallocate());
        }
    }

    /// Bytes of metadata charged for this slot.
    pub fn meta_data_size(&self) -> usize {
        SLOT_OVERHEAD + self.key.len()
    }

    /// Bytes of value payload resident in memory.
    pub fn value_size(&self) -> usize {
        self.value.as_ref().map_or(0, Blob::len)
    }

    /// Total bytes charged for this slot.
    pub fn size(&self) -> usize {
        self.meta_data_size() + self.value_size()
    }

    /// Copies the slot out as an item. Non-resident and deleted slots yield
    /// an empty value.
    pub fn to_item(&self) -> Item {
        Item {
            key: self.key.clone(),
            value: self.value.clone().unwrap_or_else(|| Blob::new(Bytes::new())),
            flags: self.flags,
            exptime: self.exptime,
            cas: self.cas,
            rev_seqno: self.rev_seqno,
            by_seqno: self.by_seqno,
            datatype: self.datatype,
            nru: self.nru,
            deleted: self.deleted,
        }
    }

    /// Stamps a new CAS without dirtying the slot (used when locking).
    pub(crate) fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    /// Overwrites value and metadata from `item` and marks the slot dirty.
    /// A tombstone becomes live again with lock state and deletion time
    /// cleared.
    pub(crate) fn set_value(&mut self, item: &Item, cas: u64, by_seqno: u64) {
        self.value = Some(item.value.clone());
        self.cas = cas;
        self.rev_seqno = if item.rev_seqno > self.rev_seqno {
            item.rev_seqno
        } else {
            self.rev_seqno + 1
        };
        self.by_seqno = by_seqno;
        self.flags = item.flags;
        self.exptime = item.exptime;
        self.datatype = item.datatype;
        self.deleted = false;
        self.temp = false;
        self.lock_expiry = 0;
        if let SlotKind::Ordered(meta) = &mut self.kind {
            meta.deleted_time = 0;
        }
        self.mark_dirty();
    }

    /// Turns the slot into a tombstone. Unless `only_mark_deleted`, the
    /// value payload is released.
    pub(crate) fn soft_delete(
        &mut self,
        only_mark_deleted: bool,
        now: RelTime,
        cas: u64,
        by_seqno: u64,
    ) {
        if !only_mark_deleted {
            self.value = None;
        }
        self.deleted = true;
        self.temp = false;
        self.cas = cas;
        self.rev_seqno += 1;
        self.by_seqno = by_seqno;
        self.exptime = 0;
        self.lock_expiry = 0;
        if let SlotKind::Ordered(meta) = &mut self.kind {
            meta.deleted_time = now;
        }
        self.mark_dirty();
    }

    /// Releases the value payload, keeping the metadata.
    pub(crate) fn eject_value(&mut self) -> Option<Blob> {
        self.value.take()
    }

    /// Puts a value payload back after an ejection.
    pub(crate) fn restore_value(&mut self, blob: Blob) {
        self.value = Some(blob);
    }

    /// Installs a fetched document into a temp placeholder. The slot stays
    /// clean: the persistence layer already has this state.
    pub(crate) fn fill_from_disk(&mut self, item: &Item) {
        self.value = Some(item.value.clone());
        self.cas = item.cas;
        self.rev_seqno = item.rev_seqno;
        self.by_seqno = item.by_seqno;
        self.flags = item.flags;
        self.exptime = item.exptime;
        self.datatype = item.datatype;
        self.nru = INITIAL_NRU_VALUE;
        self.temp = false;
        self.deleted = false;
    }

    pub(crate) fn mark_stale(&mut self) {
        if let SlotKind::Ordered(meta) = &mut self.kind {
            meta.stale = true;
        }
    }
}

/// Two slots are equal when they describe the same document state. Stale
/// marking and dirty timestamps are bookkeeping and do not take part.
impl PartialEq for StoredValue {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.value == other.value
            && self.cas == other.cas
            && self.rev_seqno == other.rev_seqno
            && self.by_seqno == other.by_seqno
            && self.flags == other.flags
            && self.exptime == other.exptime
            && self.datatype == other.datatype
            && self.nru == other.nru
            && self.dirty == other.dirty
            && self.deleted == other.deleted
            && self.temp == other.temp
            && self.lock_expiry == other.lock_expiry
    }
}

impl Eq for StoredValue {}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(kind: SlotKind) -> StoredValue {
        StoredValue::new(&Item::new("key", 0, 0, "value"), kind, 1, 1)
    }

    #[test]
    fn test_new_slot_is_dirty_and_resident() {
        let sv = slot(SlotKind::plain());
        assert!(sv.is_dirty());
        assert!(sv.is_resident());
        assert!(!sv.is_deleted());
        assert_eq!(sv.nru(), INITIAL_NRU_VALUE);
        assert_eq!(sv.size(), SLOT_OVERHEAD + 3 + 5);
    }

    #[test]
    fn test_mark_clean_reports_timestamps_once() {
        let mut sv = slot(SlotKind::plain());
        let (queued, dirtied) = sv.mark_clean().unwrap();
        assert!(queued <= dirtied);
        assert!(!sv.is_dirty());
        assert!(sv.mark_clean().is_none());
    }

    #[test]
    fn test_redirty_keeps_queued_time() {
        let mut sv = slot(SlotKind::plain());
        let first_queued = sv.queued_at;
        sv.set_value(&Item::new("key", 0, 0, "v2"), 2, 2);
        assert_eq!(sv.queued_at, first_queued);
        assert_eq!(sv.rev_seqno(), 2);
    }

    #[test]
    fn test_nru_reference_floors_at_minimum() {
        let mut sv = slot(SlotKind::plain());
        sv.referenced();
        assert_eq!(sv.nru(), INITIAL_NRU_VALUE - 1);
        for _ in 0..10 {
            sv.referenced();
        }
        assert_eq!(sv.nru(), MIN_NRU_VALUE);
        for _ in 0..10 {
            sv.increment_nru();
        }
        assert_eq!(sv.nru(), MAX_NRU_VALUE);
    }

    #[test]
    fn test_soft_delete_releases_value_and_records_time() {
        let mut sv = slot(SlotKind::ordered());
        sv.mark_clean();
        sv.soft_delete(false, 1985, 2, 2);
        assert!(sv.is_deleted());
        assert!(sv.is_dirty());
        assert!(!sv.is_resident());
        assert_eq!(sv.deleted_time(), Some(1985));

        let mut plain = slot(SlotKind::plain());
        plain.soft_delete(true, 1985, 2, 2);
        assert!(plain.is_resident());
        assert_eq!(plain.deleted_time(), None);
    }

    #[test]
    fn test_recreated_slot_is_not_locked_by_deletion_time() {
        let mut sv = slot(SlotKind::ordered());
        sv.lock(2000);
        assert!(sv.is_locked(1985));
        sv.soft_delete(false, 1985, 2, 2);
        sv.set_value(&Item::new("key", 0, 0, "again"), 3, 3);
        assert!(!sv.is_locked(1985));
        assert_eq!(sv.deleted_time(), None);
    }

    #[test]
    fn test_equality_ignores_stale_marking() {
        let sv = slot(SlotKind::ordered());
        let mut copy = sv.clone();
        copy.mark_stale();
        assert!(copy.is_stale());
        assert_eq!(sv, copy);
    }
}
