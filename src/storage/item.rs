//! Items and Value Blobs
//!
//! An [`Item`] is a document as it travels in and out of the store: the
//! request a client mutation carries, the copy the flusher hands to the
//! persistence layer, and the result of a read. The hash table keeps its own
//! [`StoredValue`](super::StoredValue) per key and copies from and into items.
//!
//! A [`Blob`] is the value payload. It carries the value's age, used by the
//! defragmenter to decide when a long-lived value should be reallocated.

use crate::time::RelTime;
use bytes::Bytes;
use std::fmt;

/// Datatype bits describing a document's value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Datatype(u8);

impl Datatype {
    pub const RAW: Datatype = Datatype(0);
    pub const JSON: Datatype = Datatype(0x01);
    pub const SNAPPY: Datatype = Datatype(0x02);

    /// Number of distinct datatype combinations tracked by table statistics.
    pub const COUNT: usize = 4;

    pub fn from_bits(bits: u8) -> Self {
        Datatype(bits & 0x03)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_json(self) -> bool {
        self.0 & Self::JSON.0 != 0
    }

    pub fn is_compressed(self) -> bool {
        self.0 & Self::SNAPPY.0 != 0
    }

    /// Index into per-datatype counters.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::ops::BitOr for Datatype {
    type Output = Datatype;

    fn bitor(self, rhs: Datatype) -> Datatype {
        Datatype(self.0 | rhs.0)
    }
}

impl fmt::Debug for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_json(), self.is_compressed()) {
            (false, false) => write!(f, "raw"),
            (true, false) => write!(f, "json"),
            (false, true) => write!(f, "snappy"),
            (true, true) => write!(f, "json,snappy"),
        }
    }
}

/// A value payload plus its age.
///
/// Age is an 8-bit counter that saturates at `u8::MAX`. It starts at zero
/// and goes back to zero when the blob is reallocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    data: Bytes,
    age: u8,
}

impl Blob {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            age: 0,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn age(&self) -> u8 {
        self.age
    }

    /// Bumps the age by one, saturating at 255.
    pub fn increment_age(&mut self) {
        self.age = self.age.saturating_add(1);
    }

    /// Returns a copy backed by a fresh allocation, with age reset.
    pub fn reallocate(&self) -> Blob {
        Blob {
            data: Bytes::copy_from_slice(&self.data),
            age: 0,
        }
    }
}

/// A document travelling in or out of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Bytes,
    pub value: Blob,
    /// Opaque client flags
    pub flags: u32,
    /// Expiry time (0 = never)
    pub exptime: RelTime,
    /// On a request: the CAS the mutation expects (0 = any).
    /// On a result: the document's current CAS.
    pub cas: u64,
    pub rev_seqno: u64,
    pub by_seqno: u64,
    pub datatype: Datatype,
    /// NRU value the new slot starts with
    pub nru: u8,
    pub deleted: bool,
}

impl Item {
    pub fn new(key: impl Into<Bytes>, flags: u32, exptime: RelTime, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Blob::new(value),
            flags,
            exptime,
            cas: 0,
            rev_seqno: 0,
            by_seqno: 0,
            datatype: Datatype::RAW,
            nru: super::stored_value::INITIAL_NRU_VALUE,
            deleted: false,
        }
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_datatype(mut self, datatype: Datatype) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn with_nru(mut self, nru: u8) -> Self {
        self.nru = nru;
        self
    }

    pub fn is_expired(&self, now: RelTime) -> bool {
        self.exptime != 0 && self.exptime <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_age_saturates() {
        let mut blob = Blob::new("value");
        assert_eq!(blob.age(), 0);
        blob.increment_age();
        assert_eq!(blob.age(), 1);

        for _ in 0..300 {
            blob.increment_age();
        }
        assert_eq!(blob.age(), 0xff);
    }

    #[test]
    fn test_blob_reallocate_resets_age_and_keeps_bytes() {
        let mut blob = Blob::new("value");
        blob.increment_age();
        blob.increment_age();

        let fresh = blob.reallocate();
        assert_eq!(fresh.age(), 0);
        assert_eq!(fresh.data(), blob.data());
        assert_ne!(fresh.data().as_ptr(), blob.data().as_ptr());
    }

    #[test]
    fn test_datatype_bits() {
        let dt = Datatype::JSON | Datatype::SNAPPY;
        assert!(dt.is_json());
        assert!(dt.is_compressed());
        assert_eq!(dt.index(), 3);
        assert_eq!(Datatype::from_bits(0xff).bits(), 3);
        assert_eq!(format!("{:?}", Datatype::RAW), "raw");
    }

    #[test]
    fn test_item_expiry() {
        let item = Item::new("k", 0, 100, "v");
        assert!(!item.is_expired(99));
        assert!(item.is_expired(100));
        assert!(!Item::new("k", 0, 0, "v").is_expired(u32::MAX));
    }
}
