//! Storage Module
//!
//! The in-memory side of a shard: document slots and the hash table that
//! owns them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        HashTable                            │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐        │
//! │  │ Lock 0   │ │ Lock 1   │ │ Lock 2   │ │ ...      │        │
//! │  │ buckets  │ │ buckets  │ │ buckets  │ │          │        │
//! │  │ 0,L,2L.. │ │ 1,L+1,...│ │ 2,L+2,...│ │          │        │
//! │  └──────────┘ └──────────┘ └──────────┘ └──────────┘        │
//! │        │ chains of StoredValue (live, tombstone, temp)      │
//! └────────┼────────────────────────────────────────────────────┘
//!          ▼
//!     EpStats (bytes charged against the memory quota)
//! ```
//!
//! ## Example
//!
//! ```
//! use epstore::storage::{EpStats, HashTable, Item, MutationStatus, TrackReference, WantsDeleted};
//! use std::sync::Arc;
//!
//! let table = HashTable::new(Arc::new(EpStats::new()), false, 47, 47);
//! assert_eq!(table.set(&Item::new("name", 0, 0, "Ariz")), MutationStatus::WasClean);
//!
//! let found = table.find(b"name", TrackReference::Yes, WantsDeleted::No).unwrap();
//! assert_eq!(found.value().unwrap().data().as_ref(), b"Ariz");
//! assert!(found.is_dirty());
//! ```

pub mod hash_table;
pub mod item;
pub mod stats;
pub mod stored_value;

pub use hash_table::{
    AddStatus, EvictionPolicy, FoundValue, HashBucketLock, HashTable, HashTableDepthStatVisitor,
    HashTableDepthVisitor, HashTableError, HashTableStats, HashTableVisitor, LockedSlot,
    MutationStatus, Position, TrackReference, WantsDeleted, MAX_HT_SIZE,
};
pub use item::{Blob, Datatype, Item};
pub use stats::EpStats;
pub use stored_value::{SlotKind, StoredValue, INITIAL_NRU_VALUE, MAX_NRU_VALUE, MIN_NRU_VALUE};
