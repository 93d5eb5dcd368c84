//! # epstore - An Eventually-Persistent Document Store
//!
//! The in-memory half of a key-value engine: documents live in a striped
//! hash table and are served from memory, while a background flusher writes
//! modified documents to a persistence layer in batched transactions.
//! Clients see their writes immediately; durability follows.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               EpStore                                   │
//! │                                                                         │
//! │  set / add / del / get / get_locked                                     │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ┌──────────────────────────────────────────────┐                       │
//! │  │                 HashTable                    │                       │
//! │  │  buckets 0..N, guarded by L stripe locks     │                       │
//! │  │  StoredValue: value, cas, seqno, dirty, nru  │                       │
//! │  └───────────────┬──────────────────────────────┘                       │
//! │                  │ clean -> dirty                                       │
//! │                  ▼                                                      │
//! │  ┌──────────────────────┐  swap   ┌──────────────┐  begin/set/del/     │
//! │  │      DirtyQueue      │───────> │ FlusherTask  │─────commit────> KVStore
//! │  └──────────────────────┘         └──────────────┘                      │
//! │                                                                         │
//! │  ExecutorPool: FlusherTask, ExpiryPagerTask, HashTableResizerTask,      │
//! │                DefragmenterTask                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use epstore::flusher::EpStore;
//! use epstore::persistence::{MemoryKVStore, Vbid};
//! use epstore::storage::Item;
//! use epstore::tasks::{schedule_maintenance, ExecutorPool};
//! use epstore::StoreConfig;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = StoreConfig::default();
//! let pool = ExecutorPool::new(&config.executor).unwrap();
//! let store = Arc::new(EpStore::new(config, Box::new(MemoryKVStore::new(Vbid(0)))));
//!
//! store.start_flusher(&pool.handle());
//! schedule_maintenance(&store, &pool.handle());
//!
//! store.set(&Item::new("user:1", 0, 0, r#"{"name":"ada"}"#));
//! let doc = store.get(b"user:1").unwrap();
//! assert_eq!(doc.value.data().as_ref(), br#"{"name":"ada"}"#);
//!
//! store.shutdown(Duration::from_secs(5));
//! pool.shutdown();
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: hash table, document slots, items and memory accounting
//! - [`flusher`]: the store, its dirty queue and the flusher task
//! - [`persistence`]: the persistence interface and an in-memory implementation
//! - [`tasks`]: task abstraction, executor pool and maintenance tasks
//! - [`config`], [`error`], [`time`]
//!
//! ## Design Highlights
//!
//! ### Striped Locking
//!
//! Bucket `b` is guarded by lock `b % L`, with `L` fixed for the table's
//! lifetime. Operations on different stripes never contend, and a resize
//! takes every stripe lock in ascending order.
//!
//! ### Write Coalescing
//!
//! A key is queued once per clean to dirty transition. However often it is
//! written between two flushes, the flusher writes it once, with whatever
//! state it has when the flusher gets to it.
//!
//! ### Failure Containment
//!
//! Persistence failures and panics never lose a write: the affected
//! documents stay dirty and are retried on the next cycle.

pub mod config;
pub mod error;
pub mod flusher;
pub mod persistence;
pub mod storage;
pub mod tasks;
pub mod time;

// Re-export commonly used types for convenience
pub use config::{ConfigError, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use flusher::{EpStore, FlushReport, FlusherState};
pub use persistence::{KVStore, MemoryKVStore, PersistenceError, Vbid};
pub use storage::{HashTable, Item, MutationStatus};
pub use tasks::ExecutorPool;

/// Version of epstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
