//! # Flusher Module
//!
//! The write-back half of the store: client mutations mark documents dirty
//! in memory and queue their keys; a background task drains the queue to
//! the persistence layer in transactions.
//!
//! ```text
//!   client ──set/del──> EpStore ──> HashTable
//!                          │
//!                          └──> DirtyQueue ──swap──> FlusherTask ──> KVStore
//! ```
//!
//! - [`DirtyQueue`]: keys awaiting flush, in dirtying order
//! - [`EpStore`]: table, queue and flush pipeline for one shard
//! - [`FlusherTask`]: the executor task running flush cycles

pub mod queue;
pub mod store;
pub mod task;

pub use queue::DirtyQueue;
pub use store::{
    EpStore, FlushReport, FlushStats, FlusherState, StoreStats, DEFAULT_LOCK_TIMEOUT,
    MAX_LOCK_TIMEOUT,
};
pub use task::FlusherTask;
