//! Maintenance Tasks
//!
//! Periodic background work on a store's hash table, each one a [`Task`] run
//! by the executor:
//!
//! - [`ExpiryPagerTask`]: deletes expired documents nobody reads
//! - [`HashTableResizerTask`]: keeps the bucket count matched to the item count
//! - [`DefragmenterTask`]: moves long-lived values into fresh allocations
//!
//! Lazy expiry on `get` only catches documents that are read again. The pager
//! sweeps the rest, adapting its interval to how much it finds: a sweep where
//! many of the visited documents had expired halves the interval, a sweep
//! that found nothing doubles it.
//!
//! All three hold the store weakly and retire once it is dropped or its table
//! is deactivated.

use super::executor::ExecutorHandle;
use super::task::{ExTask, GlobalTask, Priority, Task};
use crate::config::{DefragmenterConfig, ExpiryPagerConfig};
use crate::flusher::EpStore;
use crate::storage::{HashTable, HashTableVisitor, LockedSlot, MutationStatus, Position};
use crate::time::RelTime;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// Schedules the maintenance tasks enabled in the store's configuration.
pub fn schedule_maintenance(store: &Arc<EpStore>, executor: &ExecutorHandle) -> Vec<ExTask> {
    let config = store.config();
    let mut tasks = Vec::new();

    if config.expiry_pager.enabled {
        let pager = ExpiryPagerTask::new(Arc::downgrade(store), config.expiry_pager.clone());
        let first_run = pager.interval();
        tasks.push(executor.schedule(Box::new(pager), Priority::EXPIRY_PAGER, first_run));
    }
    if config.resizer.enabled {
        let interval = Duration::from_secs_f64(config.resizer.interval_secs);
        tasks.push(executor.schedule(
            Box::new(HashTableResizerTask::new(Arc::downgrade(store), interval)),
            Priority::HT_RESIZER,
            interval,
        ));
    }
    if config.defragmenter.enabled {
        let interval = Duration::from_secs_f64(config.defragmenter.interval_secs);
        tasks.push(executor.schedule(
            Box::new(DefragmenterTask::new(
                Arc::downgrade(store),
                config.defragmenter.clone(),
            )),
            Priority::DEFRAGMENTER,
            interval,
        ));
    }
    tasks
}

fn live_store(store: &Weak<EpStore>) -> Option<Arc<EpStore>> {
    store.upgrade().filter(|store| store.table().is_active())
}

// ============================================================================
// Expiry Pager
// ============================================================================

/// Soft-deletes expired documents and queues them for the flusher.
struct ExpiredItemVisitor<'t> {
    table: &'t HashTable,
    now: RelTime,
    visited: usize,
    expired: Vec<Bytes>,
    deleted: usize,
}

impl HashTableVisitor for ExpiredItemVisitor<'_> {
    fn visit(&mut self, slot: &mut LockedSlot<'_, '_>) -> bool {
        let sv = slot.value();
        if sv.is_deleted() {
            return true;
        }
        self.visited += 1;
        if !sv.is_expired(self.now) {
            return true;
        }

        let key = slot.key();
        match self.table.unlocked_soft_delete(slot.lock(), &key, false) {
            MutationStatus::WasClean => {
                self.deleted += 1;
                self.expired.push(key);
            }
            MutationStatus::WasDirty => self.deleted += 1,
            _ => {}
        }
        true
    }
}

pub struct ExpiryPagerTask {
    store: Weak<EpStore>,
    config: ExpiryPagerConfig,
    interval: Duration,
}

impl ExpiryPagerTask {
    pub fn new(store: Weak<EpStore>, config: ExpiryPagerConfig) -> Self {
        let interval = Duration::from_secs_f64(config.base_interval_secs);
        Self {
            store,
            config,
            interval,
        }
    }

    /// Current sweep interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn adapt_interval(&mut self, visited: usize, expired: usize) {
        if visited == 0 {
            return;
        }
        let min = Duration::from_secs_f64(self.config.min_interval_secs);
        let max = Duration::from_secs_f64(self.config.max_interval_secs);
        let expiry_rate = expired as f64 / visited as f64;

        if expiry_rate > self.config.speedup_threshold {
            self.interval = (self.interval / 2).max(min);
            debug!(
                expired,
                rate = %format!("{:.2}%", expiry_rate * 100.0),
                new_interval_ms = self.interval.as_millis() as u64,
                "high expiry rate, speeding up pager"
            );
        } else if expiry_rate < self.config.slowdown_threshold && expired == 0 {
            self.interval = (self.interval * 2).min(max);
            trace!(
                new_interval_ms = self.interval.as_millis() as u64,
                "low expiry rate, slowing down pager"
            );
        }
    }
}

impl Task for ExpiryPagerTask {
    fn run(&mut self, ctx: &GlobalTask) -> bool {
        let Some(store) = live_store(&self.store) else {
            return false;
        };

        let table = store.table();
        let mut visitor = ExpiredItemVisitor {
            table,
            now: table.now(),
            visited: 0,
            expired: Vec::new(),
            deleted: 0,
        };
        table.visit(&mut visitor);

        let ExpiredItemVisitor {
            visited,
            expired,
            deleted,
            ..
        } = visitor;
        if deleted > 0 {
            debug!(vbid = %store.vbid(), deleted, visited, "expired documents deleted");
        }
        store.queue_dirty_many(expired);

        self.adapt_interval(visited, deleted);
        ctx.snooze_for(self.interval);
        true
    }

    fn description(&self) -> String {
        "Paging expired items".to_string()
    }

    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(5)
    }
}

// ============================================================================
// Hash Table Resizer
// ============================================================================

pub struct HashTableResizerTask {
    store: Weak<EpStore>,
    interval: Duration,
}

impl HashTableResizerTask {
    pub fn new(store: Weak<EpStore>, interval: Duration) -> Self {
        Self { store, interval }
    }
}

impl Task for HashTableResizerTask {
    fn run(&mut self, ctx: &GlobalTask) -> bool {
        let Some(store) = live_store(&self.store) else {
            return false;
        };

        let table = store.table();
        let before = table.size();
        if table.resize(0) {
            debug!(
                vbid = %store.vbid(),
                from = before,
                to = table.size(),
                items = table.num_items(),
                "hash table resized"
            );
        }
        ctx.snooze_for(self.interval);
        true
    }

    fn description(&self) -> String {
        "Adjusting hash table sizes".to_string()
    }
}

// ============================================================================
// Defragmenter
// ============================================================================

/// Ages resident values and reallocates the old ones, pausing every
/// `chunk_size` slots.
struct DefragVisitor {
    age_threshold: u8,
    chunk_size: usize,
    visited: usize,
    moved: usize,
}

impl HashTableVisitor for DefragVisitor {
    fn visit(&mut self, slot: &mut LockedSlot<'_, '_>) -> bool {
        let sv = slot.value_mut();
        sv.increment_age();
        if sv.value().is_some_and(|blob| blob.age() > self.age_threshold) {
            sv.reallocate();
            self.moved += 1;
        }
        self.visited += 1;
        self.visited < self.chunk_size
    }
}

pub struct DefragmenterTask {
    store: Weak<EpStore>,
    config: DefragmenterConfig,
    position: Position,
}

impl DefragmenterTask {
    pub fn new(store: Weak<EpStore>, config: DefragmenterConfig) -> Self {
        Self {
            store,
            config,
            position: Position::default(),
        }
    }

    /// Where the next run resumes.
    pub fn position(&self) -> Position {
        self.position
    }
}

impl Task for DefragmenterTask {
    fn run(&mut self, ctx: &GlobalTask) -> bool {
        let Some(store) = live_store(&self.store) else {
            return false;
        };

        let table = store.table();
        let mut visitor = DefragVisitor {
            age_threshold: self.config.age_threshold,
            chunk_size: self.config.chunk_size,
            visited: 0,
            moved: 0,
        };
        let position = table.pause_resume_visit(&mut visitor, &self.position);
        trace!(
            vbid = %store.vbid(),
            visited = visitor.visited,
            moved = visitor.moved,
            ?position,
            "defragmenter chunk done"
        );

        if table.is_end(&position) {
            self.position = Position::default();
            ctx.snooze_for(Duration::from_secs_f64(self.config.interval_secs));
        } else {
            // More to do; yield to other tasks and continue.
            self.position = position;
            ctx.snooze_for(Duration::ZERO);
        }
        true
    }

    fn description(&self) -> String {
        "Memory defragmenter".to_string()
    }
}
