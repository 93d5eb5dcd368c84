//! Flusher Task
//!
//! The background task that drives [`EpStore::flush`]. It holds the store
//! weakly so a dropped store retires the task instead of being kept alive
//! by it.
//!
//! The task never blocks a worker waiting for work. A cycle that finds the
//! queue empty snoozes for `wait`; the store wakes the task when a key lands
//! in an empty queue. The idle snooze is set before the queue is swapped, so
//! a wake that arrives during the cycle is kept.

use super::store::{EpStore, FlusherState};
use crate::persistence::Vbid;
use crate::tasks::{GlobalTask, Task};
use std::sync::Weak;
use std::time::Duration;
use tracing::{debug, warn};

pub struct FlusherTask {
    store: Weak<EpStore>,
    vbid: Vbid,
    wait: Duration,
    retry_backoff: Duration,
}

impl FlusherTask {
    pub fn new(store: Weak<EpStore>, vbid: Vbid, wait: Duration, retry_backoff: Duration) -> Self {
        Self {
            store,
            vbid,
            wait,
            retry_backoff,
        }
    }
}

impl Task for FlusherTask {
    fn run(&mut self, ctx: &GlobalTask) -> bool {
        let Some(store) = self.store.upgrade() else {
            debug!(vbid = %self.vbid, "store dropped, flusher exiting");
            return false;
        };

        match store.flusher_state() {
            FlusherState::Running => {
                ctx.snooze_for(self.wait);
                let report = store.flush(false);
                if report.failed > 0 {
                    ctx.snooze_for(self.retry_backoff);
                } else if !report.is_empty() {
                    ctx.snooze_for(Duration::ZERO);
                }
                true
            }
            FlusherState::ShuttingDown => {
                loop {
                    let report = store.flush(false);
                    if report.is_empty() || report.failed > 0 {
                        break;
                    }
                }
                let remaining = store.queue_size();
                if remaining > 0 {
                    warn!(vbid = %self.vbid, remaining, "flusher stopping with queued documents");
                }
                store.flusher_stopped();
                false
            }
            FlusherState::Stopped => false,
        }
    }

    fn description(&self) -> String {
        format!("Running a flusher loop: {}", self.vbid)
    }

    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn abandoned(&mut self, ctx: &GlobalTask) {
        if let Some(store) = self.store.upgrade() {
            store.flusher_abandoned(ctx.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::persistence::MemoryKVStore;
    use crate::storage::Item;
    use crate::tasks::Priority;
    use std::sync::Arc;

    fn ctx() -> GlobalTask {
        GlobalTask::new(
            1,
            Priority::FLUSHER,
            Box::new(FlusherTask::new(
                Weak::new(),
                Vbid(0),
                Duration::ZERO,
                Duration::ZERO,
            )),
        )
    }

    #[test]
    fn test_exits_when_store_dropped() {
        let mut task = FlusherTask::new(Weak::new(), Vbid(0), Duration::ZERO, Duration::ZERO);
        assert!(!task.run(&ctx()));
    }

    #[test]
    fn test_stopped_flusher_retires() {
        let store = Arc::new(EpStore::new(
            StoreConfig::default(),
            Box::new(MemoryKVStore::new(Vbid(0))),
        ));
        let mut task = FlusherTask::new(Arc::downgrade(&store), Vbid(0), Duration::ZERO, Duration::ZERO);
        assert!(!task.run(&ctx()));
    }

    #[test]
    fn test_idle_cycle_snoozes_and_busy_cycle_stays_due() {
        let kv = MemoryKVStore::new(Vbid(0));
        let store = Arc::new(EpStore::new(StoreConfig::default(), Box::new(kv.clone())));
        store.force_flusher_state(FlusherState::Running);

        let ctx = ctx();
        let wait = Duration::from_secs(30);
        let mut task = FlusherTask::new(Arc::downgrade(&store), Vbid(0), wait, Duration::ZERO);
        assert!(task.run(&ctx));
        assert!(ctx.waketime() > std::time::Instant::now() + Duration::from_secs(20));

        store.set(&Item::new("k1", 0, 0, "v1"));
        assert!(task.run(&ctx));
        assert!(ctx.waketime() <= std::time::Instant::now());
        assert_eq!(kv.len(), 1);
    }

    #[test]
    fn test_abandoned_ignores_other_flusher_tasks() {
        let store = Arc::new(EpStore::new(
            StoreConfig::default(),
            Box::new(MemoryKVStore::new(Vbid(0))),
        ));
        store.force_flusher_state(FlusherState::Running);

        // Not the task registered with the store.
        let mut task = FlusherTask::new(Arc::downgrade(&store), Vbid(0), Duration::ZERO, Duration::ZERO);
        task.abandoned(&ctx());
        assert_eq!(store.flusher_state(), FlusherState::Running);
    }

    #[test]
    fn test_failed_cycle_snoozes_for_backoff() {
        let kv = MemoryKVStore::new(Vbid(0));
        let store = Arc::new(EpStore::new(StoreConfig::default(), Box::new(kv.clone())));
        store.force_flusher_state(FlusherState::Running);

        store.set(&Item::new("k1", 0, 0, "v1"));
        kv.fail_next_commits(1);

        let ctx = ctx();
        let backoff = Duration::from_secs(30);
        let mut task = FlusherTask::new(Arc::downgrade(&store), Vbid(0), Duration::ZERO, backoff);
        assert!(task.run(&ctx));
        assert!(ctx.waketime() > std::time::Instant::now() + Duration::from_secs(20));
        assert_eq!(store.queue_size(), 1);

        assert!(store.stop_flusher());
        assert!(!task.run(&ctx));
        assert_eq!(store.flusher_state(), FlusherState::Stopped);
        assert_eq!(kv.len(), 1);
    }
}
