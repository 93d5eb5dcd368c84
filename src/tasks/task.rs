//! Tasks
//!
//! A [`Task`] is a unit of background work. The executor wraps it in a
//! [`GlobalTask`], which adds what scheduling needs: an id, a priority, a
//! due date (wake time) and a `Running` / `Dead` state. Handles are shared
//! as [`ExTask`] (`Arc<GlobalTask>`) because the executor may be running a
//! task while some other owner holds a handle to cancel or wake it.
//!
//! ## Lifecycle
//!
//! ```text
//!   schedule ──> queued ──(due)──> running ──run() == true──> queued
//!                  ▲                  │
//!                  └─── wake/snooze   └─run() == false or Dead──> dropped
//! ```
//!
//! Cancellation is cooperative: `cancel` marks the task dead and an in-flight
//! `run` finishes normally. Long runs should check [`GlobalTask::is_dead`].
//! A task dropped without retiring itself gets [`Task::abandoned`], so work
//! that owns outside state (the flusher) can hand it back.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Background work run by the executor.
pub trait Task: Send {
    /// Does one slice of work. Returning `true` asks to be run again at the
    /// task's wake time (see [`GlobalTask::snooze`]); `false` retires it.
    fn run(&mut self, ctx: &GlobalTask) -> bool;

    /// Human-readable description used in logs.
    fn description(&self) -> String;

    /// Runs longer than this are logged as slow.
    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Called once if the executor drops the task before it retired itself:
    /// it was cancelled, or its pool shut down with the task still queued.
    fn abandoned(&mut self, _ctx: &GlobalTask) {}
}

/// Scheduling class. Higher `value` runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Priority {
    pub name: &'static str,
    pub value: u8,
}

impl Priority {
    pub const FLUSHER: Priority = Priority {
        name: "flusher",
        value: 6,
    };
    pub const EXPIRY_PAGER: Priority = Priority {
        name: "expiry_pager",
        value: 4,
    };
    pub const HT_RESIZER: Priority = Priority {
        name: "ht_resizer",
        value: 3,
    };
    pub const DEFRAGMENTER: Priority = Priority {
        name: "defragmenter",
        value: 2,
    };
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.value)
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running = 0,
    Dead = 1,
}

/// Shared handle to a scheduled task.
pub type ExTask = Arc<GlobalTask>;

/// A task plus its scheduling state.
pub struct GlobalTask {
    id: u64,
    priority: Priority,
    state: AtomicU8,
    waketime: Mutex<Instant>,
    description: String,
    max_expected_duration: Duration,
    pub(crate) work: Mutex<Box<dyn Task>>,
}

impl GlobalTask {
    /// Wraps `work`. The task is due immediately.
    ///
    /// Ids must increase across tasks that share a queue; the executor hands
    /// them out from its own counter.
    pub fn new(id: u64, priority: Priority, work: Box<dyn Task>) -> Self {
        Self {
            id,
            priority,
            state: AtomicU8::new(TaskState::Running as u8),
            waketime: Mutex::new(Instant::now()),
            description: work.description(),
            max_expected_duration: work.max_expected_duration(),
            work: Mutex::new(work),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn max_expected_duration(&self) -> Duration {
        self.max_expected_duration
    }

    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            0 => TaskState::Running,
            _ => TaskState::Dead,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.state() == TaskState::Dead
    }

    /// Marks the task dead. It is dropped the next time the executor sees it.
    pub fn cancel(&self) {
        self.state.store(TaskState::Dead as u8, Ordering::Release);
    }

    pub fn waketime(&self) -> Instant {
        *self.waketime.lock()
    }

    pub fn set_waketime(&self, when: Instant) {
        *self.waketime.lock() = when;
    }

    /// Sets the due date `secs` seconds from now. Negative or non-finite
    /// values make the task due immediately.
    pub fn snooze(&self, secs: f64) {
        let delay = if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        };
        self.snooze_for(delay);
    }

    pub fn snooze_for(&self, delay: Duration) {
        self.set_waketime(Instant::now() + delay);
    }
}

impl fmt::Debug for GlobalTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalTask")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .field("description", &self.description)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Counts runs; retires itself after `limit` runs.
    pub(crate) struct CountingTask {
        pub runs: Arc<std::sync::atomic::AtomicUsize>,
        pub limit: usize,
    }

    impl Task for CountingTask {
        fn run(&mut self, _ctx: &GlobalTask) -> bool {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            n < self.limit
        }

        fn description(&self) -> String {
            "counting task".into()
        }
    }

    pub(crate) fn counting(limit: usize) -> (Box<dyn Task>, Arc<std::sync::atomic::AtomicUsize>) {
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        (
            Box::new(CountingTask {
                runs: Arc::clone(&runs),
                limit,
            }),
            runs,
        )
    }

    #[test]
    fn test_new_task_is_running_and_due() {
        let (work, _) = counting(1);
        let task = GlobalTask::new(1, Priority::FLUSHER, work);
        assert_eq!(task.state(), TaskState::Running);
        assert!(task.waketime() <= Instant::now());
        assert_eq!(task.description(), "counting task");
    }

    #[test]
    fn test_cancel_marks_dead() {
        let (work, _) = counting(1);
        let task = GlobalTask::new(1, Priority::FLUSHER, work);
        task.cancel();
        assert!(task.is_dead());
    }

    #[test]
    fn test_snooze_moves_due_date() {
        let (work, _) = counting(1);
        let task = GlobalTask::new(1, Priority::FLUSHER, work);
        let before = Instant::now();
        task.snooze(5.0);
        assert!(task.waketime() >= before + Duration::from_secs(5));

        task.snooze(-1.0);
        assert!(task.waketime() <= Instant::now());
        task.snooze(f64::NAN);
        assert!(task.waketime() <= Instant::now());
    }

    #[test]
    fn test_run_through_work_lock() {
        let (work, runs) = counting(2);
        let task = GlobalTask::new(1, Priority::FLUSHER, work);
        assert!(task.work.lock().run(&task));
        assert!(!task.work.lock().run(&task));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
