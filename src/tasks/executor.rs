//! Executor Pool
//!
//! A fixed set of OS worker threads pulling tasks from one shared
//! [`TaskQueue`].
//!
//! ```text
//!   schedule ─┐                     ┌─> worker-0 ─┐
//!   wake ─────┼─> Mutex<TaskQueue> ─┼─> worker-1 ─┼─> run_supervised ─> requeue / drop
//!   cancel ───┘     + Condvar       └─> worker-N ─┘
//! ```
//!
//! Each run goes through [`run_supervised`], which catches panics so one
//! misbehaving task cannot take a worker thread down. A task that panicked
//! is retried after a backoff unless it has been cancelled.
//!
//! A task the executor drops without it retiring itself (cancelled, or still
//! queued when the pool shuts down) gets [`Task::abandoned`] exactly once.

use super::queue::TaskQueue;
use super::task::{ExTask, GlobalTask, Priority, Task};
use crate::config::ExecutorConfig;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Delay before a panicked task runs again.
pub const PANIC_BACKOFF: Duration = Duration::from_secs(1);

/// What a supervised run asks the executor to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Queue the task again at its wake time.
    Reschedule,
    /// The task retired itself; drop it.
    Complete,
    /// The task asked to run again but was cancelled meanwhile.
    Cancelled,
    /// `run` panicked with this message.
    Panicked(String),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs one slice of `task`, catching any panic.
///
/// A panic is logged and reported as [`RunOutcome::Panicked`]; it never
/// unwinds past this call.
pub fn run_supervised(task: &GlobalTask) -> RunOutcome {
    let start = Instant::now();
    let result = catch_unwind(AssertUnwindSafe(|| task.work.lock().run(task)));
    let elapsed = start.elapsed();

    if elapsed > task.max_expected_duration() {
        warn!(
            task = %task.description(),
            id = task.id(),
            elapsed_ms = elapsed.as_millis() as u64,
            "task ran longer than expected"
        );
    }

    match result {
        Ok(true) if !task.is_dead() => RunOutcome::Reschedule,
        Ok(true) => RunOutcome::Cancelled,
        Ok(false) => RunOutcome::Complete,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(
                task = %task.description(),
                id = task.id(),
                panic = %message,
                "task panicked"
            );
            RunOutcome::Panicked(message)
        }
    }
}

struct Shared {
    queue: Mutex<TaskQueue>,
    available: Condvar,
    shutdown: AtomicBool,
    next_task_id: AtomicU64,
    panic_backoff: Duration,
}

impl Shared {
    fn requeue(&self, task: ExTask) {
        if task.is_dead() || self.shutdown.load(Ordering::Acquire) {
            abandon(&task);
            return;
        }
        self.queue.lock().push(task);
        self.available.notify_one();
    }
}

/// Drops `task` without it having retired itself.
fn abandon(task: &GlobalTask) {
    task.cancel();
    debug!(task = %task.description(), id = task.id(), "task abandoned");
    let result = catch_unwind(AssertUnwindSafe(|| task.work.lock().abandoned(task)));
    if let Err(payload) = result {
        error!(
            task = %task.description(),
            id = task.id(),
            panic = %panic_message(payload.as_ref()),
            "abandon hook panicked"
        );
    }
}

/// A cloneable handle for scheduling into, waking and cancelling tasks of a
/// pool, without owning its threads.
#[derive(Clone)]
pub struct ExecutorHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("queued", &self.shared.queue.lock().len())
            .finish()
    }
}

impl ExecutorHandle {
    /// Wraps `work` in a new task that first runs after `delay`.
    pub fn schedule(&self, work: Box<dyn Task>, priority: Priority, delay: Duration) -> ExTask {
        let id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(GlobalTask::new(id, priority, work));
        task.snooze_for(delay);
        debug!(task = %task.description(), id, %priority, "task scheduled");
        self.shared.queue.lock().push(Arc::clone(&task));
        self.shared.available.notify_one();
        task
    }

    /// Makes `task` due now. A task that is running right now runs again as
    /// soon as it finishes, if it asks to be rescheduled.
    pub fn wake(&self, task: &ExTask) {
        task.set_waketime(Instant::now());
        let mut queue = self.shared.queue.lock();
        if queue.contains(task) {
            queue.push(Arc::clone(task));
            drop(queue);
            self.shared.available.notify_one();
        }
    }

    /// Marks `task` dead and lets the executor drop it promptly.
    pub fn cancel(&self, task: &ExTask) {
        task.cancel();
        self.wake(task);
    }

    /// Number of queued (not running) tasks.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

/// Worker threads plus their task queue.
pub struct ExecutorPool {
    handle: ExecutorHandle,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorPool")
            .field("workers", &self.workers.lock().len())
            .field("queued", &self.handle.queued())
            .finish()
    }
}

impl ExecutorPool {
    /// Starts `config.threads` workers.
    pub fn new(config: &ExecutorConfig) -> std::io::Result<Self> {
        Self::with_panic_backoff(config.threads, PANIC_BACKOFF)
    }

    /// Starts `threads` workers; panicked tasks are retried after `backoff`.
    pub fn with_panic_backoff(threads: usize, backoff: Duration) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(TaskQueue::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_task_id: AtomicU64::new(1),
            panic_backoff: backoff,
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("epstore-worker-{}", i))
                .spawn(move || worker_loop(shared))?;
            workers.push(handle);
        }
        info!(threads = workers.len(), "executor pool started");

        Ok(Self {
            handle: ExecutorHandle { shared },
            workers: Mutex::new(workers),
        })
    }

    pub fn handle(&self) -> ExecutorHandle {
        self.handle.clone()
    }

    pub fn schedule(&self, work: Box<dyn Task>, priority: Priority, delay: Duration) -> ExTask {
        self.handle.schedule(work, priority, delay)
    }

    pub fn wake(&self, task: &ExTask) {
        self.handle.wake(task);
    }

    pub fn cancel(&self, task: &ExTask) {
        self.handle.cancel(task);
    }

    /// Stops the workers after their current run and drops queued tasks.
    pub fn shutdown(&self) {
        let shared = &self.handle.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = shared.queue.lock().drain();
        shared.available.notify_all();
        for task in &dropped {
            abandon(task);
        }

        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                error!("executor worker thread panicked");
            }
        }
        info!(dropped_tasks = dropped.len(), "executor pool stopped");
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(task) = queue.pop_ready(Instant::now()) {
                    break task;
                }
                match queue.next_due() {
                    Some(due) => {
                        shared.available.wait_until(&mut queue, due);
                    }
                    None => shared.available.wait(&mut queue),
                }
            }
        };

        if task.is_dead() {
            trace!(task = %task.description(), id = task.id(), "dropping dead task");
            abandon(&task);
            continue;
        }

        match run_supervised(&task) {
            RunOutcome::Reschedule => shared.requeue(task),
            RunOutcome::Complete => {
                task.cancel();
                debug!(task = %task.description(), id = task.id(), "task complete");
            }
            RunOutcome::Cancelled => abandon(&task),
            RunOutcome::Panicked(_) => {
                task.snooze_for(shared.panic_backoff);
                shared.requeue(task);
            }
        }
    }
}
