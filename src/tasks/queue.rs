//! Task Queue
//!
//! Two heaps:
//!
//! ```text
//!   future  (earliest due date first)  ──due──>  ready  (priority, due, id)
//! ```
//!
//! Tasks wait in `future` until their wake time passes, then move to `ready`,
//! where the most urgent runs first: higher priority, then earlier due date,
//! then lower id.
//!
//! Waking a queued task re-inserts it with a new generation; the entry it
//! leaves behind is recognised as stale and skipped when it surfaces.

use super::task::ExTask;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

struct Entry {
    due: Instant,
    generation: u64,
    task: ExTask,
}

impl Entry {
    fn id(&self) -> u64 {
        self.task.id()
    }
}

/// Ordering for the future heap: earliest due date is the greatest.
struct ByDueDate(Entry);

impl PartialEq for ByDueDate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ByDueDate {}

impl PartialOrd for ByDueDate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByDueDate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .due
            .cmp(&self.0.due)
            .then_with(|| other.0.id().cmp(&self.0.id()))
    }
}

/// Ordering for the ready heap: the most urgent task is the greatest.
struct ByPriority(Entry);

impl PartialEq for ByPriority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ByPriority {}

impl PartialOrd for ByPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .task
            .priority()
            .value
            .cmp(&other.0.task.priority().value)
            .then_with(|| other.0.due.cmp(&self.0.due))
            .then_with(|| other.0.id().cmp(&self.0.id()))
    }
}

/// The scheduler's set of queued tasks.
#[derive(Default)]
pub struct TaskQueue {
    future: BinaryHeap<ByDueDate>,
    ready: BinaryHeap<ByPriority>,
    /// Current generation of every queued task, by id.
    queued: HashMap<u64, u64>,
    next_generation: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `task` to run at its wake time. A task that is already queued
    /// is moved to its new wake time.
    pub fn push(&mut self, task: ExTask) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.queued.insert(task.id(), generation);
        self.future.push(ByDueDate(Entry {
            due: task.waketime(),
            generation,
            task,
        }));
    }

    pub fn contains(&self, task: &ExTask) -> bool {
        self.queued.contains_key(&task.id())
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    fn is_current(&self, entry: &Entry) -> bool {
        self.queued.get(&entry.id()) == Some(&entry.generation)
    }

    /// Removes and returns the most urgent task due at `now`.
    pub fn pop_ready(&mut self, now: Instant) -> Option<ExTask> {
        while let Some(top) = self.future.peek() {
            if top.0.due > now {
                break;
            }
            if let Some(ByDueDate(entry)) = self.future.pop() {
                if self.is_current(&entry) {
                    self.ready.push(ByPriority(entry));
                }
            }
        }

        while let Some(ByPriority(entry)) = self.ready.pop() {
            if self.is_current(&entry) {
                self.queued.remove(&entry.id());
                return Some(entry.task);
            }
        }
        None
    }

    /// Earliest due date among waiting tasks, if any. May name an entry that
    /// turns out to be stale.
    pub fn next_due(&self) -> Option<Instant> {
        if !self.ready.is_empty() {
            return Some(Instant::now());
        }
        self.future.peek().map(|entry| entry.0.due)
    }

    /// Drops every queued task, returning them.
    pub fn drain(&mut self) -> Vec<ExTask> {
        let mut tasks: Vec<ExTask> = self
            .future
            .drain()
            .map(|e| e.0)
            .chain(self.ready.drain().map(|e| e.0))
            .filter(|entry| self.queued.get(&entry.id()) == Some(&entry.generation))
            .map(|entry| entry.task)
            .collect();
        self.queued.clear();
        tasks.sort_by_key(|task| task.id());
        tasks
    }
}
