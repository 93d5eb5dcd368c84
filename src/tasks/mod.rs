//! # Tasks Module
//!
//! Background work for the store, run on a pool of worker threads.
//!
//! ```text
//!   schedule(Task, Priority, delay)
//!          │
//!          ▼
//!   ┌──────────────┐   pop most urgent    ┌────────────────┐
//!   │  TaskQueue   │ ───────────────────> │ worker threads │
//!   │ future/ready │ <─────────────────── │ run_supervised │
//!   └──────────────┘   reschedule if      └────────────────┘
//!                      run() == true
//! ```
//!
//! - [`Task`] / [`GlobalTask`]: the work and its scheduling state
//! - [`TaskQueue`]: due-date and priority ordering
//! - [`ExecutorPool`]: the workers; panics in a task are caught and the task
//!   is retried after a backoff
//! - [`maintenance`]: expiry pager, hash table resizer, defragmenter

pub mod executor;
pub mod maintenance;
pub mod queue;
pub mod task;

pub use executor::{run_supervised, ExecutorHandle, ExecutorPool, RunOutcome, PANIC_BACKOFF};
pub use maintenance::{
    schedule_maintenance, DefragmenterTask, ExpiryPagerTask, HashTableResizerTask,
};
pub use queue::TaskQueue;
pub use task::{ExTask, GlobalTask, Priority, Task, TaskState};
