//! Relative Time
//!
//! Expiry times, lock expiries and deletion times are stored as `RelTime`:
//! whole seconds since the clock was created. Keeping them as `u32` keeps the
//! document slot small.
//!
//! Flush statistics (dirty age, commit time) do not use this clock; they are
//! measured with `std::time::Instant` directly.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Seconds since the owning clock's epoch.
pub type RelTime = u32;

/// A source of `RelTime`.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current relative time.
    fn now(&self) -> RelTime;
}

/// Monotonic clock backed by `Instant`.
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Convenience constructor for the shared form every table takes.
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> RelTime {
        let secs = self.epoch.elapsed().as_secs();
        RelTime::try_from(secs).unwrap_or(RelTime::MAX)
    }
}

/// A clock that only moves when told to.
///
/// Used to time-travel in tests (expiry, lock timeouts, deletion times).
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    pub fn new(start: RelTime) -> Self {
        Self {
            now: AtomicU32::new(start),
        }
    }

    /// Moves the clock forward by `secs`.
    pub fn advance(&self, secs: RelTime) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jumps the clock to `time`.
    pub fn set(&self, time: RelTime) {
        self.now.store(time, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> RelTime {
        self.now.load(Ordering::SeqCst)
    }
}
