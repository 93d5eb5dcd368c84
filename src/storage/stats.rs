//! Engine-Wide Memory Statistics
//!
//! Every hash table charges the bytes of its slots to one shared [`EpStats`],
//! which also carries the memory quota checked before a slot is allocated or
//! grown.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Memory accounting shared by all hash tables of an engine.
#[derive(Debug, Default)]
pub struct EpStats {
    /// Bytes currently charged by all slots (metadata + resident values)
    current_size: AtomicUsize,
    /// Memory quota in bytes (0 = unlimited)
    max_data_size: AtomicUsize,
}

impl EpStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates stats with a memory quota.
    pub fn with_quota(max_data_size: usize) -> Self {
        Self {
            current_size: AtomicUsize::new(0),
            max_data_size: AtomicUsize::new(max_data_size),
        }
    }

    pub fn current_size(&self) -> usize {
        self.current_size.load(Ordering::Relaxed)
    }

    pub fn max_data_size(&self) -> usize {
        self.max_data_size.load(Ordering::Relaxed)
    }

    pub fn set_max_data_size(&self, bytes: usize) {
        self.max_data_size.store(bytes, Ordering::Relaxed);
    }

    /// True if `additional` more bytes fit under the quota.
    pub fn has_available_space(&self, additional: usize) -> bool {
        let quota = self.max_data_size();
        quota == 0 || self.current_size().saturating_add(additional) <= quota
    }

    pub(crate) fn add(&self, bytes: usize) {
        self.current_size.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn sub(&self, bytes: usize) {
        self.current_size.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Zeroes the byte count. The quota is kept.
    pub fn reset(&self) {
        self.current_size.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_quota_always_has_space() {
        let stats = EpStats::new();
        stats.add(1 << 40);
        assert!(stats.has_available_space(usize::MAX));
    }

    #[test]
    fn test_quota_enforced() {
        let stats = EpStats::with_quota(100);
        stats.add(90);
        assert!(stats.has_available_space(10));
        assert!(!stats.has_available_space(11));
        stats.sub(90);
        assert_eq!(stats.current_size(), 0);
    }

    #[test]
    fn test_reset_keeps_quota() {
        let stats = EpStats::with_quota(100);
        stats.add(90);
        stats.reset();
        assert_eq!(stats.current_size(), 0);
        assert_eq!(stats.max_data_size(), 100);

        stats.set_max_data_size(50);
        assert!(!stats.has_available_space(51));
    }
}
