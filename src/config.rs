//! Store Configuration
//!
//! All tunables for a shard's store, its flusher and the maintenance tasks.
//! Every field has a default, so a TOML file only needs to name what it
//! changes:
//!
//! ```toml
//! ht_size = 3079
//! txn_size = 500
//!
//! [expiry_pager]
//! base_interval_secs = 10
//! ```

use crate::storage::EvictionPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default number of hash buckets.
pub const DEFAULT_HT_SIZE: usize = 47;

/// Default number of bucket locks.
pub const DEFAULT_HT_LOCKS: usize = 47;

/// Default number of writes per persistence transaction.
pub const DEFAULT_TXN_SIZE: usize = 250;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for [`StoreConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Configuration for one shard's store.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Initial number of hash buckets
    pub ht_size: usize,
    /// Number of bucket locks (fixed for the table's lifetime)
    pub ht_locks: usize,
    /// Use the ordered slot variant (copy-on-write replace, chronological visits)
    pub ordered: bool,
    /// What ejection releases
    pub eviction_policy: EvictionPolicy,
    /// Memory quota in bytes (0 = unlimited)
    pub max_data_size: usize,
    /// Maximum number of writes per persistence transaction
    pub txn_size: usize,
    /// Longest time an idle flusher waits for work before re-checking state
    pub flusher_wait_ms: u64,
    /// Snooze after a flush cycle that hit persistence failures
    pub flusher_retry_backoff_ms: u64,
    /// Shard id passed to the persistence layer
    pub vbucket: u16,
    pub executor: ExecutorConfig,
    pub expiry_pager: ExpiryPagerConfig,
    pub resizer: ResizerConfig,
    pub defragmenter: DefragmenterConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ht_size: DEFAULT_HT_SIZE,
            ht_locks: DEFAULT_HT_LOCKS,
            ordered: false,
            eviction_policy: EvictionPolicy::ValueOnly,
            max_data_size: 0,
            txn_size: DEFAULT_TXN_SIZE,
            flusher_wait_ms: 1000,
            flusher_retry_backoff_ms: 1000,
            vbucket: 0,
            executor: ExecutorConfig::default(),
            expiry_pager: ExpiryPagerConfig::default(),
            resizer: ResizerConfig::default(),
            defragmenter: DefragmenterConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Parses a TOML document and validates it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ht_size == 0 {
            return Err(ConfigError::Invalid("ht_size must be at least 1".into()));
        }
        if self.ht_locks == 0 {
            return Err(ConfigError::Invalid("ht_locks must be at least 1".into()));
        }
        if self.txn_size == 0 {
            return Err(ConfigError::Invalid("txn_size must be at least 1".into()));
        }
        if self.executor.threads == 0 {
            return Err(ConfigError::Invalid(
                "executor.threads must be at least 1".into(),
            ));
        }
        self.expiry_pager.validate()?;
        if self.defragmenter.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "defragmenter.chunk_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn flusher_wait(&self) -> Duration {
        Duration::from_millis(self.flusher_wait_ms)
    }

    pub fn flusher_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.flusher_retry_backoff_ms)
    }
}

/// Executor pool sizing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Number of worker threads
    pub threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { threads: 4 }
    }
}

/// Configuration for the expiry pager.
///
/// The pager adapts its interval to how much it finds: a sweep where a large
/// share of the visited items had expired halves the interval, a sweep that
/// found nothing doubles it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExpiryPagerConfig {
    pub enabled: bool,
    /// Interval between sweeps when the pager starts
    pub base_interval_secs: f64,
    /// Lower bound for the adaptive interval
    pub min_interval_secs: f64,
    /// Upper bound for the adaptive interval
    pub max_interval_secs: f64,
    /// If this fraction of visited items had expired, speed up
    pub speedup_threshold: f64,
    /// If less than this fraction had expired, slow down
    pub slowdown_threshold: f64,
}

impl Default for ExpiryPagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_interval_secs: 60.0,
            min_interval_secs: 1.0,
            max_interval_secs: 3600.0,
            speedup_threshold: 0.25,
            slowdown_threshold: 0.01,
        }
    }
}

impl ExpiryPagerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min_interval_secs > 0.0
            && self.min_interval_secs <= self.base_interval_secs
            && self.base_interval_secs <= self.max_interval_secs)
        {
            return Err(ConfigError::Invalid(
                "expiry_pager intervals must satisfy 0 < min <= base <= max".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the hash table resizer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResizerConfig {
    pub enabled: bool,
    pub interval_secs: f64,
}

impl Default for ResizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60.0,
        }
    }
}

/// Configuration for the defragmenter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefragmenterConfig {
    pub enabled: bool,
    pub interval_secs: f64,
    /// Values whose age exceeds this are reallocated
    pub age_threshold: u8,
    /// Items visited per run before pausing
    pub chunk_size: usize,
}

impl Default for DefragmenterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10.0,
            age_threshold: 10,
            chunk_size: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.txn_size, DEFAULT_TXN_SIZE);
        assert_eq!(config.flusher_wait(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = StoreConfig::from_toml_str(
            r#"
            ht_size = 3079
            eviction_policy = "full_eviction"

            [expiry_pager]
            base_interval_secs = 10.0
            "#,
        )
        .unwrap();

        assert_eq!(config.ht_size, 3079);
        assert_eq!(config.ht_locks, DEFAULT_HT_LOCKS);
        assert_eq!(config.eviction_policy, EvictionPolicy::FullEviction);
        assert_eq!(config.expiry_pager.base_interval_secs, 10.0);
        assert_eq!(config.expiry_pager.max_interval_secs, 3600.0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = StoreConfig::from_toml_str("txn_size = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = StoreConfig::from_toml_str("ht_locks = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = StoreConfig::from_toml_str(
            "[expiry_pager]\nmin_interval_secs = 100.0\nbase_interval_secs = 10.0",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_field_is_parse_error() {
        let err = StoreConfig::from_toml_str("no_such_knob = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "txn_size = 17\nordered = true").unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.txn_size, 17);
        assert!(config.ordered);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = StoreConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
