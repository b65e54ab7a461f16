//! Engine-wide configuration (spec §6).
//!
//! Constructed once at [`crate::engine::StorageEngine::open`] and passed to
//! every subsystem by `Arc`; there is no global/default singleton (spec §9).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::txn::IsolationLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_dir: String,

    /// Frame count F; must be >= 16.
    pub buffer_pool_pages: usize,
    /// Young-region fraction in [0.1, 0.9].
    pub buffer_pool_young_ratio: f64,
    /// Delay before an old-region page is eligible for promotion.
    pub old_block_time_ms: u64,

    /// WAL segment size in bytes; must be >= 1 MiB.
    pub wal_segment_bytes: u64,
    /// Force fsync on every WAL append, not just on commit.
    pub wal_sync_after_write: bool,

    pub lock_wait_timeout_ms: u64,
    pub deadlock_check_interval_ms: u64,

    /// Periodic checkpoint cadence; must be >= 10.
    pub checkpoint_interval_seconds: u64,

    pub default_isolation_level: IsolationLevel,

    pub enable_doublewrite: bool,
    pub read_ahead_pages: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            buffer_pool_pages: 1024,
            buffer_pool_young_ratio: 0.625,
            old_block_time_ms: 1000,
            wal_segment_bytes: 16 * 1024 * 1024,
            wal_sync_after_write: false,
            lock_wait_timeout_ms: 5000,
            deadlock_check_interval_ms: 1000,
            checkpoint_interval_seconds: 300,
            default_isolation_level: IsolationLevel::RepeatableRead,
            enable_doublewrite: false,
            read_ahead_pages: 32,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_pool_pages < 16 {
            return Err(EngineError::Configuration(
                "buffer_pool_pages must be >= 16".into(),
            ));
        }
        if !(0.1..=0.9).contains(&self.buffer_pool_young_ratio) {
            return Err(EngineError::Configuration(
                "buffer_pool_young_ratio must be in [0.1, 0.9]".into(),
            ));
        }
        if self.wal_segment_bytes < 1024 * 1024 {
            return Err(EngineError::Configuration(
                "wal_segment_bytes must be >= 1 MiB".into(),
            ));
        }
        if self.checkpoint_interval_seconds < 10 {
            return Err(EngineError::Configuration(
                "checkpoint_interval_seconds must be >= 10".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn deadlock_check_interval(&self) -> Duration {
        Duration::from_millis(self.deadlock_check_interval_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_seconds)
    }
}
