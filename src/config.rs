//! Configuration for TideKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TideError};

/// Main configuration for a TideKV instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── pages.db         (fixed-size page slots)
    ///     └── wal/             (segments named by starting LSN)
    pub data_dir: PathBuf,

    /// Size of every page in bytes (power of two, 4 KiB to 16 KiB)
    pub page_size: usize,

    /// Number of bucket pages keys are hashed across
    pub bucket_count: u64,

    // -------------------------------------------------------------------------
    // Buffer Pool Configuration
    // -------------------------------------------------------------------------
    /// Number of in-memory frames
    pub buffer_pool_frames: usize,

    /// Attempts for a page write before it is reported as a durability fault
    pub flush_retry_attempts: u32,

    /// Initial backoff between page write attempts (milliseconds, doubles)
    pub flush_retry_backoff_ms: u64,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Sync strategy: how concurrent flush requests are batched
    pub wal_sync_strategy: WalSyncStrategy,

    /// Segment size threshold before rollover (bytes)
    pub wal_segment_size: u64,

    // -------------------------------------------------------------------------
    // Background Task Configuration
    // -------------------------------------------------------------------------
    /// Run the checkpointer and GC on background threads
    pub background_tasks: bool,

    /// Time between checkpoints (milliseconds)
    pub checkpoint_interval_ms: u64,

    /// WAL volume that forces a checkpoint regardless of the interval (bytes)
    pub checkpoint_wal_bytes: u64,

    /// Time between GC sweeps (milliseconds)
    pub gc_interval_ms: u64,

    /// Per-subscriber buffer for commit notifications
    pub commit_notification_capacity: usize,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync as soon as a flush is requested (no batching window)
    EveryWrite,

    /// Coalesce concurrent flush requests into one write + fsync
    GroupCommit { max_batch: usize, max_wait_us: u64 },
}

impl WalSyncStrategy {
    pub(crate) fn batch_window(&self) -> (usize, Duration) {
        match *self {
            WalSyncStrategy::EveryWrite => (1, Duration::ZERO),
            WalSyncStrategy::GroupCommit {
                max_batch,
                max_wait_us,
            } => (max_batch.max(1), Duration::from_micros(max_wait_us)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./tidekv_data"),
            page_size: 8192,
            bucket_count: 256,
            buffer_pool_frames: 128,
            flush_retry_attempts: 3,
            flush_retry_backoff_ms: 5,
            wal_sync_strategy: WalSyncStrategy::GroupCommit {
                max_batch: 64,
                max_wait_us: 500,
            },
            wal_segment_size: 16 * 1024 * 1024, // 16 MB
            background_tasks: true,
            checkpoint_interval_ms: 30_000,
            checkpoint_wal_bytes: 8 * 1024 * 1024, // 8 MB
            gc_interval_ms: 1000,
            commit_notification_capacity: 1024,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings the storage layout cannot honour
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || !(4096..=16384).contains(&self.page_size) {
            return Err(TideError::Config(format!(
                "page_size must be a power of two between 4096 and 16384, got {}",
                self.page_size
            )));
        }
        if self.bucket_count == 0 {
            return Err(TideError::Config("bucket_count must be at least 1".into()));
        }
        if self.buffer_pool_frames < 2 {
            return Err(TideError::Config(
                "buffer_pool_frames must be at least 2".into(),
            ));
        }
        if self.wal_segment_size < 4096 {
            return Err(TideError::Config(
                "wal_segment_size must be at least 4096 bytes".into(),
            ));
        }
        if self.flush_retry_attempts == 0 {
            return Err(TideError::Config(
                "flush_retry_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub(crate) fn page_file(&self) -> PathBuf {
        self.data_dir.join("pages.db")
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the page size (in bytes)
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    /// Set the number of bucket pages
    pub fn bucket_count(mut self, count: u64) -> Self {
        self.config.bucket_count = count;
        self
    }

    /// Set the number of buffer pool frames
    pub fn buffer_pool_frames(mut self, frames: usize) -> Self {
        self.config.buffer_pool_frames = frames;
        self
    }

    /// Set the page write retry policy
    pub fn flush_retry(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.config.flush_retry_attempts = attempts;
        self.config.flush_retry_backoff_ms = backoff_ms;
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Set the WAL segment rollover threshold (in bytes)
    pub fn wal_segment_size(mut self, size: u64) -> Self {
        self.config.wal_segment_size = size;
        self
    }

    /// Enable or disable the background checkpointer and GC
    pub fn background_tasks(mut self, enabled: bool) -> Self {
        self.config.background_tasks = enabled;
        self
    }

    /// Set the checkpoint interval (in milliseconds)
    pub fn checkpoint_interval_ms(mut self, ms: u64) -> Self {
        self.config.checkpoint_interval_ms = ms;
        self
    }

    /// Set the WAL volume that triggers a checkpoint (in bytes)
    pub fn checkpoint_wal_bytes(mut self, bytes: u64) -> Self {
        self.config.checkpoint_wal_bytes = bytes;
        self
    }

    /// Set the GC sweep interval (in milliseconds)
    pub fn gc_interval_ms(mut self, ms: u64) -> Self {
        self.config.gc_interval_ms = ms;
        self
    }

    /// Set the per-subscriber commit notification buffer
    pub fn commit_notification_capacity(mut self, capacity: usize) -> Self {
        self.config.commit_notification_capacity = capacity;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
