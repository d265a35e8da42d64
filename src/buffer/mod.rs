//! Page Buffer Pool Module
//!
//! Caches fixed-size pages in memory, tracks pins and dirty state, and
//! writes pages back only after the WAL covers them.
//!
//! ## Responsibilities
//! - Pin/unpin pages, loading them from the page store on a miss
//! - LRU eviction of unpinned frames, flushing dirty victims first
//! - Write-ahead rule: a page reaches disk only once `durable_lsn >= page_lsn`
//! - Dirty page table (`rec_lsn`) for the checkpointer
//! - Bucket chains: values of any size spread over head and overflow pages
//!
//! ## Locking
//! ```text
//! pool mutex ──► frame RwLock        (never the other way round)
//! frame flush mutex ──► pool mutex
//! ```
//! Page guards from `PageHandle::read`/`write` must be dropped before calling
//! back into the pool.

mod bucket;
mod page;
mod pool;
mod replacer;
mod store;

use std::time::Duration;

pub use bucket::{
    cell_key, chain_len, read_value, BucketLayout, CellChange, ChainEditor, PageSource,
    MAX_CHAIN_PAGES,
};
pub use page::{Page, PAGE_HEADER_SIZE};
pub use pool::{BufferPool, PageHandle};
pub use replacer::{FrameId, LruReplacer, Replacer};
pub use store::PageStore;

use crate::config::Config;
use crate::error::Result;
use crate::lsn::{Lsn, PageId};

/// The WAL as seen by the buffer pool
pub trait WalDurability: Send + Sync {
    /// Highest LSN known to be on disk
    fn durable_lsn(&self) -> Lsn;

    /// Block until every record up to `lsn` is on disk
    fn flush_through(&self, lsn: Lsn) -> Result<()>;
}

/// Bounded retry with exponential backoff for page writes
#[derive(Debug, Clone, Copy)]
pub struct FlushRetry {
    pub attempts: u32,
    pub backoff: Duration,
}

impl FlushRetry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempts: config.flush_retry_attempts.max(1),
            backoff: Duration::from_millis(config.flush_retry_backoff_ms),
        }
    }
}

impl Default for FlushRetry {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Entry of the dirty page table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyPage {
    pub page_id: PageId,
    pub page_lsn: Lsn,
    /// No change older than this is missing from the page on disk
    pub rec_lsn: Lsn,
}

/// Buffer pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub frames: usize,
    pub resident: usize,
    pub pinned: usize,
    pub dirty: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub flushes: u64,
}
