//! Tests for the Buffer Pool
//!
//! These tests verify:
//! - Pin counts and page bounds, overflow pages included
//! - LRU eviction of unpinned pages
//! - Dirty victims reach disk only after the WAL covers them
//! - A dirty victim that cannot be flushed gives way to the next candidate
//! - Pool exhaustion when every frame is pinned
//! - Dirty page table bookkeeping

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;
use tidekv::buffer::{BufferPool, FlushRetry, PageStore, WalDurability, MAX_CHAIN_PAGES};
use tidekv::{Lsn, PageId, Result, TideError};

// =============================================================================
// Helper Functions
// =============================================================================

/// WAL stand-in that records every flush request
#[derive(Default)]
struct RecordingWal {
    durable: AtomicU64,
    requests: Mutex<Vec<Lsn>>,
    stuck: AtomicBool,
}

impl WalDurability for RecordingWal {
    fn durable_lsn(&self) -> Lsn {
        Lsn(self.durable.load(Ordering::SeqCst))
    }

    fn flush_through(&self, lsn: Lsn) -> Result<()> {
        self.requests.lock().push(lsn);
        if !self.stuck.load(Ordering::SeqCst) {
            self.durable.fetch_max(lsn.0, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn setup(frames: usize) -> (TempDir, Arc<RecordingWal>, BufferPool) {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(PageStore::open(&temp.path().join("pages.db"), 4096, 16).unwrap());
    let wal = Arc::new(RecordingWal::default());
    let pool = BufferPool::new(store, frames, wal.clone(), FlushRetry::default());
    (temp, wal, pool)
}

fn write(pool: &BufferPool, page: u64, key: &[u8], value: &[u8], lsn: u64) {
    let mut handle = pool.pin(PageId(page)).unwrap();
    handle.write().apply(key, Some(value), Lsn(lsn)).unwrap();
    pool.unpin(handle, true);
}

fn touch(pool: &BufferPool, page: u64) {
    let handle = pool.pin(PageId(page)).unwrap();
    pool.unpin(handle, false);
}

// =============================================================================
// Pinning Tests
// =============================================================================

#[test]
fn test_pin_counts() {
    let (_temp, _wal, pool) = setup(4);

    let first = pool.pin(PageId(1)).unwrap();
    let second = pool.pin(PageId(1)).unwrap();
    assert_eq!(pool.pin_count(PageId(1)), Some(2));

    drop(first);
    assert_eq!(pool.pin_count(PageId(1)), Some(1));
    pool.unpin(second, false);
    assert_eq!(pool.pin_count(PageId(1)), Some(0));
    assert!(pool.is_resident(PageId(1)));

    let stats = pool.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.pinned, 0);
}

#[test]
fn test_pin_out_of_range() {
    let (_temp, _wal, pool) = setup(4);

    assert!(matches!(pool.pin(PageId(0)), Err(TideError::PageNotFound(PageId(0)))));
    let beyond = PageId(16 * MAX_CHAIN_PAGES + 1);
    assert!(matches!(pool.pin(beyond), Err(TideError::PageNotFound(_))));
    assert!(pool.pin(PageId(16)).is_ok());
    // Overflow pages sit past the heads at a stride of the bucket count
    assert!(pool.pin(pool.layout().page_at(PageId(16), 2)).unwrap().read().is_empty());
}

#[test]
fn test_pool_exhausted_when_all_pinned() {
    let (_temp, _wal, pool) = setup(2);

    let _a = pool.pin(PageId(1)).unwrap();
    let _b = pool.pin(PageId(2)).unwrap();
    assert!(matches!(pool.pin(PageId(3)), Err(TideError::PoolExhausted)));

    // Resident pages are still reachable
    assert!(pool.pin(PageId(1)).is_ok());
}

// =============================================================================
// Eviction Tests
// =============================================================================

#[test]
fn test_evicts_least_recently_used() {
    let (_temp, _wal, pool) = setup(2);

    touch(&pool, 1);
    touch(&pool, 2);
    touch(&pool, 1);
    touch(&pool, 3);

    assert!(pool.is_resident(PageId(1)));
    assert!(!pool.is_resident(PageId(2)));
    assert!(pool.is_resident(PageId(3)));
    assert_eq!(pool.stats().evictions, 1);
}

#[test]
fn test_dirty_victim_flushed_after_wal() {
    let (_temp, wal, pool) = setup(1);

    write(&pool, 1, b"apple", b"red", 7);
    touch(&pool, 2);

    assert_eq!(wal.requests.lock().as_slice(), &[Lsn(7)]);
    assert!(!pool.is_resident(PageId(1)));

    let page = pool.store().read_page(PageId(1)).unwrap();
    assert_eq!(page.get(b"apple"), Some(&b"red"[..]));
    assert_eq!(page.page_lsn(), Lsn(7));
}

#[test]
fn test_dirty_victim_not_written_ahead_of_wal() {
    let (_temp, wal, pool) = setup(1);
    wal.stuck.store(true, Ordering::SeqCst);

    write(&pool, 1, b"apple", b"red", 7);
    let err = pool.pin(PageId(2)).unwrap_err();
    assert!(matches!(err, TideError::DurabilityFault(_)));
    assert!(err.is_fatal());

    // Nothing reached the page file and the page stays dirty
    assert!(pool.store().read_page(PageId(1)).unwrap().is_empty());
    assert!(pool.is_resident(PageId(1)));
    assert_eq!(pool.dirty_pages().len(), 1);

    wal.stuck.store(false, Ordering::SeqCst);
    touch(&pool, 2);
    assert!(!pool.is_resident(PageId(1)));
}

#[test]
fn test_unflushable_victim_falls_through_to_clean_frame() {
    let (_temp, wal, pool) = setup(2);
    wal.stuck.store(true, Ordering::SeqCst);

    // Page 1 is the LRU choice but cannot be written ahead of the WAL
    write(&pool, 1, b"apple", b"red", 7);
    touch(&pool, 2);

    let handle = pool.pin(PageId(3)).unwrap();
    drop(handle);
    assert!(pool.is_resident(PageId(1)));
    assert!(!pool.is_resident(PageId(2)));
    assert!(pool.is_resident(PageId(3)));
    assert_eq!(pool.dirty_pages().len(), 1);
    assert!(pool.store().read_page(PageId(1)).unwrap().is_empty());
}

// =============================================================================
// Dirty Page Table Tests
// =============================================================================

#[test]
fn test_dirty_pages_track_rec_lsn() {
    let (_temp, _wal, pool) = setup(4);

    write(&pool, 1, b"a", b"1", 5);
    write(&pool, 2, b"b", b"2", 9);
    write(&pool, 1, b"c", b"3", 12);

    let dirty = pool.dirty_pages();
    assert_eq!(dirty.len(), 2);
    assert_eq!(dirty[0].page_id, PageId(1));
    assert_eq!(dirty[0].rec_lsn, Lsn(1));
    assert_eq!(dirty[0].page_lsn, Lsn(12));
    assert_eq!(dirty[1].page_id, PageId(2));
    assert_eq!(dirty[1].rec_lsn, Lsn(1));
    assert_eq!(pool.min_rec_lsn(), Some(Lsn(1)));
}

#[test]
fn test_mark_dirty_sets_rec_lsn() {
    let (_temp, _wal, pool) = setup(4);

    let mut handle = pool.pin(PageId(3)).unwrap();
    handle.write().apply(b"k", Some(b"v"), Lsn(20)).unwrap();
    handle.mark_dirty(Lsn(18));
    assert_eq!(pool.min_rec_lsn(), Some(Lsn(18)));
    drop(handle);

    assert_eq!(pool.dirty_pages()[0].rec_lsn, Lsn(18));
}

#[test]
fn test_flush_all_clears_dirty_table() {
    let (temp, wal, pool) = setup(4);

    write(&pool, 1, b"a", b"1", 3);
    write(&pool, 2, b"b", b"2", 4);
    assert_eq!(pool.flush_all().unwrap(), 2);
    pool.sync().unwrap();

    assert!(pool.dirty_pages().is_empty());
    assert_eq!(pool.min_rec_lsn(), None);
    assert_eq!(wal.durable_lsn(), Lsn(4));
    assert!(!pool.flush_page(PageId(1)).unwrap());
    drop(pool);

    let store = PageStore::open(&temp.path().join("pages.db"), 4096, 16).unwrap();
    assert!(!store.is_pristine());
    assert_eq!(store.read_page(PageId(2)).unwrap().get(b"b"), Some(&b"2"[..]));
}
