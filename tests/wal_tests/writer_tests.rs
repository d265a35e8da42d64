//! Tests for WAL Writer
//!
//! These tests verify:
//! - LSN assignment and durability tracking
//! - Group commit under concurrent flushers
//! - Segment rollover and purge
//! - Reopening an existing log

use std::path::Path;
use std::sync::Arc;
use std::thread;

use tidekv::config::WalSyncStrategy;
use tidekv::wal::{list_segments, segment_file_name, RecordKind, WalOptions, WalRecovery, WalWriter};
use tidekv::{Lsn, PageId, TxnId};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn options(segment_size: u64, sync_strategy: WalSyncStrategy) -> WalOptions {
    WalOptions {
        segment_size,
        sync_strategy,
    }
}

fn every_write() -> WalOptions {
    options(1024 * 1024, WalSyncStrategy::EveryWrite)
}

fn update(i: usize) -> RecordKind {
    RecordKind::Update {
        page_id: PageId(1),
        key: format!("key{}", i).into_bytes(),
        before: None,
        after: Some(vec![b'x'; 200]),
    }
}

fn write_updates(dir: &Path, opts: WalOptions, count: usize) -> Lsn {
    let wal = WalWriter::open(dir, opts, Lsn(1)).unwrap();
    let mut last = Lsn::ZERO;
    for i in 0..count {
        last = wal.append(TxnId(1), &update(i)).unwrap();
    }
    wal.flush_through(last).unwrap();
    last
}

// =============================================================================
// Basic Writing Tests
// =============================================================================

#[test]
fn test_lsns_are_sequential() {
    let temp = TempDir::new().unwrap();
    let wal = WalWriter::open(temp.path(), every_write(), Lsn(1)).unwrap();

    let lsns: Vec<_> = (0..100)
        .map(|i| wal.append(TxnId(1), &update(i)).unwrap())
        .collect();

    for (i, lsn) in lsns.iter().enumerate() {
        assert_eq!(*lsn, Lsn(i as u64 + 1));
    }
    assert_eq!(wal.last_lsn(), Lsn(100));
    assert_eq!(wal.next_lsn(), Lsn(101));
}

#[test]
fn test_append_is_not_durable_until_flushed() {
    let temp = TempDir::new().unwrap();
    let wal = WalWriter::open(temp.path(), every_write(), Lsn(1)).unwrap();

    let lsn = wal.append(TxnId(1), &RecordKind::Begin).unwrap();
    assert_eq!(wal.durable_lsn(), Lsn::ZERO);
    assert!(wal.bytes_appended() > 0);

    wal.flush_through(lsn).unwrap();
    assert_eq!(wal.durable_lsn(), lsn);
}

#[test]
fn test_flush_beyond_last_lsn_is_clamped() {
    let temp = TempDir::new().unwrap();
    let wal = WalWriter::open(temp.path(), every_write(), Lsn(1)).unwrap();

    let lsn = wal.append(TxnId(1), &RecordKind::Commit).unwrap();
    wal.flush_through(Lsn(1_000)).unwrap();
    assert_eq!(wal.durable_lsn(), lsn);
}

#[test]
fn test_concurrent_committers_all_become_durable() {
    let temp = TempDir::new().unwrap();
    let opts = options(
        1024 * 1024,
        WalSyncStrategy::GroupCommit {
            max_batch: 64,
            max_wait_us: 1_000,
        },
    );
    let wal = Arc::new(WalWriter::open(temp.path(), opts, Lsn(1)).unwrap());

    let handles: Vec<_> = (0..16)
        .map(|t| {
            let wal = Arc::clone(&wal);
            thread::spawn(move || {
                for _ in 0..25 {
                    let lsn = wal.append(TxnId(t), &RecordKind::Commit).unwrap();
                    wal.flush_through(lsn).unwrap();
                    assert!(wal.durable_lsn() >= lsn);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    drop(wal);

    let (records, result) = WalRecovery::scan(temp.path()).unwrap();
    assert_eq!(records.len(), 400);
    assert_eq!(result.last_lsn, Lsn(400));
    assert!(records.windows(2).all(|w| w[0].lsn < w[1].lsn));
}

// =============================================================================
// Segment Tests
// =============================================================================

#[test]
fn test_rollover_creates_segments_named_by_first_lsn() {
    let temp = TempDir::new().unwrap();
    let last = write_updates(temp.path(), options(4096, WalSyncStrategy::EveryWrite), 60);

    let segments = list_segments(temp.path()).unwrap();
    assert!(segments.len() > 1);
    assert_eq!(segments[0].start_lsn, Lsn(1));
    for segment in &segments {
        let name = segment.path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, segment_file_name(segment.start_lsn));
    }

    let (records, result) = WalRecovery::scan(temp.path()).unwrap();
    assert_eq!(records.len(), 60);
    assert_eq!(result.last_lsn, last);
    assert_eq!(result.segments, segments.len());

    // Every segment starts with the record its name promises
    for segment in &segments[1..] {
        assert!(records.iter().any(|r| r.lsn == segment.start_lsn));
    }
}

#[test]
fn test_purge_removes_only_whole_segments_below_redo() {
    let temp = TempDir::new().unwrap();
    let wal = WalWriter::open(temp.path(), options(4096, WalSyncStrategy::EveryWrite), Lsn(1)).unwrap();
    let mut last = Lsn::ZERO;
    for i in 0..60 {
        last = wal.append(TxnId(1), &update(i)).unwrap();
        wal.flush_through(last).unwrap();
    }

    let before = list_segments(temp.path()).unwrap();
    assert!(before.len() >= 3);
    let redo = before[2].start_lsn;

    let removed = wal.purge_before(redo).unwrap();
    assert_eq!(removed, 2);

    let after = list_segments(temp.path()).unwrap();
    assert_eq!(after[0].start_lsn, redo);

    // The active segment always survives
    wal.purge_before(Lsn::MAX).unwrap();
    let remaining = list_segments(temp.path()).unwrap();
    assert_eq!(remaining.last(), after.last());
    assert!(wal.durable_lsn() >= last);
}

#[test]
fn test_reopen_continues_after_last_record() {
    let temp = TempDir::new().unwrap();
    let last = write_updates(temp.path(), every_write(), 10);

    let (records, result) = WalRecovery::recover(temp.path()).unwrap();
    assert_eq!(records.len(), 10);

    let wal = WalWriter::open(temp.path(), every_write(), result.last_lsn.next()).unwrap();
    let lsn = wal.append(TxnId(2), &RecordKind::Commit).unwrap();
    assert_eq!(lsn, last.next());
    wal.flush_through(lsn).unwrap();
    drop(wal);

    let (records, _) = WalRecovery::scan(temp.path()).unwrap();
    assert_eq!(records.len(), 11);
    assert_eq!(list_segments(temp.path()).unwrap().len(), 1);
}

#[test]
fn test_drop_flushes_staged_records() {
    let temp = TempDir::new().unwrap();
    {
        let wal = WalWriter::open(temp.path(), every_write(), Lsn(1)).unwrap();
        wal.append(TxnId(1), &RecordKind::Begin).unwrap();
        wal.append(TxnId(1), &RecordKind::Commit).unwrap();
    }

    let (records, _) = WalRecovery::scan(temp.path()).unwrap();
    assert_eq!(records.len(), 2);
}
