//! Tests for WAL Recovery
//!
//! These tests verify:
//! - Recovery from a clean log and an empty directory
//! - Reading a single segment
//! - Torn tails in the newest segment are cut off
//! - Corruption in a sealed segment is fatal
//! - Verify mode never touches the files

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use tidekv::config::WalSyncStrategy;
use tidekv::wal::{list_segments, RecordKind, WalOptions, WalReader, WalRecovery, WalWriter};
use tidekv::{Lsn, PageId, TideError, TxnId};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn write_log(dir: &Path, segment_size: u64, count: usize) -> Lsn {
    let opts = WalOptions {
        segment_size,
        sync_strategy: WalSyncStrategy::EveryWrite,
    };
    let wal = WalWriter::open(dir, opts, Lsn(1)).unwrap();
    let mut last = Lsn::ZERO;
    for i in 0..count {
        last = wal
            .append(
                TxnId(1),
                &RecordKind::Update {
                    page_id: PageId(1),
                    key: format!("key{}", i).into_bytes(),
                    before: None,
                    after: Some(vec![b'v'; 100]),
                },
            )
            .unwrap();
        wal.flush_through(last).unwrap();
    }
    last
}

fn append_garbage(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

// =============================================================================
// Clean Log Tests
// =============================================================================

#[test]
fn test_recover_missing_directory() {
    let temp = TempDir::new().unwrap();
    let (records, result) = WalRecovery::recover(&temp.path().join("wal")).unwrap();

    assert!(records.is_empty());
    assert_eq!(result.last_lsn, Lsn::ZERO);
    assert_eq!(result.segments, 0);
}

#[test]
fn test_recover_clean_log() {
    let temp = TempDir::new().unwrap();
    let last = write_log(temp.path(), 1024 * 1024, 25);

    let (records, result) = WalRecovery::recover(temp.path()).unwrap();
    assert_eq!(records.len(), 25);
    assert_eq!(result.entries_recovered, 25);
    assert_eq!(result.entries_corrupted, 0);
    assert_eq!(result.last_lsn, last);
    assert!(!result.was_truncated);
}

#[test]
fn test_reader_iterates_one_segment() {
    let temp = TempDir::new().unwrap();
    write_log(temp.path(), 1024 * 1024, 4);
    let segment = list_segments(temp.path()).unwrap().pop().unwrap();

    let reader = WalReader::open(&segment.path).unwrap();
    assert_eq!(reader.start_lsn(), Lsn(1));
    let lsns: Vec<Lsn> = reader.records().map(|r| r.unwrap().lsn).collect();
    assert_eq!(lsns, vec![Lsn(1), Lsn(2), Lsn(3), Lsn(4)]);
}

// =============================================================================
// Torn Tail Tests
// =============================================================================

#[test]
fn test_torn_tail_is_truncated() {
    let temp = TempDir::new().unwrap();
    let last = write_log(temp.path(), 1024 * 1024, 10);
    let segment = list_segments(temp.path()).unwrap().pop().unwrap();
    let clean_len = fs::metadata(&segment.path).unwrap().len();

    // Half a frame header
    append_garbage(&segment.path, &[0xAB; 9]);

    let (records, result) = WalRecovery::recover(temp.path()).unwrap();
    assert_eq!(records.len(), 10);
    assert_eq!(result.last_lsn, last);
    assert!(result.was_truncated);
    assert_eq!(result.entries_corrupted, 1);
    assert_eq!(fs::metadata(&segment.path).unwrap().len(), clean_len);

    // A second pass finds nothing to repair
    let (_, again) = WalRecovery::recover(temp.path()).unwrap();
    assert!(!again.was_truncated);
}

#[test]
fn test_truncated_last_record_is_dropped() {
    let temp = TempDir::new().unwrap();
    write_log(temp.path(), 1024 * 1024, 5);
    let segment = list_segments(temp.path()).unwrap().pop().unwrap();
    let len = fs::metadata(&segment.path).unwrap().len();

    let file = OpenOptions::new().write(true).open(&segment.path).unwrap();
    file.set_len(len - 10).unwrap();

    let (records, result) = WalRecovery::recover(temp.path()).unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(result.last_lsn, Lsn(4));
    assert!(result.was_truncated);
}

#[test]
fn test_torn_newest_segment_header_is_removed() {
    let temp = TempDir::new().unwrap();
    write_log(temp.path(), 1024 * 1024, 3);
    let torn = temp.path().join("00000000000000000004.wal");
    fs::write(&torn, b"TKV").unwrap();

    let (records, result) = WalRecovery::recover(temp.path()).unwrap();
    assert_eq!(records.len(), 3);
    assert!(result.was_truncated);
    assert!(!torn.exists());
}

// =============================================================================
// Sealed Segment Tests
// =============================================================================

#[test]
fn test_corrupt_sealed_segment_is_fatal() {
    let temp = TempDir::new().unwrap();
    write_log(temp.path(), 2048, 40);
    let segments = list_segments(temp.path()).unwrap();
    assert!(segments.len() > 1);

    let mut bytes = fs::read(&segments[0].path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    fs::write(&segments[0].path, &bytes).unwrap();

    let err = WalRecovery::recover(temp.path()).unwrap_err();
    assert!(matches!(err, TideError::WalCorruption(_)));
    assert!(err.is_fatal());
}

// =============================================================================
// Verify Mode Tests
// =============================================================================

#[test]
fn test_verify_reports_without_repairing() {
    let temp = TempDir::new().unwrap();
    write_log(temp.path(), 1024 * 1024, 8);
    let segment = list_segments(temp.path()).unwrap().pop().unwrap();
    append_garbage(&segment.path, &[1, 2, 3]);
    let dirty_len = fs::metadata(&segment.path).unwrap().len();

    let result = WalRecovery::verify(temp.path()).unwrap();
    assert_eq!(result.entries_recovered, 8);
    assert!(result.was_truncated);
    assert_eq!(fs::metadata(&segment.path).unwrap().len(), dirty_len);
}
