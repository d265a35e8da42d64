//! Tests for Crash Recovery
//!
//! These tests verify:
//! - Committed transactions survive a crash
//! - Transactions without a durable commit are rolled back, even when their
//!   pages reached disk
//! - Torn WAL tails are cut off at restart
//! - A commit cut at any byte of its records is all-or-nothing, including
//!   values spread over overflow pages
//! - Recovery is idempotent across repeated crashes
//! - A page file without a usable log is refused

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use proptest::prelude::*;
use tempfile::TempDir;
use tidekv::buffer::{cell_key, PageStore};
use tidekv::wal::{list_segments, RecordKind, WalOptions, WalRecovery, WalWriter};
use tidekv::{Config, Engine, Lsn, PageId, TideError, TxnId};

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &Path) -> Config {
    Config::builder()
        .data_dir(dir)
        .page_size(4096)
        .bucket_count(16)
        .buffer_pool_frames(8)
        .background_tasks(false)
        .build()
}

fn put(engine: &Engine, key: &[u8], value: &[u8]) -> Lsn {
    let mut txn = engine.begin();
    engine.put(&mut txn, key, value).unwrap();
    engine.commit(txn).unwrap()
}

fn read(engine: &Engine, key: &[u8]) -> Option<Vec<u8>> {
    let txn = engine.begin();
    engine.get(&txn, key).unwrap().map(|v| v.to_vec())
}

/// Dropping without `close` skips the final checkpoint, like a crash
fn crash(engine: Engine) {
    drop(engine);
}

fn bucket_of(dir: &Path, key: &[u8]) -> PageId {
    PageStore::open(&dir.join("pages.db"), 4096, 16)
        .unwrap()
        .bucket_for(key)
}

/// Cell image of a value stored whole: a part count of one, then the bytes
fn stored(value: &[u8]) -> Vec<u8> {
    let mut image = 1u32.to_le_bytes().to_vec();
    image.extend_from_slice(value);
    image
}

/// Copy of the data directory with the newest WAL segment cut to `len` bytes
fn truncated_copy(dir: &Path, len: u64) -> TempDir {
    let copy = TempDir::new().unwrap();
    fs::copy(dir.join("pages.db"), copy.path().join("pages.db")).unwrap();
    fs::create_dir(copy.path().join("wal")).unwrap();
    for segment in list_segments(&dir.join("wal")).unwrap() {
        let name = segment.path.file_name().unwrap();
        fs::copy(&segment.path, copy.path().join("wal").join(name)).unwrap();
    }

    let newest = list_segments(&copy.path().join("wal")).unwrap().pop().unwrap();
    OpenOptions::new()
        .write(true)
        .open(&newest.path)
        .unwrap()
        .set_len(len)
        .unwrap();
    copy
}

fn newest_segment_len(dir: &Path) -> u64 {
    let newest = list_segments(&dir.join("wal")).unwrap().pop().unwrap();
    fs::metadata(&newest.path).unwrap().len()
}

/// Log `Begin` and one update for a transaction that never commits
fn log_loser(dir: &Path, txn: TxnId, key: &[u8], before: &[u8], after: &[u8]) -> Lsn {
    let wal_dir = dir.join("wal");
    let (_, scanned) = WalRecovery::recover(&wal_dir).unwrap();
    let wal = WalWriter::open(&wal_dir, WalOptions::default(), scanned.last_lsn.next()).unwrap();

    wal.append(txn, &RecordKind::Begin).unwrap();
    let lsn = wal
        .append(
            txn,
            &RecordKind::Update {
                page_id: bucket_of(dir, key),
                key: cell_key(key, 0),
                before: Some(stored(before)),
                after: Some(stored(after)),
            },
        )
        .unwrap();
    wal.flush_through(lsn).unwrap();
    lsn
}

// =============================================================================
// Committed Work Tests
// =============================================================================

#[test]
fn test_committed_survives_crash() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(temp.path())).unwrap();
        for i in 0..50 {
            put(&engine, format!("key{}", i).as_bytes(), format!("value{}", i).as_bytes());
        }
        crash(engine);
    }

    let engine = Engine::open(config(temp.path())).unwrap();
    for i in 0..50 {
        assert_eq!(
            read(&engine, format!("key{}", i).as_bytes()),
            Some(format!("value{}", i).into_bytes())
        );
    }
    let report = engine.recovery_report();
    assert!(report.redo_applied + report.redo_skipped >= 50);
    assert_eq!(report.committed, 50);
    assert!(report.losers.is_empty());
}

#[test]
fn test_crash_after_checkpoint() {
    let temp = TempDir::new().unwrap();
    let checkpoint_lsn = {
        let engine = Engine::open(config(temp.path())).unwrap();
        put(&engine, b"before", b"1");
        let stats = engine.checkpoint_now().unwrap();
        put(&engine, b"after", b"2");
        put(&engine, b"before", b"3");
        crash(engine);
        stats.record_lsn
    };

    let engine = Engine::open(config(temp.path())).unwrap();
    assert_eq!(read(&engine, b"before"), Some(b"3".to_vec()));
    assert_eq!(read(&engine, b"after"), Some(b"2".to_vec()));

    let report = engine.recovery_report();
    assert_eq!(report.checkpoint_lsn, Some(checkpoint_lsn));
    assert!(report.redo_lsn > Lsn(1));
    assert_eq!(report.committed, 2);
}

#[test]
fn test_repeated_crashes_are_idempotent() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(temp.path())).unwrap();
        put(&engine, b"a", b"1");
        put(&engine, b"b", b"2");
        crash(engine);
    }

    for _ in 0..3 {
        let engine = Engine::open(config(temp.path())).unwrap();
        assert_eq!(read(&engine, b"a"), Some(b"1".to_vec()));
        assert_eq!(read(&engine, b"b"), Some(b"2".to_vec()));
        crash(engine);
    }
}

// =============================================================================
// Loser Transaction Tests
// =============================================================================

#[test]
fn test_uncommitted_update_is_undone() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(temp.path())).unwrap();
        put(&engine, b"k", b"v1");
        crash(engine);
    }
    log_loser(temp.path(), TxnId(500), b"k", b"v1", b"v2");

    {
        let engine = Engine::open(config(temp.path())).unwrap();
        assert_eq!(read(&engine, b"k"), Some(b"v1".to_vec()));

        let report = engine.recovery_report();
        assert_eq!(report.losers, vec![TxnId(500)]);
        assert_eq!(report.compensations, 1);
        assert!(engine.begin().id() > TxnId(500));
        crash(engine);
    }

    // The loser was aborted on disk and is not rolled back twice
    let engine = Engine::open(config(temp.path())).unwrap();
    assert!(engine.recovery_report().losers.is_empty());
    assert_eq!(engine.recovery_report().compensations, 0);
    assert_eq!(read(&engine, b"k"), Some(b"v1".to_vec()));
}

#[test]
fn test_stolen_loser_page_is_undone() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(temp.path())).unwrap();
        put(&engine, b"k", b"v1");
        engine.close().unwrap();
    }
    let lsn = log_loser(temp.path(), TxnId(700), b"k", b"v1", b"stolen");

    // The uncommitted change reached the page file before the crash
    {
        let store = PageStore::open(&temp.path().join("pages.db"), 4096, 16).unwrap();
        let page_id = store.bucket_for(b"k");
        let mut page = store.read_page(page_id).unwrap();
        let cell = cell_key(b"k", 0);
        assert_eq!(page.get(&cell), Some(&stored(b"v1")[..]));
        page.apply(&cell, Some(&stored(b"stolen")), lsn).unwrap();
        store.write_page(page_id, &page.encode()).unwrap();
        store.sync().unwrap();
    }

    let engine = Engine::open(config(temp.path())).unwrap();
    assert_eq!(read(&engine, b"k"), Some(b"v1".to_vec()));
    let report = engine.recovery_report();
    assert_eq!(report.losers, vec![TxnId(700)]);
    assert!(report.redo_skipped >= 1);
    engine.close().unwrap();

    let engine = Engine::open(config(temp.path())).unwrap();
    assert_eq!(read(&engine, b"k"), Some(b"v1".to_vec()));
}

#[test]
fn test_dropped_writer_leaves_nothing() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(temp.path())).unwrap();
        put(&engine, b"keep", b"yes");
        let mut txn = engine.begin();
        engine.put(&mut txn, b"lost", b"no").unwrap();
        drop(txn);
        crash(engine);
    }

    let engine = Engine::open(config(temp.path())).unwrap();
    assert_eq!(read(&engine, b"keep"), Some(b"yes".to_vec()));
    assert_eq!(read(&engine, b"lost"), None);
    assert!(engine.recovery_report().losers.is_empty());
}

// =============================================================================
// WAL Damage Tests
// =============================================================================

#[test]
fn test_torn_tail_after_crash() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(temp.path())).unwrap();
        put(&engine, b"k", b"v");
        crash(engine);
    }

    let newest = list_segments(&temp.path().join("wal")).unwrap().pop().unwrap();
    let mut file = OpenOptions::new().append(true).open(&newest.path).unwrap();
    file.write_all(&[0x5A; 23]).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let engine = Engine::open(config(temp.path())).unwrap();
    assert!(engine.recovery_report().wal_truncated);
    assert_eq!(engine.recovery_report().wal_corrupted_entries, 1);
    assert_eq!(read(&engine, b"k"), Some(b"v".to_vec()));

    // New records land after the repaired tail
    put(&engine, b"k", b"w");
    crash(engine);
    let engine = Engine::open(config(temp.path())).unwrap();
    assert!(!engine.recovery_report().wal_truncated);
    assert_eq!(read(&engine, b"k"), Some(b"w".to_vec()));
}

#[test]
fn test_pages_without_log_are_unrecoverable() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(temp.path())).unwrap();
        put(&engine, b"k", b"v");
        engine.close().unwrap();
    }
    fs::remove_dir_all(temp.path().join("wal")).unwrap();

    let err = Engine::open(config(temp.path())).unwrap_err();
    assert!(matches!(err, TideError::UnrecoverableStorage(_)));
    assert!(err.is_fatal());
}

#[test]
fn test_every_cut_through_a_commit_is_all_or_nothing() {
    let temp = TempDir::new().unwrap();
    let keys: [&[u8]; 3] = [b"alpha", b"beta", b"gamma"];
    let (start, end) = {
        let engine = Engine::open(config(temp.path())).unwrap();
        for key in keys {
            put(&engine, key, b"old");
        }
        let start = newest_segment_len(temp.path());

        let mut txn = engine.begin();
        for key in keys {
            engine.put(&mut txn, key, b"new").unwrap();
        }
        engine.commit(txn).unwrap();
        let end = newest_segment_len(temp.path());
        crash(engine);
        (start, end)
    };
    assert!(end > start);

    for len in start..=end {
        let copy = truncated_copy(temp.path(), len);
        let engine = Engine::open(config(copy.path())).unwrap();
        let expected: &[u8] = if len == end { b"new" } else { b"old" };
        for key in keys {
            assert_eq!(read(&engine, key).as_deref(), Some(expected), "cut at byte {}", len);
        }
        crash(engine);
    }
}

#[test]
fn test_cut_through_an_overflow_commit_keeps_the_old_values() {
    let temp = TempDir::new().unwrap();
    // Enough frames that no page of the cut commit is stolen before the crash
    let roomy = |dir: &Path| Config {
        buffer_pool_frames: 64,
        ..config(dir)
    };
    let old: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
    let new: Vec<u8> = (0..24_000u32).map(|i| (i / 3) as u8).collect();
    let (start, end) = {
        let engine = Engine::open(roomy(temp.path())).unwrap();
        put(&engine, b"blob", &old);
        put(&engine, b"tag", b"old");
        let start = newest_segment_len(temp.path());

        let mut txn = engine.begin();
        engine.put(&mut txn, b"blob", &new).unwrap();
        engine.put(&mut txn, b"tag", b"new").unwrap();
        engine.commit(txn).unwrap();
        let end = newest_segment_len(temp.path());
        crash(engine);
        (start, end)
    };

    for len in (start..end).step_by(997).chain([end - 1, end]) {
        let copy = truncated_copy(temp.path(), len);
        let engine = Engine::open(roomy(copy.path())).unwrap();
        if len == end {
            assert_eq!(read(&engine, b"blob"), Some(new.clone()));
            assert_eq!(read(&engine, b"tag"), Some(b"new".to_vec()));
        } else {
            assert_eq!(read(&engine, b"blob"), Some(old.clone()), "cut at byte {}", len);
            assert_eq!(read(&engine, b"tag"), Some(b"old".to_vec()), "cut at byte {}", len);
        }
        crash(engine);
    }
}

// =============================================================================
// Property Tests
// =============================================================================

type KeyWrite = (u8, Option<Vec<u8>>);

fn txn_strategy() -> impl Strategy<Value = (Vec<KeyWrite>, bool)> {
    (
        prop::collection::vec(
            (0u8..8, prop::option::of(prop::collection::vec(any::<u8>(), 0..24))),
            1..4,
        ),
        any::<bool>(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn test_recovery_matches_committed_history(
        txns in prop::collection::vec(txn_strategy(), 1..12),
        checkpoint_at in 0usize..12,
    ) {
        let temp = TempDir::new().unwrap();
        let mut model: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
        {
            let engine = Engine::open(config(temp.path())).unwrap();
            for (i, (writes, commit)) in txns.iter().enumerate() {
                if i == checkpoint_at {
                    engine.checkpoint_now().unwrap();
                }
                let mut txn = engine.begin();
                for (key, value) in writes {
                    match value {
                        Some(v) => engine.put(&mut txn, &[*key], v).unwrap(),
                        None => engine.delete(&mut txn, &[*key]).unwrap(),
                    }
                }
                if *commit {
                    engine.commit(txn).unwrap();
                    for (key, value) in writes {
                        match value {
                            Some(v) => model.insert(*key, v.clone()),
                            None => model.remove(key),
                        };
                    }
                } else {
                    engine.abort(txn).unwrap();
                }
            }
            crash(engine);
        }

        for _ in 0..2 {
            let engine = Engine::open(config(temp.path())).unwrap();
            for key in 0u8..8 {
                prop_assert_eq!(read(&engine, &[key]), model.get(&key).cloned());
            }
            prop_assert!(engine.recovery_report().losers.is_empty());
            crash(engine);
        }
    }
}
