//! Tests for Version Garbage Collection
//!
//! These tests verify:
//! - Pruning keeps the newest version each snapshot can see
//! - The watermark follows the oldest registered snapshot
//! - Old snapshots keep reading their version across sweeps
//! - Settled chains are dropped and reads fall back to pages

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use tempfile::TempDir;
use tidekv::txn::{VersionChain, VersionState, VersionedRecord};
use tidekv::{Config, Engine, Lsn, TxnId};

// =============================================================================
// Helper Functions
// =============================================================================

fn open(dir: &Path) -> Engine {
    let config = Config::builder()
        .data_dir(dir)
        .page_size(4096)
        .bucket_count(16)
        .buffer_pool_frames(16)
        .background_tasks(false)
        .build();
    Engine::open(config).unwrap()
}

fn put(engine: &Engine, key: &[u8], value: &[u8]) -> Lsn {
    let mut txn = engine.begin();
    engine.put(&mut txn, key, value).unwrap();
    engine.commit(txn).unwrap()
}

fn committed(lsn: u64, value: &str) -> VersionedRecord {
    VersionedRecord {
        commit_lsn: Lsn(lsn),
        txn_id: TxnId(lsn),
        state: VersionState::Committed,
        value: Some(Bytes::from(value.to_string())),
        prev: None,
    }
}

fn chain_5_15_25() -> VersionChain {
    let mut chain = VersionChain::default();
    chain.push(committed(5, "v5"));
    chain.push(committed(15, "v15"));
    chain.push(committed(25, "v25"));
    chain
}

// =============================================================================
// Chain Pruning Tests
// =============================================================================

#[test]
fn test_prune_keeps_version_visible_at_watermark() {
    let mut chain = chain_5_15_25();

    let result = chain.prune(Lsn(16));
    assert_eq!(result.versions, 1);
    assert!(result.bytes > 0);
    assert_eq!(chain.len(), 2);

    assert_eq!(chain.visible(Lsn(16)).unwrap().value.as_deref(), Some(&b"v15"[..]));
    assert_eq!(chain.visible(Lsn(30)).unwrap().value.as_deref(), Some(&b"v25"[..]));
    assert!(!chain.is_settled(Lsn(16)));
}

#[test]
fn test_prune_below_every_version_is_a_no_op() {
    let mut chain = chain_5_15_25();

    assert_eq!(chain.prune(Lsn(4)).versions, 0);
    assert_eq!(chain.len(), 3);
    assert!(chain.visible(Lsn(4)).is_none());
}

#[test]
fn test_prune_to_head_settles_chain() {
    let mut chain = chain_5_15_25();

    assert_eq!(chain.prune(Lsn(25)).versions, 2);
    assert_eq!(chain.len(), 1);
    assert!(chain.is_settled(Lsn(25)));
    assert_eq!(chain.iter().count(), 1);
}

#[test]
fn test_pending_head_is_never_pruned() {
    let mut chain = chain_5_15_25();
    chain.push(VersionedRecord {
        state: VersionState::Pending,
        ..committed(30, "v30")
    });

    chain.prune(Lsn(40));
    assert_eq!(chain.len(), 2);
    assert_eq!(chain.head().unwrap().state, VersionState::Pending);
    assert!(!chain.is_settled(Lsn(40)));
    assert_eq!(chain.visible(Lsn(40)).unwrap().commit_lsn, Lsn(25));
}

#[test]
fn test_reclaimed_slots_are_reused() {
    let mut chain = chain_5_15_25();
    chain.prune(Lsn(25));

    chain.push(committed(35, "v35"));
    chain.push(committed(45, "v45"));
    assert_eq!(chain.len(), 3);
    let lsns: Vec<Lsn> = chain.iter().map(|v| v.commit_lsn).collect();
    assert_eq!(lsns, vec![Lsn(45), Lsn(35), Lsn(25)]);
}

// =============================================================================
// Watermark Tests
// =============================================================================

#[test]
fn test_watermark_follows_oldest_snapshot() {
    let temp = TempDir::new().unwrap();
    let engine = open(temp.path());
    put(&engine, b"k", b"1");

    assert_eq!(engine.oldest_active_snapshot(), None);
    assert_eq!(engine.gc_watermark(), engine.stats().last_lsn);

    let old = engine.begin();
    put(&engine, b"k", b"2");
    let young = engine.begin();

    assert_eq!(engine.oldest_active_snapshot(), Some(old.start_lsn()));
    assert_eq!(engine.gc_watermark(), old.start_lsn());

    drop(old);
    assert_eq!(engine.gc_watermark(), young.start_lsn());
}

// =============================================================================
// Engine Sweep Tests
// =============================================================================

#[test]
fn test_sweep_preserves_old_snapshot() {
    let temp = TempDir::new().unwrap();
    let engine = open(temp.path());

    put(&engine, b"k", b"v1");
    let old = engine.begin();
    put(&engine, b"k", b"v2");
    put(&engine, b"k", b"v3");

    let result = engine.gc_now();
    assert_eq!(result.watermark, old.start_lsn());
    assert_eq!(result.chains_removed, 0);
    assert_eq!(engine.get(&old, b"k").unwrap().as_deref(), Some(&b"v1"[..]));

    drop(old);
    let result = engine.gc_now();
    assert_eq!(result.reclaimed_versions, 2);
    assert_eq!(result.chains_removed, 1);
    assert_eq!(engine.stats().version_chains, 0);

    let reader = engine.begin();
    assert_eq!(engine.get(&reader, b"k").unwrap().as_deref(), Some(&b"v3"[..]));
}

#[test]
fn test_sweep_drops_tombstoned_keys() {
    let temp = TempDir::new().unwrap();
    let engine = open(temp.path());

    put(&engine, b"k", b"v");
    let mut txn = engine.begin();
    engine.delete(&mut txn, b"k").unwrap();
    engine.commit(txn).unwrap();

    engine.gc_now();
    assert_eq!(engine.stats().version_chains, 0);

    let reader = engine.begin();
    assert_eq!(engine.get(&reader, b"k").unwrap(), None);
}

#[test]
fn test_sweep_stats_accumulate() {
    let temp = TempDir::new().unwrap();
    let engine = open(temp.path());

    for i in 0..5u8 {
        put(&engine, &[i], b"a");
        put(&engine, &[i], b"b");
    }
    let first = engine.gc_now();
    assert_eq!(first.chains_inspected, 5);
    engine.gc_now();

    let stats = engine.stats().gc;
    assert_eq!(stats.total_sweeps, 2);
    assert_eq!(stats.total_chains_removed, 5);
    assert!(stats.max_chain_length_observed >= 3);
}

#[test]
fn test_snapshot_reads_stable_during_sweeps() {
    let temp = TempDir::new().unwrap();
    let engine = Arc::new(open(temp.path()));
    put(&engine, b"hot", b"0");

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let engine = Arc::clone(&engine);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for i in 1..=200u32 {
                put(&engine, b"hot", i.to_string().as_bytes());
            }
            done.store(true, Ordering::SeqCst);
        })
    };
    let collector = {
        let engine = Arc::clone(&engine);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                engine.gc_now();
            }
        })
    };

    while !done.load(Ordering::SeqCst) {
        let txn = engine.begin();
        let first = engine.get(&txn, b"hot").unwrap();
        thread::yield_now();
        let second = engine.get(&txn, b"hot").unwrap();
        assert_eq!(first, second);
        assert!(first.is_some());
    }

    writer.join().unwrap();
    collector.join().unwrap();
    let txn = engine.begin();
    assert_eq!(engine.get(&txn, b"hot").unwrap().as_deref(), Some(&b"200"[..]));
}
