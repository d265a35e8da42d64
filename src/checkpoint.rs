//! Fuzzy checkpoints
//!
//! A checkpoint bounds how much WAL recovery must replay and lets old
//! segments be deleted. Writers keep running while it flushes.
//!
//! ## Steps
//! 1. Snapshot the in-flight transactions under the commit barrier
//! 2. Flush every dirty page with `rec_lsn <= checkpoint_lsn`
//! 3. fsync the page store
//! 4. Log `Checkpoint { redo_lsn, .. }` and wait for it to be durable
//! 5. Purge segments wholly below `redo_lsn`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::buffer::BufferPool;
use crate::error::Result;
use crate::lsn::{Lsn, TxnId};
use crate::wal::{ActiveTxn, CheckpointData, RecordKind, WalWriter};

/// State the checkpointer needs from the transaction manager
pub trait ActiveTransactionSource: Send + Sync {
    /// Taken while no commit is between its first record and its page changes
    fn checkpoint_snapshot(&self) -> CheckpointSnapshot;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSnapshot {
    /// Every logged change at or below this is applied to a buffered page
    pub checkpoint_lsn: Lsn,
    /// Transactions with logged records and no durable outcome
    pub active_txns: Vec<ActiveTxn>,
    pub next_txn_id: TxnId,
}

/// Outcome of one checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointStats {
    pub checkpoint_lsn: Lsn,
    pub redo_lsn: Lsn,
    /// LSN of the checkpoint record itself
    pub record_lsn: Lsn,
    pub pages_flushed: usize,
    pub active_txns: usize,
    pub segments_purged: usize,
    pub duration: Duration,
}

pub struct CheckpointManager {
    wal: Arc<WalWriter>,
    pool: Arc<BufferPool>,
    source: Arc<dyn ActiveTransactionSource>,
    /// One checkpoint at a time
    running: Mutex<Option<CheckpointStats>>,
    bytes_at_last: AtomicU64,
    completed: AtomicU64,
}

impl CheckpointManager {
    pub fn new(
        wal: Arc<WalWriter>,
        pool: Arc<BufferPool>,
        source: Arc<dyn ActiveTransactionSource>,
    ) -> Self {
        Self {
            bytes_at_last: AtomicU64::new(wal.bytes_appended()),
            wal,
            pool,
            source,
            running: Mutex::new(None),
            completed: AtomicU64::new(0),
        }
    }

    /// Take a checkpoint now
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        let mut last = self.running.lock();
        let started = Instant::now();
        let bytes_before = self.wal.bytes_appended();

        let snapshot = self.source.checkpoint_snapshot();

        let mut pages_flushed = 0;
        for dirty in self.pool.dirty_pages() {
            if dirty.rec_lsn > snapshot.checkpoint_lsn {
                continue;
            }
            if self.pool.flush_page(dirty.page_id)? {
                pages_flushed += 1;
            }
        }
        self.pool.sync()?;

        let redo_lsn = [
            Some(snapshot.checkpoint_lsn.next()),
            self.pool.min_rec_lsn(),
            snapshot.active_txns.iter().map(|t| t.first_lsn).min(),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(Lsn(1));

        let data = CheckpointData {
            checkpoint_lsn: snapshot.checkpoint_lsn,
            redo_lsn,
            active_txns: snapshot.active_txns.clone(),
            next_txn_id: snapshot.next_txn_id,
            next_lsn: self.wal.next_lsn(),
            timestamp: unix_millis(),
        };
        let record_lsn = self.wal.append(TxnId(0), &RecordKind::Checkpoint(data))?;
        self.wal.flush_through(record_lsn)?;

        let segments_purged = self.wal.purge_before(redo_lsn)?;

        let stats = CheckpointStats {
            checkpoint_lsn: snapshot.checkpoint_lsn,
            redo_lsn,
            record_lsn,
            pages_flushed,
            active_txns: snapshot.active_txns.len(),
            segments_purged,
            duration: started.elapsed(),
        };
        self.bytes_at_last.store(bytes_before, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        debug!(
            checkpoint_lsn = %stats.checkpoint_lsn,
            redo_lsn = %stats.redo_lsn,
            pages = stats.pages_flushed,
            purged = stats.segments_purged,
            "checkpoint complete"
        );
        *last = Some(stats.clone());
        Ok(stats)
    }

    /// WAL bytes appended since the last checkpoint started
    pub fn wal_bytes_since_last(&self) -> u64 {
        self.wal
            .bytes_appended()
            .saturating_sub(self.bytes_at_last.load(Ordering::Relaxed))
    }

    pub fn last_checkpoint(&self) -> Option<CheckpointStats> {
        self.running.lock().clone()
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Background checkpointer
///
/// Checkpoints when `interval` has passed or `wal_bytes` of WAL has been
/// written since the last one, whichever comes first.
pub struct CheckpointRunner {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CheckpointRunner {
    pub fn start(
        manager: Arc<CheckpointManager>,
        interval: Duration,
        wal_bytes: u64,
    ) -> Result<Self> {
        let (stop, stopped) = channel::bounded::<()>(1);
        let poll = interval.min(Duration::from_millis(100)).max(Duration::from_millis(1));

        let handle = thread::Builder::new()
            .name("tidekv-checkpoint".into())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, wal_bytes, "checkpointer started");
                let mut last = Instant::now();
                loop {
                    match stopped.recv_timeout(poll) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let due = last.elapsed() >= interval
                        || (wal_bytes > 0 && manager.wal_bytes_since_last() >= wal_bytes);
                    if !due {
                        continue;
                    }
                    last = Instant::now();
                    if let Err(e) = manager.checkpoint() {
                        if e.is_fatal() {
                            error!(error = %e, "checkpoint failed");
                        } else {
                            warn!(error = %e, "checkpoint failed, retrying next cycle");
                        }
                    }
                }
                info!("checkpointer stopped");
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("checkpoint thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for CheckpointRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
