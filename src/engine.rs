//! Engine Module
//!
//! Wires the WAL, buffer pool, transaction manager, checkpointer and GC into
//! one embeddable engine.
//!
//! ## Startup
//! 1. Open the page store
//! 2. Scan the WAL, cutting off a torn tail
//! 3. Analysis, redo and undo
//! 4. Bootstrap checkpoint
//! 5. Start the background checkpointer and GC

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::buffer::{BufferPool, FlushRetry, PageStore, PoolStats};
use crate::checkpoint::{CheckpointManager, CheckpointRunner, CheckpointStats};
use crate::config::Config;
use crate::error::Result;
use crate::gc::{GcCoordinator, GcRunner, GcStatsSnapshot, GcSweepResult};
use crate::lsn::Lsn;
use crate::recovery::{Analysis, RecoveryEngine, RecoveryReport};
use crate::txn::{CommitNotification, Transaction, TransactionManager, TxnStats};
use crate::wal::{WalOptions, WalRecovery, WalWriter};

/// Point-in-time view of every component
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub durable_lsn: Lsn,
    pub last_lsn: Lsn,
    pub wal_bytes_appended: u64,
    pub pool: PoolStats,
    pub txn: TxnStats,
    pub gc: GcStatsSnapshot,
    pub version_chains: usize,
    pub checkpoints: u64,
    pub last_checkpoint: Option<CheckpointStats>,
}

#[derive(Default)]
struct Background {
    checkpointer: Option<CheckpointRunner>,
    gc: Option<GcRunner>,
}

/// The storage engine
///
/// ## Concurrency
/// Every method takes `&self`; share the engine through an `Arc`.
/// - Transactions run in parallel and only serialize on the short commit
///   critical section
/// - Readers never block on writers
/// - WAL flushing, checkpoints and GC run on their own threads
pub struct Engine {
    config: Config,
    wal: Arc<WalWriter>,
    pool: Arc<BufferPool>,
    txns: Arc<TransactionManager>,
    checkpoints: Arc<CheckpointManager>,
    gc: Arc<GcCoordinator>,
    background: Mutex<Background>,
    recovery: RecoveryReport,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("recovery", &self.recovery)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open or create an engine, recovering from the WAL
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(PageStore::open(
            &config.page_file(),
            config.page_size,
            config.bucket_count,
        )?);

        let wal_dir = config.wal_dir();
        let (records, wal_result) = WalRecovery::recover(&wal_dir)?;
        let analysis = Analysis::run(&records);

        let wal = Arc::new(WalWriter::open(
            &wal_dir,
            WalOptions::from_config(&config),
            analysis.next_lsn,
        )?);
        let pool = Arc::new(BufferPool::new(
            store,
            config.buffer_pool_frames,
            wal.clone(),
            FlushRetry::from_config(&config),
        ));

        let mut recovery = RecoveryEngine::new(&pool, &wal).run(&records, &analysis)?;
        recovery.wal_truncated = wal_result.was_truncated;
        recovery.wal_corrupted_entries = wal_result.entries_corrupted as usize;
        drop(records);

        let txns = Arc::new(TransactionManager::new(
            wal.clone(),
            pool.clone(),
            analysis.next_txn_id,
            config.commit_notification_capacity,
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            wal.clone(),
            pool.clone(),
            txns.clone(),
        ));
        checkpoints.checkpoint()?;
        let gc = Arc::new(GcCoordinator::new(txns.clone()));

        let engine = Self {
            config,
            wal,
            pool,
            txns,
            checkpoints,
            gc,
            background: Mutex::new(Background::default()),
            recovery,
        };
        if engine.config.background_tasks {
            engine.start_background()?;
        }

        info!(
            data_dir = %engine.config.data_dir.display(),
            next_lsn = %engine.wal.next_lsn(),
            losers = engine.recovery.losers.len(),
            "engine opened"
        );
        Ok(engine)
    }

    /// Open with default settings in `path`
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    fn start_background(&self) -> Result<()> {
        let mut background = self.background.lock();
        background.checkpointer = Some(CheckpointRunner::start(
            self.checkpoints.clone(),
            Duration::from_millis(self.config.checkpoint_interval_ms),
            self.config.checkpoint_wal_bytes,
        )?);
        background.gc = Some(GcRunner::start(
            self.gc.clone(),
            Duration::from_millis(self.config.gc_interval_ms),
        )?);
        Ok(())
    }

    fn stop_background(&self) {
        let mut background = self.background.lock();
        if let Some(mut runner) = background.checkpointer.take() {
            runner.stop();
        }
        if let Some(mut runner) = background.gc.take() {
            runner.stop();
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn begin(&self) -> Transaction {
        self.txns.begin()
    }

    pub fn put(&self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        txn.put(key, value)
    }

    pub fn get(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Bytes>> {
        txn.get(key)
    }

    pub fn delete(&self, txn: &mut Transaction, key: &[u8]) -> Result<()> {
        txn.delete(key)
    }

    /// Commit and wait until durable
    pub fn commit(&self, txn: Transaction) -> Result<Lsn> {
        txn.commit()
    }

    pub fn abort(&self, txn: Transaction) -> Result<()> {
        txn.abort()
    }

    /// Receive a notification for every later commit
    ///
    /// A subscriber that falls behind misses notifications rather than
    /// slowing commits down.
    pub fn subscribe_commits(&self) -> Receiver<CommitNotification> {
        self.txns.subscribe()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    pub fn checkpoint_now(&self) -> Result<CheckpointStats> {
        self.checkpoints.checkpoint()
    }

    pub fn gc_now(&self) -> GcSweepResult {
        self.gc.sweep()
    }

    pub fn oldest_active_snapshot(&self) -> Option<Lsn> {
        self.gc.oldest_active_snapshot()
    }

    pub fn gc_watermark(&self) -> Lsn {
        self.gc.watermark()
    }

    /// Resume after a WAL write fault
    ///
    /// Returns the number of rolled-back transactions that were sealed.
    pub fn clear_wal_fault(&self) -> Result<usize> {
        self.txns.clear_wal_fault()
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            durable_lsn: self.wal.durable_lsn(),
            last_lsn: self.wal.last_lsn(),
            wal_bytes_appended: self.wal.bytes_appended(),
            pool: self.pool.stats(),
            txn: self.txns.stats(),
            gc: self.gc.stats(),
            version_chains: self.txns.versions().chain_count(),
            checkpoints: self.checkpoints.completed(),
            last_checkpoint: self.checkpoints.last_checkpoint(),
        }
    }

    /// Stop background work and take a final checkpoint
    pub fn close(self) -> Result<()> {
        self.stop_background();
        self.checkpoints.checkpoint()?;
        info!(durable_lsn = %self.wal.durable_lsn(), "engine closed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_background();
        if self.wal.is_failed() {
            warn!("engine dropped with a latched WAL fault");
        }
    }
}
