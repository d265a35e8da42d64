//! Version garbage collection
//!
//! Prunes version chains below the watermark and unlinks chains that carry
//! nothing beyond what their page already holds.
//!
//! ## Safety
//! - The watermark never exceeds the oldest registered snapshot
//! - Pruning keeps the newest committed version at or below the watermark
//! - Chains are unlinked only under the commit barrier, so no commit can be
//!   halfway through creating or extending one

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::lsn::Lsn;
use crate::txn::TransactionManager;

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcSweepResult {
    pub watermark: Lsn,
    pub chains_inspected: u64,
    /// Chains that lost at least one version
    pub chains_pruned: u64,
    /// Chains unlinked from the index
    pub chains_removed: u64,
    pub reclaimed_versions: u64,
    pub reclaimed_bytes: u64,
    pub sweep_duration_us: u64,
}

/// Cumulative GC statistics
#[derive(Debug, Default)]
pub struct GcStats {
    pub total_sweeps: AtomicU64,
    pub total_reclaimed_versions: AtomicU64,
    pub total_reclaimed_bytes: AtomicU64,
    pub total_chains_removed: AtomicU64,
    pub last_watermark: AtomicU64,
    pub max_chain_length_observed: AtomicU64,
}

impl GcStats {
    pub fn record_sweep(&self, result: &GcSweepResult) {
        self.total_sweeps.fetch_add(1, Ordering::Relaxed);
        self.total_reclaimed_versions
            .fetch_add(result.reclaimed_versions, Ordering::Relaxed);
        self.total_reclaimed_bytes
            .fetch_add(result.reclaimed_bytes, Ordering::Relaxed);
        self.total_chains_removed
            .fetch_add(result.chains_removed, Ordering::Relaxed);
        self.last_watermark
            .store(result.watermark.0, Ordering::Relaxed);
    }

    pub fn observe_chain_length(&self, len: u64) {
        self.max_chain_length_observed
            .fetch_max(len, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            total_sweeps: self.total_sweeps.load(Ordering::Relaxed),
            total_reclaimed_versions: self.total_reclaimed_versions.load(Ordering::Relaxed),
            total_reclaimed_bytes: self.total_reclaimed_bytes.load(Ordering::Relaxed),
            total_chains_removed: self.total_chains_removed.load(Ordering::Relaxed),
            last_watermark: Lsn(self.last_watermark.load(Ordering::Relaxed)),
            max_chain_length_observed: self.max_chain_length_observed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `GcStats`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStatsSnapshot {
    pub total_sweeps: u64,
    pub total_reclaimed_versions: u64,
    pub total_reclaimed_bytes: u64,
    pub total_chains_removed: u64,
    pub last_watermark: Lsn,
    pub max_chain_length_observed: u64,
}

pub struct GcCoordinator {
    manager: Arc<TransactionManager>,
    stats: GcStats,
}

impl GcCoordinator {
    pub fn new(manager: Arc<TransactionManager>) -> Self {
        Self {
            manager,
            stats: GcStats::default(),
        }
    }

    /// Versions committed at or below this may be collapsed
    pub fn watermark(&self) -> Lsn {
        self.manager.watermark()
    }

    /// Oldest snapshot still registered, for compaction collaborators
    pub fn oldest_active_snapshot(&self) -> Option<Lsn> {
        self.manager.oldest_active_snapshot()
    }

    /// Prune every chain against the current watermark
    pub fn sweep(&self) -> GcSweepResult {
        let started = Instant::now();
        let watermark = self.watermark();
        let versions = self.manager.versions();
        let mut result = GcSweepResult {
            watermark,
            ..Default::default()
        };

        let mut settled = Vec::new();
        for (key, chain) in versions.chains() {
            result.chains_inspected += 1;
            let mut chain = chain.write();
            self.stats.observe_chain_length(chain.len() as u64);

            let pruned = chain.prune(watermark);
            if pruned.versions > 0 {
                result.chains_pruned += 1;
                result.reclaimed_versions += pruned.versions;
                result.reclaimed_bytes += pruned.bytes;
            }
            if chain.is_settled(watermark) {
                settled.push(key);
            }
        }

        if !settled.is_empty() {
            let _barrier = self.manager.commit_barrier();
            for key in &settled {
                if versions.remove_if(key, |chain| chain.is_settled(watermark)) {
                    result.chains_removed += 1;
                }
            }
        }

        result.sweep_duration_us = started.elapsed().as_micros() as u64;
        self.stats.record_sweep(&result);
        debug!(
            watermark = %watermark,
            inspected = result.chains_inspected,
            reclaimed = result.reclaimed_versions,
            removed = result.chains_removed,
            us = result.sweep_duration_us,
            "GC sweep"
        );
        result
    }

    pub fn stats(&self) -> GcStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Background GC thread
pub struct GcRunner {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl GcRunner {
    pub fn start(coordinator: Arc<GcCoordinator>, interval: Duration) -> Result<Self> {
        let (stop, stopped) = channel::bounded::<()>(1);
        let interval = interval.max(Duration::from_millis(1));

        let handle = thread::Builder::new()
            .name("tidekv-gc".into())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "GC runner started");
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            coordinator.sweep();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("GC runner stopped");
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("GC thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for GcRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
