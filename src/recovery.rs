//! Crash recovery
//!
//! ARIES-style restart over the records `WalRecovery::recover` returns.
//!
//! ## Phases
//! - **Analysis**: find the newest checkpoint, rebuild the set of
//!   transactions without an outcome, note touched pages and the highest
//!   LSN and transaction id seen
//! - **Redo**: repeat history from `redo_lsn`, skipping any change a page
//!   already carries (`page_lsn >= lsn`)
//! - **Undo**: roll losers back newest first, logging a `Compensation` per
//!   update, then an `Abort` per loser
//!
//! Compensations are redo-only, so a crash during or after undo replays to the
//! same state.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::error::{Result, TideError};
use crate::lsn::{Lsn, PageId, TxnId};
use crate::wal::{CheckpointData, RecordKind, WalRecord, WalWriter};

/// What the log says before anything is replayed
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    /// Newest checkpoint and the LSN of its record
    pub checkpoint: Option<(Lsn, CheckpointData)>,
    pub redo_lsn: Lsn,
    /// Transactions with no `Commit` or `Abort`, and their first LSN
    pub losers: BTreeMap<TxnId, Lsn>,
    pub committed: usize,
    pub aborted: usize,
    /// Pages touched by redo-able records from `redo_lsn` on
    pub dirty_pages: BTreeSet<PageId>,
    pub max_lsn: Lsn,
    pub next_txn_id: TxnId,
    /// First LSN a reopened WAL may hand out
    pub next_lsn: Lsn,
}

impl Analysis {
    /// Scan records in LSN order
    pub fn run(records: &[WalRecord]) -> Self {
        let mut analysis = Analysis::default();

        let checkpoint = records.iter().rev().find_map(|r| match &r.kind {
            RecordKind::Checkpoint(data) => Some((r.lsn, data.clone())),
            _ => None,
        });

        let mut max_txn = TxnId(0);
        let mut next_lsn = Lsn(1);
        if let Some((_, data)) = &checkpoint {
            analysis.redo_lsn = data.redo_lsn;
            for txn in &data.active_txns {
                analysis.losers.insert(txn.txn_id, txn.first_lsn);
            }
            max_txn = TxnId(data.next_txn_id.0.saturating_sub(1));
            next_lsn = data.next_lsn;
        } else {
            analysis.redo_lsn = Lsn(1);
        }

        for record in records {
            analysis.max_lsn = analysis.max_lsn.max(record.lsn);
            max_txn = max_txn.max(record.txn_id);
            if record.lsn < analysis.redo_lsn {
                continue;
            }
            match &record.kind {
                RecordKind::Begin => {
                    analysis.losers.entry(record.txn_id).or_insert(record.lsn);
                }
                RecordKind::Update { page_id, .. } | RecordKind::Compensation { page_id, .. } => {
                    analysis.losers.entry(record.txn_id).or_insert(record.lsn);
                    analysis.dirty_pages.insert(*page_id);
                }
                RecordKind::Commit => {
                    if analysis.losers.remove(&record.txn_id).is_some() {
                        analysis.committed += 1;
                    }
                }
                RecordKind::Abort => {
                    if analysis.losers.remove(&record.txn_id).is_some() {
                        analysis.aborted += 1;
                    }
                }
                RecordKind::Checkpoint(_) => {}
            }
        }

        analysis.checkpoint = checkpoint;
        analysis.next_txn_id = TxnId(max_txn.0 + 1);
        analysis.next_lsn = next_lsn.max(analysis.max_lsn.next());
        analysis
    }
}

/// Outcome of a restart
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub checkpoint_lsn: Option<Lsn>,
    pub redo_lsn: Lsn,
    pub records_scanned: usize,
    pub redo_applied: usize,
    pub redo_skipped: usize,
    pub committed: usize,
    pub losers: Vec<TxnId>,
    pub compensations: usize,
    /// Bytes cut from a torn WAL tail
    pub wal_truncated: bool,
    pub wal_corrupted_entries: usize,
    pub next_lsn: Lsn,
    pub next_txn_id: TxnId,
    pub duration: Duration,
}

/// Replays the log into the buffer pool
pub struct RecoveryEngine<'a> {
    pool: &'a BufferPool,
    wal: &'a WalWriter,
}

impl<'a> RecoveryEngine<'a> {
    pub fn new(pool: &'a BufferPool, wal: &'a WalWriter) -> Self {
        Self { pool, wal }
    }

    /// Run redo and undo for an analysed log
    ///
    /// An existing page store is only trusted when the log holds a
    /// checkpoint; a store that was never written replays from the start.
    pub fn run(&self, records: &[WalRecord], analysis: &Analysis) -> Result<RecoveryReport> {
        let started = Instant::now();

        if analysis.checkpoint.is_none() && !self.pool.store().is_pristine() {
            return Err(TideError::UnrecoverableStorage(format!(
                "{} has pages but the WAL holds no valid checkpoint",
                self.pool.store().path().display()
            )));
        }

        let mut report = RecoveryReport {
            checkpoint_lsn: analysis.checkpoint.as_ref().map(|(lsn, _)| *lsn),
            redo_lsn: analysis.redo_lsn,
            records_scanned: records.len(),
            committed: analysis.committed,
            losers: analysis.losers.keys().copied().collect(),
            next_txn_id: analysis.next_txn_id,
            ..Default::default()
        };

        self.redo(records, analysis.redo_lsn, &mut report)?;
        self.undo(records, analysis, &mut report)?;

        report.next_lsn = self.wal.next_lsn();
        report.duration = started.elapsed();
        info!(
            checkpoint = ?report.checkpoint_lsn,
            redo_lsn = %report.redo_lsn,
            redo_applied = report.redo_applied,
            redo_skipped = report.redo_skipped,
            losers = report.losers.len(),
            compensations = report.compensations,
            "recovery complete"
        );
        Ok(report)
    }

    fn redo(&self, records: &[WalRecord], redo_lsn: Lsn, report: &mut RecoveryReport) -> Result<()> {
        for record in records.iter().filter(|r| r.lsn >= redo_lsn) {
            let (page_id, key, image) = match &record.kind {
                RecordKind::Update {
                    page_id, key, after, ..
                } => (*page_id, key, after),
                RecordKind::Compensation {
                    page_id, key, image, ..
                } => (*page_id, key, image),
                _ => continue,
            };
            if apply_if_newer(self.pool, page_id, key, image.as_deref(), record.lsn)? {
                report.redo_applied += 1;
            } else {
                report.redo_skipped += 1;
            }
        }
        debug!(applied = report.redo_applied, skipped = report.redo_skipped, "redo finished");
        Ok(())
    }

    fn undo(&self, records: &[WalRecord], analysis: &Analysis, report: &mut RecoveryReport) -> Result<()> {
        if analysis.losers.is_empty() {
            return Ok(());
        }

        let compensated: HashSet<Lsn> = records
            .iter()
            .filter(|r| analysis.losers.contains_key(&r.txn_id))
            .filter_map(|r| match r.kind {
                RecordKind::Compensation { undoes, .. } => Some(undoes),
                _ => None,
            })
            .collect();

        let mut last = None;
        for record in records.iter().rev() {
            if record.lsn < analysis.redo_lsn || !analysis.losers.contains_key(&record.txn_id) {
                continue;
            }
            let RecordKind::Update {
                page_id,
                key,
                before,
                ..
            } = &record.kind
            else {
                continue;
            };
            if compensated.contains(&record.lsn) {
                continue;
            }

            let lsn = self.wal.append(
                record.txn_id,
                &RecordKind::Compensation {
                    page_id: *page_id,
                    key: key.clone(),
                    image: before.clone(),
                    undoes: record.lsn,
                },
            )?;
            let mut handle = self.pool.pin(*page_id)?;
            handle.write().apply(key, before.as_deref(), lsn)?;
            handle.mark_dirty(lsn);
            report.compensations += 1;
            last = Some(lsn);
        }

        for txn_id in analysis.losers.keys() {
            warn!(txn = %txn_id, "rolled back transaction without a durable outcome");
            last = Some(self.wal.append(*txn_id, &RecordKind::Abort)?);
        }
        if let Some(lsn) = last {
            self.wal.flush_through(lsn)?;
        }
        Ok(())
    }
}

/// Apply one redo image unless the page already has it
pub(crate) fn apply_if_newer(
    pool: &BufferPool,
    page_id: PageId,
    key: &[u8],
    image: Option<&[u8]>,
    lsn: Lsn,
) -> Result<bool> {
    let mut handle = pool.pin(page_id)?;
    if handle.read().page_lsn() >= lsn {
        return Ok(false);
    }
    handle.write().apply(key, image, lsn)?;
    handle.mark_dirty(lsn);
    Ok(true)
}
