//! Transaction manager
//!
//! Owns snapshot registration, first-committer-wins validation, the commit
//! pipeline and the in-flight commit registry.
//!
//! ## Commit pipeline
//! ```text
//! warm heads ─► commit_lock { validate ─► plan cells on page copies ─►
//!               Begin/Update* ─► install pages ─►
//!               registry { Commit, pending versions } }
//!            ─► flush_through(commit_lsn) ─► registry { publish durable prefix }
//! ```
//!
//! Commits are published in LSN order. Whoever finds the WAL durable past a
//! run of in-flight commits publishes the whole run, so once `commit` returns
//! every new snapshot includes it.
//!
//! ## Locking
//! ```text
//! commit_lock ──► version shard ──► version chain
//! commit_lock ──► registry ──► version chain
//! registry ──► WAL staging
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::transaction::Transaction;
use super::version::{SharedChain, VersionState, VersionStore, VersionedRecord};
use super::{CommitNotification, TxnStats};
use crate::buffer::{read_value, BucketLayout, BufferPool, ChainEditor, Page};
use crate::checkpoint::{ActiveTransactionSource, CheckpointSnapshot};
use crate::error::{Result, TideError};
use crate::lsn::{Lsn, PageId, TxnId};
use crate::wal::{ActiveTxn, RecordKind, WalWriter};

/// A logged update and the image that undoes it
#[derive(Debug, Clone)]
struct UndoEntry {
    page_id: PageId,
    key: Vec<u8>,
    before: Option<Vec<u8>>,
    lsn: Lsn,
}

/// A commit whose record is logged but not yet durable
struct InFlight {
    txn_id: TxnId,
    first_lsn: Lsn,
    undo: Vec<UndoEntry>,
    keys: Vec<Vec<u8>>,
}

/// Logged records of a transaction that will never commit and has no
/// `Abort` on disk yet
struct Unsealed {
    txn_id: TxnId,
    begin_lsn: Lsn,
    undo: Vec<UndoEntry>,
}

#[derive(Default)]
struct Registry {
    /// Registered snapshots as `(start_lsn, txn_id)`
    snapshots: BTreeSet<(Lsn, TxnId)>,
    /// Keyed by commit LSN
    in_flight: BTreeMap<Lsn, InFlight>,
    /// Commits published by another committer whose owner has not returned
    published_by_peer: HashSet<Lsn>,
    unsealed: Vec<Unsealed>,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    conflicts: AtomicU64,
    rolled_back: AtomicU64,
    dropped_notifications: AtomicU64,
}

pub struct TransactionManager {
    wal: Arc<WalWriter>,
    pool: Arc<BufferPool>,
    layout: BucketLayout,
    versions: Arc<VersionStore>,
    commit_lock: Mutex<()>,
    registry: Mutex<Registry>,
    next_txn_id: AtomicU64,
    subscribers: Mutex<Vec<Sender<CommitNotification>>>,
    notification_capacity: usize,
    counters: Counters,
}

impl TransactionManager {
    pub fn new(
        wal: Arc<WalWriter>,
        pool: Arc<BufferPool>,
        next_txn_id: TxnId,
        notification_capacity: usize,
    ) -> Self {
        Self {
            wal,
            layout: pool.layout(),
            pool,
            versions: Arc::new(VersionStore::new()),
            commit_lock: Mutex::new(()),
            registry: Mutex::new(Registry::default()),
            next_txn_id: AtomicU64::new(next_txn_id.0.max(1)),
            subscribers: Mutex::new(Vec::new()),
            notification_capacity: notification_capacity.max(1),
            counters: Counters::default(),
        }
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    /// Start a transaction reading at the current horizon
    pub fn begin(self: &Arc<Self>) -> Transaction {
        let txn_id = TxnId(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        let start_lsn = {
            let mut registry = self.registry.lock();
            let start = self.horizon(&registry);
            registry.snapshots.insert((start, txn_id));
            start
        };
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        debug!(txn = %txn_id, start_lsn = %start_lsn, "transaction started");
        Transaction::new(Arc::clone(self), txn_id, start_lsn)
    }

    /// Highest LSN a new snapshot may include
    ///
    /// Everything at or below it is either published or was never a commit.
    fn horizon(&self, registry: &Registry) -> Lsn {
        match registry.in_flight.keys().next() {
            Some(oldest) => oldest.prev(),
            None => self.wal.last_lsn(),
        }
    }

    /// Current read horizon
    pub fn read_horizon(&self) -> Lsn {
        let registry = self.registry.lock();
        self.horizon(&registry)
    }

    /// Start LSN of the oldest registered snapshot
    pub fn oldest_active_snapshot(&self) -> Option<Lsn> {
        self.registry.lock().snapshots.iter().next().map(|(lsn, _)| *lsn)
    }

    /// No version newer than this is needed by anyone but its own chain head
    pub fn watermark(&self) -> Lsn {
        let registry = self.registry.lock();
        registry
            .snapshots
            .iter()
            .next()
            .map(|(lsn, _)| *lsn)
            .unwrap_or_else(|| self.horizon(&registry))
    }

    /// Holds off commits while held
    pub(crate) fn commit_barrier(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    pub fn next_txn_id(&self) -> TxnId {
        TxnId(self.next_txn_id.load(Ordering::SeqCst))
    }

    /// Value of `key` as of `snapshot`
    pub(crate) fn read(&self, snapshot: Lsn, key: &[u8]) -> Result<Option<Bytes>> {
        if let Some(chain) = self.versions.get(key) {
            return Ok(visible_value(&chain, snapshot));
        }

        drop(self.pool.pin(self.pool.page_for(key))?);
        // Holding the shard keeps a commit from creating the chain and
        // changing the key's cells during the page reads
        let shard = self.versions.shard(key).read();
        if let Some(chain) = shard.get(key).cloned() {
            drop(shard);
            return Ok(visible_value(&chain, snapshot));
        }
        let value = read_value(&self.layout, &mut &*self.pool, key)?;
        drop(shard);
        Ok(value.map(Bytes::from))
    }

    /// Reject keys no page could hold
    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        self.layout.check_key(key)
    }

    pub(crate) fn end_snapshot(&self, txn_id: TxnId, start_lsn: Lsn) {
        self.registry.lock().snapshots.remove(&(start_lsn, txn_id));
    }

    /// Discard a transaction's writes
    pub(crate) fn abort_writes(&self, txn_id: TxnId, start_lsn: Lsn, had_writes: bool) -> Result<()> {
        self.end_snapshot(txn_id, start_lsn);
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        if had_writes {
            self.wal.append(txn_id, &RecordKind::Abort)?;
        }
        debug!(txn = %txn_id, "transaction aborted");
        Ok(())
    }

    /// Commit a write set, returning its commit LSN
    pub(crate) fn commit_writes(
        &self,
        txn_id: TxnId,
        start_lsn: Lsn,
        writes: BTreeMap<Vec<u8>, Option<Bytes>>,
    ) -> Result<Lsn> {
        let result = self.commit_inner(txn_id, start_lsn, writes);
        self.end_snapshot(txn_id, start_lsn);
        match &result {
            Ok(_) => {
                self.counters.committed.fetch_add(1, Ordering::Relaxed);
            }
            Err(TideError::Conflict { .. }) => {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                self.counters.aborted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.aborted.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn commit_inner(
        &self,
        txn_id: TxnId,
        start_lsn: Lsn,
        writes: BTreeMap<Vec<u8>, Option<Bytes>>,
    ) -> Result<Lsn> {
        if writes.is_empty() {
            return Ok(start_lsn);
        }

        // Loading a head page may do I/O, so heads are warmed before the
        // commit lock. Overflow pages are loaded under it.
        let heads: BTreeSet<PageId> = writes.keys().map(|k| self.pool.page_for(k)).collect();
        for head in heads {
            drop(self.pool.pin(head)?);
        }

        let commit = self.commit_lock.lock();
        let mut editor = ChainEditor::new(self.layout, &*self.pool);

        // First committer wins. Nothing is logged before this passes.
        let mut chains: Vec<SharedChain> = Vec::with_capacity(writes.len());
        for key in writes.keys() {
            let chain = self
                .versions
                .get_or_create(key, || Ok(editor.read_value(key)?.map(Bytes::from)))?;
            let newest = chain.read().head().map(|v| v.commit_lsn);
            if let Some(newest) = newest.filter(|lsn| *lsn > start_lsn) {
                drop(commit);
                debug!(txn = %txn_id, start_lsn = %start_lsn, newer = %newest, "write-write conflict");
                return Err(TideError::Conflict {
                    txn_id,
                    key: key.clone(),
                });
            }
            chains.push(chain);
        }

        // Cells are planned on page copies, so an I/O error leaves no trace
        for (key, value) in &writes {
            editor.write_value(key, value.as_deref())?;
        }
        let (pages, changes) = editor.finish();

        let begin_lsn = self.wal.append(txn_id, &RecordKind::Begin)?;
        let mut undo = Vec::with_capacity(changes.len());
        let mut page_lsns: BTreeMap<PageId, (Lsn, Lsn)> = BTreeMap::new();
        for change in changes {
            let kind = RecordKind::Update {
                page_id: change.page_id,
                key: change.cell.clone(),
                before: change.before.clone(),
                after: change.after,
            };
            let lsn = match self.wal.append(txn_id, &kind) {
                Ok(lsn) => lsn,
                Err(e) => {
                    // Nothing is installed yet
                    self.registry.lock().unsealed.push(Unsealed {
                        txn_id,
                        begin_lsn,
                        undo,
                    });
                    return Err(e);
                }
            };
            page_lsns
                .entry(change.page_id)
                .and_modify(|(_, last)| *last = lsn)
                .or_insert((lsn, lsn));
            undo.push(UndoEntry {
                page_id: change.page_id,
                key: change.cell,
                before: change.before,
                lsn,
            });
        }

        if let Err(e) = self.install(pages, &page_lsns) {
            error!(txn = %txn_id, error = %e, "could not install commit pages");
            self.abandon(txn_id, begin_lsn, undo);
            return Err(e);
        }

        let keys: Vec<Vec<u8>> = writes.keys().cloned().collect();
        let commit_lsn = {
            let mut registry = self.registry.lock();
            match self.wal.append(txn_id, &RecordKind::Commit) {
                Ok(lsn) => {
                    // A peer may publish this entry as soon as the registry
                    // lock drops, so the versions go in first
                    for (chain, value) in chains.iter().zip(writes.values()) {
                        chain.write().push(VersionedRecord {
                            commit_lsn: lsn,
                            txn_id,
                            state: VersionState::Pending,
                            value: value.clone(),
                            prev: None,
                        });
                    }
                    registry.in_flight.insert(
                        lsn,
                        InFlight {
                            txn_id,
                            first_lsn: begin_lsn,
                            undo,
                            keys: keys.clone(),
                        },
                    );
                    lsn
                }
                Err(e) => {
                    drop(registry);
                    self.abandon(txn_id, begin_lsn, undo);
                    return Err(e);
                }
            }
        };

        drop(commit);

        let flushed = self.wal.flush_through(commit_lsn);
        if let Err(e) = &flushed {
            error!(txn = %txn_id, commit_lsn = %commit_lsn, error = %e, "commit flush failed");
            let _commit = self.commit_lock.lock();
            let mut registry = self.registry.lock();
            let durable = self.wal.durable_lsn();
            self.roll_back_beyond(&mut registry, durable);
        }

        if !self.publish(commit_lsn) {
            return Err(match flushed {
                Err(e) => e,
                Ok(()) => TideError::WalFailed(format!(
                    "commit record {} was lost to a WAL fault",
                    commit_lsn
                )),
            });
        }

        debug!(txn = %txn_id, commit_lsn = %commit_lsn, keys = keys.len(), "transaction committed");
        self.notify(CommitNotification {
            txn_id,
            commit_lsn,
            keys,
        });
        Ok(commit_lsn)
    }

    /// Swap the planned copies into the pool, one pin at a time
    fn install(&self, pages: BTreeMap<PageId, Page>, page_lsns: &BTreeMap<PageId, (Lsn, Lsn)>) -> Result<()> {
        for (page_id, mut page) in pages {
            let Some(&(first, last)) = page_lsns.get(&page_id) else {
                continue;
            };
            let mut handle = self.pool.pin(page_id)?;
            page.set_page_lsn(last);
            *handle.write() = page;
            handle.mark_dirty(first);
        }
        Ok(())
    }

    /// Put back the before-images of a commit that never logged its
    /// `Commit`, and leave its records for `clear_wal_fault` to seal
    fn abandon(&self, txn_id: TxnId, begin_lsn: Lsn, undo: Vec<UndoEntry>) {
        for entry in undo.iter().rev() {
            if let Err(e) = self.restore_in_memory(entry) {
                error!(txn = %txn_id, page = %entry.page_id, error = %e, "could not restore page of abandoned commit");
            }
        }
        self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
        self.registry.lock().unsealed.push(Unsealed {
            txn_id,
            begin_lsn,
            undo,
        });
    }

    /// Publish every in-flight commit the WAL has made durable, oldest first
    ///
    /// Returns whether `commit_lsn` is published, by this call or by a peer
    /// that got there first.
    fn publish(&self, commit_lsn: Lsn) -> bool {
        let mut registry = self.registry.lock();
        let durable = self.wal.durable_lsn();
        let ready: Vec<Lsn> = registry
            .in_flight
            .range(..=durable)
            .map(|(lsn, _)| *lsn)
            .collect();

        let mut published = false;
        for lsn in ready {
            let Some(entry) = registry.in_flight.remove(&lsn) else {
                continue;
            };
            for key in &entry.keys {
                if let Some(chain) = self.versions.get(key) {
                    chain.write().commit(entry.txn_id, lsn);
                }
            }
            if lsn == commit_lsn {
                published = true;
            } else {
                registry.published_by_peer.insert(lsn);
            }
        }
        published || registry.published_by_peer.remove(&commit_lsn)
    }

    /// Undo every in-flight commit above `durable`, newest first
    ///
    /// Pages get their before-images back in memory and pending versions are
    /// unlinked. The logged records stay behind as unsealed until
    /// `clear_wal_fault` compensates them.
    fn roll_back_beyond(&self, registry: &mut Registry, durable: Lsn) -> usize {
        let doomed: Vec<Lsn> = registry
            .in_flight
            .range(durable.next()..)
            .map(|(lsn, _)| *lsn)
            .rev()
            .collect();

        for commit_lsn in &doomed {
            let Some(entry) = registry.in_flight.remove(commit_lsn) else {
                continue;
            };
            for undo in entry.undo.iter().rev() {
                if let Err(e) = self.restore_in_memory(undo) {
                    error!(txn = %entry.txn_id, page = %undo.page_id, error = %e, "rollback could not restore page");
                }
            }
            for key in &entry.keys {
                if let Some(chain) = self.versions.get(key) {
                    chain.write().unlink_pending(entry.txn_id, *commit_lsn);
                }
            }
            warn!(txn = %entry.txn_id, commit_lsn = %commit_lsn, "rolled back commit that never became durable");
            self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
            registry.unsealed.push(Unsealed {
                txn_id: entry.txn_id,
                begin_lsn: entry.first_lsn,
                undo: entry.undo,
            });
        }
        doomed.len()
    }

    fn restore_in_memory(&self, undo: &UndoEntry) -> Result<()> {
        let mut handle = self.pool.pin(undo.page_id)?;
        let mut page = handle.write();
        let lsn = page.page_lsn();
        page.apply(&undo.key, undo.before.as_deref(), lsn)?;
        Ok(())
    }

    /// Recover from a latched WAL write fault
    ///
    /// Rolls back whatever is still in flight, truncates the log tail, then
    /// compensates and aborts every rolled-back transaction whose records
    /// reached disk. Returns the number of transactions sealed.
    pub fn clear_wal_fault(&self) -> Result<usize> {
        let _commit = self.commit_lock.lock();
        let unsealed = {
            let mut registry = self.registry.lock();
            let durable = self.wal.durable_lsn();
            self.roll_back_beyond(&mut registry, durable);
            std::mem::take(&mut registry.unsealed)
        };

        self.wal.clear_fault()?;
        let durable = self.wal.durable_lsn();

        let mut sealed = 0;
        let mut last = None;
        let mut pending = unsealed.into_iter();
        while let Some(txn) = pending.next() {
            match self.seal(&txn, durable) {
                Ok(lsn) => {
                    sealed += 1;
                    last = lsn.or(last);
                }
                Err(e) => {
                    let mut registry = self.registry.lock();
                    registry.unsealed.push(txn);
                    registry.unsealed.extend(pending);
                    return Err(e);
                }
            }
        }
        if let Some(lsn) = last {
            self.wal.flush_through(lsn)?;
        }
        info!(sealed, durable_lsn = %durable, "WAL fault cleared");
        Ok(sealed)
    }

    /// Compensate the durable updates of `txn` and log its abort if its
    /// `Begin` reached disk
    fn seal(&self, txn: &Unsealed, durable: Lsn) -> Result<Option<Lsn>> {
        let mut last = None;
        for undo in txn.undo.iter().rev().filter(|u| u.lsn <= durable) {
            let lsn = self.wal.append(
                txn.txn_id,
                &RecordKind::Compensation {
                    page_id: undo.page_id,
                    key: undo.key.clone(),
                    image: undo.before.clone(),
                    undoes: undo.lsn,
                },
            )?;
            let mut handle = self.pool.pin(undo.page_id)?;
            handle.write().apply(&undo.key, undo.before.as_deref(), lsn)?;
            handle.mark_dirty(lsn);
            last = Some(lsn);
        }
        if txn.begin_lsn <= durable {
            last = Some(self.wal.append(txn.txn_id, &RecordKind::Abort)?);
        }
        Ok(last)
    }

    /// Receive a notification for every commit from now on
    pub fn subscribe(&self) -> Receiver<CommitNotification> {
        let (tx, rx) = channel::bounded(self.notification_capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    fn notify(&self, notification: CommitNotification) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(notification.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters
                    .dropped_notifications
                    .fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn stats(&self) -> TxnStats {
        let registry = self.registry.lock();
        TxnStats {
            active: registry.snapshots.len(),
            in_flight: registry.in_flight.len(),
            unsealed: registry.unsealed.len(),
            started: self.counters.started.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            rolled_back: self.counters.rolled_back.load(Ordering::Relaxed),
            dropped_notifications: self.counters.dropped_notifications.load(Ordering::Relaxed),
        }
    }
}

fn visible_value(chain: &SharedChain, snapshot: Lsn) -> Option<Bytes> {
    chain.read().visible(snapshot).and_then(|v| v.value.clone())
}

impl ActiveTransactionSource for TransactionManager {
    fn checkpoint_snapshot(&self) -> CheckpointSnapshot {
        let _commit = self.commit_lock.lock();
        let registry = self.registry.lock();
        let mut active_txns: Vec<ActiveTxn> = registry
            .in_flight
            .values()
            .map(|t| ActiveTxn {
                txn_id: t.txn_id,
                first_lsn: t.first_lsn,
            })
            .chain(registry.unsealed.iter().map(|t| ActiveTxn {
                txn_id: t.txn_id,
                first_lsn: t.begin_lsn,
            }))
            .collect();
        active_txns.sort_by_key(|t| t.first_lsn);
        CheckpointSnapshot {
            checkpoint_lsn: self.wal.last_lsn(),
            active_txns,
            next_txn_id: self.next_txn_id(),
        }
    }
}
