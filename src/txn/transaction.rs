//! Transaction handle

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use super::manager::TransactionManager;
use crate::error::{Result, TideError};
use crate::lsn::{Lsn, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committing,
    Committed,
    Aborted,
}

/// A snapshot-isolated transaction
///
/// Writes stay private until `commit`. Dropping an unfinished transaction
/// aborts it.
pub struct Transaction {
    manager: Arc<TransactionManager>,
    id: TxnId,
    start_lsn: Lsn,
    state: TxnState,
    write_set: BTreeMap<Vec<u8>, Option<Bytes>>,
    commit_lsn: Option<Lsn>,
}

impl Transaction {
    pub(crate) fn new(manager: Arc<TransactionManager>, id: TxnId, start_lsn: Lsn) -> Self {
        Self {
            manager,
            id,
            start_lsn,
            state: TxnState::Active,
            write_set: BTreeMap::new(),
            commit_lsn: None,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Snapshot this transaction reads at
    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn commit_lsn(&self) -> Option<Lsn> {
        self.commit_lsn
    }

    pub fn is_read_only(&self) -> bool {
        self.write_set.is_empty()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TxnState::Active => Ok(()),
            _ => Err(TideError::TransactionClosed(self.id)),
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.manager.check_key(key)?;
        self.write_set
            .insert(key.to_vec(), Some(Bytes::copy_from_slice(value)));
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.manager.check_key(key)?;
        self.write_set.insert(key.to_vec(), None);
        Ok(())
    }

    /// Own writes first, then the snapshot
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.ensure_active()?;
        if let Some(value) = self.write_set.get(key) {
            return Ok(value.clone());
        }
        self.manager.read(self.start_lsn, key)
    }

    /// Make the writes durable and visible, returning the commit LSN
    ///
    /// Read-only transactions return their snapshot LSN without logging.
    pub fn commit(mut self) -> Result<Lsn> {
        self.ensure_active()?;
        self.state = TxnState::Committing;
        let writes = std::mem::take(&mut self.write_set);
        match self.manager.commit_writes(self.id, self.start_lsn, writes) {
            Ok(lsn) => {
                self.state = TxnState::Committed;
                self.commit_lsn = Some(lsn);
                Ok(lsn)
            }
            Err(e) => {
                self.state = TxnState::Aborted;
                Err(e)
            }
        }
    }

    /// Discard every write
    pub fn abort(mut self) -> Result<()> {
        self.ensure_active()?;
        self.state = TxnState::Aborted;
        let had_writes = !self.write_set.is_empty();
        self.write_set.clear();
        self.manager.abort_writes(self.id, self.start_lsn, had_writes)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TxnState::Active {
            return;
        }
        self.state = TxnState::Aborted;
        let had_writes = !self.write_set.is_empty();
        if let Err(e) = self.manager.abort_writes(self.id, self.start_lsn, had_writes) {
            warn!(txn = %self.id, error = %e, "abort of dropped transaction was not logged");
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("start_lsn", &self.start_lsn)
            .field("state", &self.state)
            .field("writes", &self.write_set.len())
            .finish()
    }
}
