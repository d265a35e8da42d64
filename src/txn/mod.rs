//! Transactions and MVCC
//!
//! Snapshot isolation over the page store. A transaction reads the newest
//! committed version at or below its `start_lsn` and buffers its writes until
//! commit, where the first committer on a key wins.
//!
//! ## Visibility
//! - Versions are tagged with the LSN of their `Commit` record
//! - A version is visible once it is `Committed` and `commit_lsn <= start_lsn`
//! - A key without a version chain reads straight from its page

mod manager;
mod transaction;
mod version;

pub use manager::TransactionManager;
pub use transaction::{Transaction, TxnState};
pub use version::{
    ChainIter, PruneResult, SharedChain, VersionChain, VersionId, VersionState, VersionStore,
    VersionedRecord,
};

use crate::lsn::{Lsn, TxnId};

/// Sent to subscribers after every successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNotification {
    pub txn_id: TxnId,
    pub commit_lsn: Lsn,
    pub keys: Vec<Vec<u8>>,
}

/// Transaction manager statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnStats {
    /// Registered snapshots
    pub active: usize,
    /// Commits waiting for their flush
    pub in_flight: usize,
    /// Rolled-back transactions not yet aborted on disk
    pub unsealed: usize,
    pub started: u64,
    pub committed: u64,
    pub aborted: u64,
    pub conflicts: u64,
    pub rolled_back: u64,
    pub dropped_notifications: u64,
}
