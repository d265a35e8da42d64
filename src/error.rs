//! Error types for TideKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

use crate::lsn::{PageId, TxnId};

/// Result type alias using TideError
pub type Result<T> = std::result::Result<T, TideError>;

/// Unified error type for TideKV operations
#[derive(Debug, Error)]
pub enum TideError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    #[error("WAL writer failed: {0}")]
    WalFailed(String),

    // -------------------------------------------------------------------------
    // Page / Buffer Pool Errors
    // -------------------------------------------------------------------------
    #[error("Page corruption detected: {0}")]
    Corruption(String),

    #[error("Page {0} not found")]
    PageNotFound(PageId),

    #[error("Page {0} has no room for the update")]
    PageFull(PageId),

    #[error("Buffer pool exhausted: every frame is pinned")]
    PoolExhausted,

    #[error("Durability fault: {0}")]
    DurabilityFault(String),

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    #[error("Write-write conflict on transaction {txn_id} (key {key:?})")]
    Conflict { txn_id: TxnId, key: Vec<u8> },

    #[error("Transaction {0} is no longer active")]
    TransactionClosed(TxnId),

    #[error("Key of {len} bytes exceeds the limit of {max}")]
    KeyTooLarge { len: usize, max: usize },

    // -------------------------------------------------------------------------
    // Startup Errors
    // -------------------------------------------------------------------------
    #[error("Unrecoverable storage: {0}")]
    UnrecoverableStorage(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TideError {
    /// Conflicts and momentary pool exhaustion are resolved by retrying the
    /// whole transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TideError::Conflict { .. } | TideError::PoolExhausted)
    }

    /// Errors that threaten the write-ahead invariant or the on-disk state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TideError::UnrecoverableStorage(_)
                | TideError::DurabilityFault(_)
                | TideError::Corruption(_)
                | TideError::WalCorruption(_)
        )
    }

    /// Errors travel through reply channels to several waiters at once.
    pub(crate) fn duplicate(&self) -> TideError {
        match self {
            TideError::Io(e) => TideError::Io(std::io::Error::new(e.kind(), e.to_string())),
            TideError::WalCorruption(m) => TideError::WalCorruption(m.clone()),
            TideError::WalFailed(m) => TideError::WalFailed(m.clone()),
            TideError::Corruption(m) => TideError::Corruption(m.clone()),
            TideError::PageNotFound(id) => TideError::PageNotFound(*id),
            TideError::PageFull(id) => TideError::PageFull(*id),
            TideError::PoolExhausted => TideError::PoolExhausted,
            TideError::DurabilityFault(m) => TideError::DurabilityFault(m.clone()),
            TideError::Conflict { txn_id, key } => TideError::Conflict {
                txn_id: *txn_id,
                key: key.clone(),
            },
            TideError::TransactionClosed(id) => TideError::TransactionClosed(*id),
            TideError::KeyTooLarge { len, max } => TideError::KeyTooLarge {
                len: *len,
                max: *max,
            },
            TideError::UnrecoverableStorage(m) => TideError::UnrecoverableStorage(m.clone()),
            TideError::Serialization(m) => TideError::Serialization(m.clone()),
            TideError::Config(m) => TideError::Config(m.clone()),
        }
    }
}

impl From<bincode::Error> for TideError {
    fn from(e: bincode::Error) -> Self {
        TideError::Serialization(e.to_string())
    }
}
