//! # TideKV
//!
//! The durability and concurrency core of an embeddable transactional
//! key-value engine:
//! - Segmented Write-Ahead Log (WAL) with group commit
//! - Page buffer pool with LRU eviction and write-ahead ordering
//! - Hash buckets with overflow page chains, so values of any size fit
//! - Fuzzy checkpoints and ARIES-style crash recovery
//! - MVCC snapshot isolation with first-committer-wins
//! - Version garbage collection coordinated with active snapshots
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                 Transaction Manager                          │
//! │        (snapshots, commit pipeline, version chains)          │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │                                  │
//!            ▼                                  ▼
//!   ┌─────────────────┐                ┌─────────────────┐
//!   │       WAL       │◄── flush ──────│   Buffer Pool   │
//!   │ (group commit)  │   through      │  (pages.db)     │
//!   └─────────────────┘                └─────────────────┘
//!            ▲                                  ▲
//!            └──────── Checkpointer ────────────┘
//!                        Recovery
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod lsn;

pub mod wal;
pub mod buffer;
pub mod txn;
pub mod checkpoint;
pub mod recovery;
pub mod gc;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, TideError};
pub use config::{Config, WalSyncStrategy};
pub use engine::{Engine, EngineStats};
pub use lsn::{Lsn, PageId, TxnId};
pub use txn::{CommitNotification, Transaction, TxnState};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of TideKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
