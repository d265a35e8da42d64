//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only, segmented logging.
//!
//! ## Responsibilities
//! - Append log records before any page mutation reaches disk
//! - Group commit: one write + fsync for many concurrent committers
//! - CRC32 checksums for torn-tail detection
//! - Segment rollover and purge behind checkpoints
//! - Crash recovery scan
//!
//! ## File Format
//! ```text
//! {wal_dir}/00000000000000000001.wal
//! ┌─────────────────────────────────────────┐
//! │ Segment header (16)                     │
//! ├─────────────────────────────────────────┤
//! │ Record 1                                │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Body   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Record 2                                │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Body   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```

mod reader;
mod record;
mod recovery;
mod segment;
mod writer;

pub use reader::{WalIterator, WalReader};
pub use record::{ActiveTxn, CheckpointData, RecordKind, WalRecord, HEADER_SIZE};
pub use recovery::{RecoveryResult, WalRecovery};
pub use segment::{list_segments, segment_file_name, SegmentInfo, SEGMENT_HEADER_SIZE};
pub use writer::{WalOptions, WalWriter};

pub(crate) use record::{le_u16, le_u32, le_u64};
pub(crate) use segment::sync_dir;
