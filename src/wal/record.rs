//! WAL record definitions
//!
//! Defines the structure of individual log records and their framed,
//! checksummed on-disk encoding.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TideError};
use crate::lsn::{Lsn, PageId, TxnId};

/// Frame header: LSN (8) + CRC (4) + body length (4)
pub const HEADER_SIZE: usize = 16;

/// Upper bound on a single record body; larger lengths mean a torn header.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// A single record in the WAL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Log Sequence Number - strictly increasing across the whole log
    pub lsn: Lsn,

    /// Transaction that produced the record (`TxnId(0)` for system records)
    pub txn_id: TxnId,

    /// What the record describes
    pub kind: RecordKind,
}

/// Record types that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    /// First record of a transaction's commit group
    Begin,

    /// Change one cell on one page. `after = None` removes the cell,
    /// `before = None` means it was absent. Cells are page keys: a part of
    /// a stored value or a bucket's chain link.
    Update {
        page_id: PageId,
        key: Vec<u8>,
        before: Option<Vec<u8>>,
        after: Option<Vec<u8>>,
    },

    /// Redo-only record written while rolling back `undoes`
    Compensation {
        page_id: PageId,
        key: Vec<u8>,
        image: Option<Vec<u8>>,
        undoes: Lsn,
    },

    /// The transaction is committed once this record is durable
    Commit,

    /// The transaction has no effect
    Abort,

    /// Fuzzy checkpoint marker
    Checkpoint(CheckpointData),
}

/// Payload of a checkpoint record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointData {
    /// Every page change with an LSN at or below this was flushed or is
    /// covered by `redo_lsn`
    pub checkpoint_lsn: Lsn,

    /// Lowest LSN recovery may need; older segments can be deleted
    pub redo_lsn: Lsn,

    /// Transactions with logged records but no durable outcome yet
    pub active_txns: Vec<ActiveTxn>,

    /// Next transaction id to hand out after a restart
    pub next_txn_id: TxnId,

    /// Next LSN to hand out after a restart
    pub next_lsn: Lsn,

    /// Wall-clock time the checkpoint was taken (unix millis)
    pub timestamp: u64,
}

/// A transaction still in flight when a checkpoint was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTxn {
    pub txn_id: TxnId,
    pub first_lsn: Lsn,
}

impl RecordKind {
    /// Page touched by this record, if any
    pub fn page_id(&self) -> Option<PageId> {
        match self {
            RecordKind::Update { page_id, .. } | RecordKind::Compensation { page_id, .. } => {
                Some(*page_id)
            }
            _ => None,
        }
    }

    /// Short name used in logs and the CLI
    pub fn name(&self) -> &'static str {
        match self {
            RecordKind::Begin => "begin",
            RecordKind::Update { .. } => "update",
            RecordKind::Compensation { .. } => "compensation",
            RecordKind::Commit => "commit",
            RecordKind::Abort => "abort",
            RecordKind::Checkpoint(_) => "checkpoint",
        }
    }
}

impl WalRecord {
    /// Create a new record
    pub fn new(lsn: Lsn, txn_id: TxnId, kind: RecordKind) -> Self {
        Self { lsn, txn_id, kind }
    }

    /// Encode the LSN-independent part of a record
    pub fn encode_body(txn_id: TxnId, kind: &RecordKind) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(txn_id, kind))?)
    }

    /// Frame an encoded body: `[lsn][crc][len][body]`
    pub fn frame(lsn: Lsn, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
        buf.extend_from_slice(&lsn.0.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(body);

        let crc = frame_crc(&buf);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Serialize the record into its on-disk frame
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let body = Self::encode_body(self.txn_id, &self.kind)?;
        Ok(Self::frame(self.lsn, &body))
    }

    /// Deserialize one frame from the start of `bytes`
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Self::decode_prefix(bytes).map(|(record, _)| record)
    }

    /// Decode one frame from the start of `bytes`, returning it and the
    /// number of bytes consumed
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < HEADER_SIZE {
            return Err(TideError::WalCorruption(format!(
                "truncated header: {} bytes",
                bytes.len()
            )));
        }

        let lsn = Lsn(le_u64(&bytes[0..8]));
        let stored_crc = le_u32(&bytes[8..12]);
        let len = le_u32(&bytes[12..16]) as usize;

        if len > MAX_BODY_SIZE {
            return Err(TideError::WalCorruption(format!(
                "record at lsn {} claims {} byte body",
                lsn, len
            )));
        }
        let total = HEADER_SIZE + len;
        if bytes.len() < total {
            return Err(TideError::WalCorruption(format!(
                "truncated body at lsn {}: need {} bytes, have {}",
                lsn,
                total,
                bytes.len()
            )));
        }

        let frame = &bytes[..total];
        let crc = frame_crc(frame);
        if crc != stored_crc {
            return Err(TideError::WalCorruption(format!(
                "checksum mismatch at lsn {}: stored {:#010x}, computed {:#010x}",
                lsn, stored_crc, crc
            )));
        }

        let (txn_id, kind): (TxnId, RecordKind) = bincode::deserialize(&frame[HEADER_SIZE..])
            .map_err(|e| TideError::WalCorruption(format!("undecodable body at lsn {}: {}", lsn, e)))?;

        Ok((Self { lsn, txn_id, kind }, total))
    }

    /// Size of this record once framed
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(HEADER_SIZE + Self::encode_body(self.txn_id, &self.kind)?.len())
    }
}

pub(crate) fn le_u64(b: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[..8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn le_u32(b: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&b[..4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn le_u16(b: &[u8]) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&b[..2]);
    u16::from_le_bytes(raw)
}

/// CRC over the whole frame with the CRC field itself skipped
fn frame_crc(frame: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&frame[0..8]);
    hasher.update(&frame[12..]);
    hasher.finalize()
}
