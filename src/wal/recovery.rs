//! WAL Recovery
//!
//! Reads every segment in LSN order and decides where the valid log ends.
//!
//! A bad frame in the newest segment is a torn tail from a crash mid-write:
//! the log ends at the last good record and the tail is cut off. A bad frame
//! anywhere in a sealed segment means data that was once durable is gone,
//! which is fatal.

use std::fs::OpenOptions;
use std::path::Path;

use tracing::{info, warn};

use super::reader::WalReader;
use super::record::WalRecord;
use super::segment::{self, SegmentInfo};
use crate::error::{Result, TideError};
use crate::lsn::Lsn;

/// Handles WAL recovery after crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of records successfully recovered
    pub entries_recovered: u64,

    /// Number of corrupt frames found at the tail
    pub entries_corrupted: u64,

    /// Last valid LSN (`Lsn::ZERO` for an empty log)
    pub last_lsn: Lsn,

    /// Whether a torn tail was found (and, for `recover`, removed)
    pub was_truncated: bool,

    /// Number of segment files holding valid records
    pub segments: usize,
}

impl WalRecovery {
    /// Recover records from the WAL directory
    ///
    /// This will:
    /// 1. Read all segments in start-LSN order
    /// 2. Stop at the first bad frame of the newest segment
    /// 3. Truncate that segment to its last good record
    /// 4. Return all valid records in order
    pub fn recover(dir: &Path) -> Result<(Vec<WalRecord>, RecoveryResult)> {
        let (records, result) = Self::read(dir, true)?;
        info!(
            records = result.entries_recovered,
            segments = result.segments,
            last_lsn = %result.last_lsn,
            truncated = result.was_truncated,
            "WAL recovered"
        );
        Ok((records, result))
    }

    /// Verify integrity of the WAL without modifying it
    pub fn verify(dir: &Path) -> Result<RecoveryResult> {
        Self::read(dir, false).map(|(_, result)| result)
    }

    /// Read every valid record without modifying anything on disk
    pub fn scan(dir: &Path) -> Result<(Vec<WalRecord>, RecoveryResult)> {
        Self::read(dir, false)
    }

    fn read(dir: &Path, repair: bool) -> Result<(Vec<WalRecord>, RecoveryResult)> {
        let segments = segment::list_segments(dir)?;
        let mut records = Vec::new();
        let mut result = RecoveryResult::default();

        for (i, info) in segments.iter().enumerate() {
            let newest = i + 1 == segments.len();

            let mut reader = match WalReader::open(&info.path) {
                Ok(reader) => reader,
                Err(TideError::WalCorruption(msg)) if newest => {
                    // Crashed while creating the segment
                    warn!(segment = %info.path.display(), reason = %msg, "torn WAL segment header");
                    result.entries_corrupted += 1;
                    result.was_truncated = true;
                    if repair {
                        std::fs::remove_file(&info.path)?;
                        segment::sync_dir(dir)?;
                    }
                    continue;
                }
                Err(TideError::WalCorruption(msg)) => return Err(sealed_corruption(info, &msg)),
                Err(e) => return Err(e),
            };

            if reader.start_lsn() != info.start_lsn {
                return Err(sealed_corruption(info, "header start LSN does not match file name"));
            }
            result.segments += 1;

            loop {
                match reader.next_record() {
                    Ok(Some(record)) => {
                        if record.lsn <= result.last_lsn || record.lsn < info.start_lsn {
                            return Err(sealed_corruption(
                                info,
                                &format!("lsn {} out of order after {}", record.lsn, result.last_lsn),
                            ));
                        }
                        result.last_lsn = record.lsn;
                        result.entries_recovered += 1;
                        records.push(record);
                    }
                    Ok(None) => break,
                    Err(TideError::WalCorruption(msg)) if newest => {
                        warn!(
                            segment = %info.path.display(),
                            valid_up_to = reader.valid_up_to(),
                            file_len = reader.file_len(),
                            reason = %msg,
                            "torn WAL tail"
                        );
                        result.entries_corrupted += 1;
                        result.was_truncated = true;
                        if repair {
                            truncate_segment(info, reader.valid_up_to())?;
                        }
                        break;
                    }
                    Err(TideError::WalCorruption(msg)) => return Err(sealed_corruption(info, &msg)),
                    Err(e) => return Err(e),
                }
            }
        }

        Ok((records, result))
    }
}

fn sealed_corruption(info: &SegmentInfo, reason: &str) -> TideError {
    TideError::WalCorruption(format!("segment {}: {}", info.path.display(), reason))
}

fn truncate_segment(info: &SegmentInfo, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(&info.path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}
