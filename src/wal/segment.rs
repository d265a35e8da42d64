//! WAL segment files
//!
//! Each segment is named by the LSN of its first record and starts with a
//! small fixed header:
//!
//! ```text
//! ┌──────────┬─────────────┬──────────────┬───────────────┐
//! │ "TKVW"   │ version (2) │ reserved (2) │ start_lsn (8) │
//! └──────────┴─────────────┴──────────────┴───────────────┘
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::record::{le_u16, le_u64};
use crate::error::{Result, TideError};
use crate::lsn::Lsn;

pub const SEGMENT_MAGIC: &[u8; 4] = b"TKVW";
pub const SEGMENT_VERSION: u16 = 1;
pub const SEGMENT_HEADER_SIZE: u64 = 16;

const SEGMENT_SUFFIX: &str = ".wal";

/// A segment file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub start_lsn: Lsn,
    pub path: PathBuf,
}

pub fn segment_file_name(start_lsn: Lsn) -> String {
    format!("{:020}{}", start_lsn.0, SEGMENT_SUFFIX)
}

/// Parse `00000000000000000042.wal` into `Lsn(42)`
pub fn parse_segment_name(name: &str) -> Option<Lsn> {
    let digits = name.strip_suffix(SEGMENT_SUFFIX)?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(Lsn)
}

/// All segments in `dir`, oldest first. A missing directory has none.
pub fn list_segments(dir: &Path) -> Result<Vec<SegmentInfo>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(start_lsn) = parse_segment_name(&name.to_string_lossy()) {
            segments.push(SegmentInfo {
                start_lsn,
                path: entry.path(),
            });
        }
    }
    segments.sort_by_key(|s| s.start_lsn);
    Ok(segments)
}

pub fn encode_header(start_lsn: Lsn) -> [u8; SEGMENT_HEADER_SIZE as usize] {
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    header[0..4].copy_from_slice(SEGMENT_MAGIC);
    header[4..6].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&start_lsn.0.to_le_bytes());
    header
}

/// Validate a segment header and return its start LSN
pub fn decode_header(bytes: &[u8]) -> Result<Lsn> {
    if bytes.len() < SEGMENT_HEADER_SIZE as usize {
        return Err(TideError::WalCorruption(format!(
            "segment header truncated at {} bytes",
            bytes.len()
        )));
    }
    if &bytes[0..4] != SEGMENT_MAGIC {
        return Err(TideError::WalCorruption("bad segment magic".into()));
    }
    let version = le_u16(&bytes[4..6]);
    if version != SEGMENT_VERSION {
        return Err(TideError::WalCorruption(format!(
            "unsupported segment version {}",
            version
        )));
    }
    Ok(Lsn(le_u64(&bytes[8..16])))
}

/// fsync a directory so newly created or removed entries survive a crash
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// The segment currently receiving writes. Only the flusher touches it.
#[derive(Debug)]
pub(crate) struct ActiveSegment {
    file: File,
    info: SegmentInfo,
    /// Bytes written so far, header included
    len: u64,
    /// Bytes known to be fsynced
    durable_len: u64,
}

impl ActiveSegment {
    /// Create a fresh segment whose first record will carry `start_lsn`
    pub(crate) fn create(dir: &Path, start_lsn: Lsn) -> Result<Self> {
        let path = dir.join(segment_file_name(start_lsn));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&encode_header(start_lsn))?;
        file.sync_all()?;
        sync_dir(dir)?;

        debug!(segment = %path.display(), "created WAL segment");
        Ok(Self {
            file,
            info: SegmentInfo { start_lsn, path },
            len: SEGMENT_HEADER_SIZE,
            durable_len: SEGMENT_HEADER_SIZE,
        })
    }

    /// Reopen an existing segment for append. The tail must already be clean.
    pub(crate) fn open(info: &SegmentInfo) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&info.path)?;
        let len = file.seek(SeekFrom::End(0))?;
        if len < SEGMENT_HEADER_SIZE {
            return Err(TideError::WalCorruption(format!(
                "segment {} is shorter than its header",
                info.path.display()
            )));
        }
        Ok(Self {
            file,
            info: info.clone(),
            len,
            durable_len: len,
        })
    }

    pub(crate) fn start_lsn(&self) -> Lsn {
        self.info.start_lsn
    }

    pub(crate) fn path(&self) -> &Path {
        &self.info.path
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// True when nothing but the header has been written
    pub(crate) fn is_empty(&self) -> bool {
        self.len <= SEGMENT_HEADER_SIZE
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) -> Result<()> {
        // Counted before the write so a partial write is still truncated away
        self.len += bytes.len() as u64;
        self.file.write_all(bytes)?;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.durable_len = self.len;
        Ok(())
    }

    /// Drop every byte written after the last successful sync
    pub(crate) fn truncate_to_durable(&mut self) -> Result<u64> {
        let dropped = self.len - self.durable_len;
        self.file.set_len(self.durable_len)?;
        self.file.seek(SeekFrom::Start(self.durable_len))?;
        self.file.sync_all()?;
        self.len = self.durable_len;
        Ok(dropped)
    }
}
