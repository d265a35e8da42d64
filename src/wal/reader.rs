//! WAL Reader
//!
//! Reads the records of a single segment file.

use std::fs;
use std::path::{Path, PathBuf};

use super::record::WalRecord;
use super::segment::{self, SEGMENT_HEADER_SIZE};
use crate::error::Result;
use crate::lsn::Lsn;

/// Reads records from one WAL segment
pub struct WalReader {
    path: PathBuf,
    data: Vec<u8>,
    start_lsn: Lsn,
    position: usize,
}

impl WalReader {
    /// Open a segment for reading and validate its header
    pub fn open(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let start_lsn = segment::decode_header(&data)?;
        Ok(Self {
            path: path.to_path_buf(),
            data,
            start_lsn,
            position: SEGMENT_HEADER_SIZE as usize,
        })
    }

    /// Read the next record
    ///
    /// Returns `Ok(None)` at a clean end of file. A torn or corrupt frame is
    /// an error and leaves the position at the start of that frame.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        if self.position >= self.data.len() {
            return Ok(None);
        }
        let (record, consumed) = WalRecord::decode_prefix(&self.data[self.position..])?;
        self.position += consumed;
        Ok(Some(record))
    }

    /// Iterate over records until the end or the first bad frame
    pub fn records(self) -> WalIterator {
        WalIterator {
            reader: self,
            done: false,
        }
    }

    /// Byte offset just past the last good record read so far
    pub fn valid_up_to(&self) -> u64 {
        self.position as u64
    }

    /// Total size of the segment file
    pub fn file_len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Iterator over WAL records
pub struct WalIterator {
    reader: WalReader,
    done: bool,
}

impl Iterator for WalIterator {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
