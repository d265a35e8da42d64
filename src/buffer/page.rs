//! Slotted key/value pages
//!
//! ## Layout
//! ```text
//! ┌──────────────┬─────────┬─────────────────┬──────────────┐
//! │ page_lsn (8) │ CRC (4) │ entry_count (2) │ reserved (2) │
//! ├──────────────┴─────────┴─────────────────┴──────────────┤
//! │ [key_len u16][val_len u32][key][value]  ... sorted       │
//! ├──────────────────────────────────────────────────────────┤
//! │ zero fill                                                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The CRC covers everything except its own four bytes. An all-zero slot is
//! an empty page that was never written.

use std::collections::BTreeMap;

use crate::error::{Result, TideError};
use crate::lsn::{Lsn, PageId};
use crate::wal::{le_u16, le_u32, le_u64};

pub const PAGE_HEADER_SIZE: usize = 16;
const ENTRY_HEADER_SIZE: usize = 6;

/// In-memory image of one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    id: PageId,
    size: usize,
    page_lsn: Lsn,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Encoded size of all entries
    used: usize,
}

pub(crate) fn entry_size(key: &[u8], value: &[u8]) -> usize {
    ENTRY_HEADER_SIZE + key.len() + value.len()
}

impl Page {
    pub fn new(id: PageId, size: usize) -> Self {
        Self {
            id,
            size,
            page_lsn: Lsn::ZERO,
            entries: BTreeMap::new(),
            used: 0,
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// LSN of the last change applied to this page
    pub fn page_lsn(&self) -> Lsn {
        self.page_lsn
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn free_space(&self) -> usize {
        self.size - PAGE_HEADER_SIZE - self.used
    }

    /// Value bytes a new entry for `key` could carry
    pub fn room_for(&self, key: &[u8]) -> usize {
        self.free_space()
            .saturating_sub(ENTRY_HEADER_SIZE + key.len())
    }

    /// Whether setting `key` to `value` would still fit
    pub fn fits(&self, key: &[u8], value: Option<&[u8]>) -> bool {
        self.used_after(key, value)
            .map_or(false, |used| used <= self.size - PAGE_HEADER_SIZE)
    }

    fn used_after(&self, key: &[u8], value: Option<&[u8]>) -> Option<usize> {
        if key.len() > u16::MAX as usize {
            return None;
        }
        let old = self.entries.get(key).map_or(0, |v| entry_size(key, v));
        let new = value.map_or(0, |v| entry_size(key, v));
        Some(self.used - old + new)
    }

    /// Set (`Some`) or remove (`None`) a key and stamp the page with `lsn`
    ///
    /// Returns the previous value. Fails with `PageFull` and leaves the page
    /// untouched when the result would not fit.
    pub fn apply(&mut self, key: &[u8], value: Option<&[u8]>, lsn: Lsn) -> Result<Option<Vec<u8>>> {
        if !self.fits(key, value) {
            return Err(TideError::PageFull(self.id));
        }
        let previous = match value {
            Some(v) => {
                self.used += entry_size(key, v);
                self.entries.insert(key.to_vec(), v.to_vec())
            }
            None => self.entries.remove(key),
        };
        if let Some(old) = &previous {
            self.used -= entry_size(key, old);
        }
        self.page_lsn = lsn;
        Ok(previous)
    }

    /// Stamp without changing content
    pub fn set_page_lsn(&mut self, lsn: Lsn) {
        self.page_lsn = lsn;
    }

    /// Encode into exactly `size` bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size];
        buf[0..8].copy_from_slice(&self.page_lsn.0.to_le_bytes());
        buf[12..14].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());

        let mut pos = PAGE_HEADER_SIZE;
        for (key, value) in &self.entries {
            buf[pos..pos + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
            buf[pos + 2..pos + 6].copy_from_slice(&(value.len() as u32).to_le_bytes());
            pos += ENTRY_HEADER_SIZE;
            buf[pos..pos + key.len()].copy_from_slice(key);
            pos += key.len();
            buf[pos..pos + value.len()].copy_from_slice(value);
            pos += value.len();
        }

        let crc = page_crc(&buf);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode a page image read from the store
    pub fn decode(id: PageId, bytes: &[u8]) -> Result<Self> {
        let size = bytes.len();
        if size < PAGE_HEADER_SIZE {
            return Err(TideError::Corruption(format!("page {} image is {} bytes", id, size)));
        }
        if bytes.iter().all(|&b| b == 0) {
            return Ok(Self::new(id, size));
        }

        let stored_crc = le_u32(&bytes[8..12]);
        if page_crc(bytes) != stored_crc {
            return Err(TideError::Corruption(format!("page {} checksum mismatch", id)));
        }

        let mut page = Self::new(id, size);
        page.page_lsn = Lsn(le_u64(&bytes[0..8]));
        let count = le_u16(&bytes[12..14]) as usize;

        let mut pos = PAGE_HEADER_SIZE;
        for _ in 0..count {
            if pos + ENTRY_HEADER_SIZE > size {
                return Err(TideError::Corruption(format!("page {} entry header out of bounds", id)));
            }
            let key_len = le_u16(&bytes[pos..pos + 2]) as usize;
            let val_len = le_u32(&bytes[pos + 2..pos + 6]) as usize;
            pos += ENTRY_HEADER_SIZE;
            if pos + key_len + val_len > size {
                return Err(TideError::Corruption(format!("page {} entry out of bounds", id)));
            }
            let key = bytes[pos..pos + key_len].to_vec();
            pos += key_len;
            let value = bytes[pos..pos + val_len].to_vec();
            pos += val_len;

            page.used += entry_size(&key, &value);
            if page.entries.insert(key, value).is_some() {
                return Err(TideError::Corruption(format!("page {} has a duplicate key", id)));
            }
        }
        Ok(page)
    }
}

fn page_crc(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[0..8]);
    hasher.update(&bytes[12..]);
    hasher.finalize()
}
