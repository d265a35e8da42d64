//! Page store
//!
//! A single file of fixed-size page slots. Slot 0 holds store metadata,
//! slots `1..=bucket_count` hold bucket head pages and overflow pages follow
//! at a stride of `bucket_count` (see `BucketLayout`).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::bucket::BucketLayout;
use super::page::Page;
use crate::error::{Result, TideError};
use crate::lsn::PageId;
use crate::wal::{le_u16, le_u32, le_u64, sync_dir};

const STORE_MAGIC: &[u8; 4] = b"TKVP";
const STORE_VERSION: u16 = 1;
const META_LEN: usize = 24;

/// Fixed-slot page file
pub struct PageStore {
    path: PathBuf,
    file: Mutex<File>,
    page_size: usize,
    bucket_count: u64,
    pristine: bool,
    #[cfg(test)]
    injected_faults: AtomicU32,
}

impl PageStore {
    /// Open `path`, creating it when missing
    ///
    /// The layout stored in an existing file wins over the requested one.
    pub fn open(path: &Path, page_size: usize, bucket_count: u64) -> Result<Self> {
        let existing_len = if path.exists() { std::fs::metadata(path)?.len() } else { 0 };
        let existing = existing_len > 0;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let (page_size, bucket_count) = if existing {
            let (stored_size, stored_buckets) = read_meta(&mut file)?;
            if stored_size != page_size || stored_buckets != bucket_count {
                warn!(
                    stored_page_size = stored_size,
                    stored_bucket_count = stored_buckets,
                    requested_page_size = page_size,
                    requested_bucket_count = bucket_count,
                    "page store layout differs from config, using stored layout"
                );
            }
            (stored_size, stored_buckets)
        } else {
            let mut meta = vec![0u8; page_size];
            meta[..META_LEN].copy_from_slice(&encode_meta(page_size, bucket_count));
            file.write_all(&meta)?;
            file.sync_all()?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                sync_dir(parent)?;
            }
            debug!(path = %path.display(), page_size, bucket_count, "created page store");
            (page_size, bucket_count)
        };

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            page_size,
            bucket_count,
            pristine: existing_len <= page_size as u64,
            #[cfg(test)]
            injected_faults: AtomicU32::new(0),
        })
    }

    /// True when no data page had ever been written at open time
    pub fn is_pristine(&self) -> bool {
        self.pristine
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    pub fn layout(&self) -> BucketLayout {
        BucketLayout::new(self.page_size, self.bucket_count)
    }

    /// Head page of the bucket that owns `key`
    pub fn bucket_for(&self, key: &[u8]) -> PageId {
        self.layout().bucket_for(key)
    }

    pub fn contains(&self, id: PageId) -> bool {
        self.layout().contains(id)
    }

    /// Read a page. Slots past the end of the file are empty pages.
    pub fn read_page(&self, id: PageId) -> Result<Page> {
        if !self.contains(id) {
            return Err(TideError::PageNotFound(id));
        }

        let offset = id.0 * self.page_size as u64;
        let mut buf = vec![0u8; self.page_size];
        {
            let mut file = self.file.lock();
            let len = file.metadata()?.len();
            if offset < len {
                file.seek(SeekFrom::Start(offset))?;
                let mut filled = 0;
                while filled < buf.len() {
                    match file.read(&mut buf[filled..])? {
                        0 => break,
                        n => filled += n,
                    }
                }
            }
        }
        Page::decode(id, &buf)
    }

    /// Write an encoded page image into its slot
    pub fn write_page(&self, id: PageId, image: &[u8]) -> Result<()> {
        if !self.contains(id) {
            return Err(TideError::PageNotFound(id));
        }
        if image.len() != self.page_size {
            return Err(TideError::Corruption(format!(
                "page {} image is {} bytes, expected {}",
                id,
                image.len(),
                self.page_size
            )));
        }
        self.check_injected_fault()?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(id.0 * self.page_size as u64))?;
        file.write_all(image)?;
        Ok(())
    }

    /// fsync the page file
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_write_faults(&self, count: u32) {
        self.injected_faults.store(count, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_injected_fault(&self) -> Result<()> {
        if self
            .injected_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TideError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected page write fault",
            )));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_injected_fault(&self) -> Result<()> {
        Ok(())
    }
}

fn encode_meta(page_size: usize, bucket_count: u64) -> [u8; META_LEN] {
    let mut meta = [0u8; META_LEN];
    meta[0..4].copy_from_slice(STORE_MAGIC);
    meta[4..6].copy_from_slice(&STORE_VERSION.to_le_bytes());
    meta[8..12].copy_from_slice(&(page_size as u32).to_le_bytes());
    meta[12..20].copy_from_slice(&bucket_count.to_le_bytes());
    let crc = crc32fast::hash(&meta[0..20]);
    meta[20..24].copy_from_slice(&crc.to_le_bytes());
    meta
}

fn read_meta(file: &mut File) -> Result<(usize, u64)> {
    let mut meta = [0u8; META_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut meta)
        .map_err(|_| TideError::Corruption("page store metadata truncated".into()))?;

    if &meta[0..4] != STORE_MAGIC {
        return Err(TideError::Corruption("page store has a bad magic".into()));
    }
    if crc32fast::hash(&meta[0..20]) != le_u32(&meta[20..24]) {
        return Err(TideError::Corruption("page store metadata checksum mismatch".into()));
    }
    let version = le_u16(&meta[4..6]);
    if version != STORE_VERSION {
        return Err(TideError::Corruption(format!(
            "unsupported page store version {}",
            version
        )));
    }

    let page_size = le_u32(&meta[8..12]) as usize;
    let bucket_count = le_u64(&meta[12..20]);
    if !page_size.is_power_of_two() || page_size < META_LEN || bucket_count == 0 {
        return Err(TideError::Corruption("page store metadata out of range".into()));
    }
    Ok((page_size, bucket_count))
}
