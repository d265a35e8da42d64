//! Bucket chains
//!
//! A bucket is its head page plus overflow pages at a fixed stride: position
//! `n` of the chain headed by page `b` is page `b + n * bucket_count`, so
//! overflow pages need no allocator. The head page keeps the chain length in
//! the link cell, whose key is empty.
//!
//! ## Values
//! A value is stored as one or more cells keyed `key ++ part` (part as four
//! big-endian bytes), at strictly increasing chain positions. Part 0 starts
//! with the number of parts as a little-endian `u32`.
//!
//! ```text
//! head (pos 0)            pos 1                   pos 2
//! ┌──────────────────┐    ┌──────────────────┐    ┌──────────────────┐
//! │ "" -> len = 3    │    │ k‖1 -> bytes     │    │ k‖2 -> bytes     │
//! │ k‖0 -> 3 ‖ bytes │    │ other cells      │    │                  │
//! └──────────────────┘    └──────────────────┘    └──────────────────┘
//! ```
//!
//! Every cell change is an ordinary page update, so redo and undo replay
//! chains without knowing about them.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use super::page::{entry_size, Page, PAGE_HEADER_SIZE};
use super::pool::BufferPool;
use crate::error::{Result, TideError};
use crate::lsn::PageId;
use crate::wal::{le_u32, le_u64};

/// Longest chain a bucket may grow to
pub const MAX_CHAIN_PAGES: u64 = 1 << 24;

const LINK_CELL: &[u8] = b"";
const LINK_VALUE_LEN: usize = 8;
const PART_LEN: usize = 4;
const COUNT_LEN: usize = 4;
/// Smallest piece a value too large for one page is cut into
const MIN_PIECE: usize = 256;

/// How keys map to bucket chains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketLayout {
    page_size: usize,
    bucket_count: u64,
}

impl BucketLayout {
    pub fn new(page_size: usize, bucket_count: u64) -> Self {
        Self {
            page_size,
            bucket_count,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    /// Head page of the bucket that owns `key`
    pub fn bucket_for(&self, key: &[u8]) -> PageId {
        PageId(1 + crc32fast::hash(key) as u64 % self.bucket_count)
    }

    /// Page at `position` of the chain headed by `head`
    pub fn page_at(&self, head: PageId, position: u64) -> PageId {
        PageId(head.0 + position * self.bucket_count)
    }

    /// Whether `id` is a head or overflow page
    pub fn contains(&self, id: PageId) -> bool {
        id.0 >= 1 && id.0 <= self.bucket_count.saturating_mul(MAX_CHAIN_PAGES)
    }

    /// Longest key a value may be stored under
    pub fn max_key_len(&self) -> usize {
        self.page_size / 4
    }

    pub fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.max_key_len() {
            return Err(TideError::KeyTooLarge {
                len: key.len(),
                max: self.max_key_len(),
            });
        }
        Ok(())
    }

    /// Stored bytes one cell of `key` carries on an empty overflow page
    fn piece_capacity(&self, key: &[u8]) -> usize {
        self.page_size - PAGE_HEADER_SIZE - entry_size(&cell_key(key, 0), &[])
    }
}

/// Page key of one part of the value stored under `key`
pub fn cell_key(key: &[u8], part: u32) -> Vec<u8> {
    let mut cell = Vec::with_capacity(key.len() + PART_LEN);
    cell.extend_from_slice(key);
    cell.extend_from_slice(&part.to_be_bytes());
    cell
}

/// Read access to pages by id
pub trait PageSource {
    fn with_page<R>(&mut self, id: PageId, f: impl FnOnce(&Page) -> R) -> Result<R>;
}

impl PageSource for &BufferPool {
    fn with_page<R>(&mut self, id: PageId, f: impl FnOnce(&Page) -> R) -> Result<R> {
        let handle = self.pin(id)?;
        let out = f(&handle.read());
        Ok(out)
    }
}

impl<T: PageSource> PageSource for &mut T {
    fn with_page<R>(&mut self, id: PageId, f: impl FnOnce(&Page) -> R) -> Result<R> {
        (**self).with_page(id, f)
    }
}

/// Number of pages in the chain headed by `head`
pub fn chain_len<S: PageSource>(source: &mut S, head: PageId) -> Result<u64> {
    source
        .with_page(head, |page| page.get(LINK_CELL).map(|raw| decode_link(head, raw)))?
        .unwrap_or(Ok(1))
}

fn decode_link(head: PageId, raw: &[u8]) -> Result<u64> {
    if raw.len() != LINK_VALUE_LEN {
        return Err(TideError::Corruption(format!(
            "bucket {} has a malformed chain link",
            head
        )));
    }
    let len = le_u64(raw);
    if len == 0 || len > MAX_CHAIN_PAGES {
        return Err(TideError::Corruption(format!(
            "bucket {} claims a chain of {} pages",
            head, len
        )));
    }
    Ok(len)
}

/// Value stored under `key`, reassembled from its parts
pub fn read_value<S: PageSource>(
    layout: &BucketLayout,
    source: &mut S,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let parts = locate_parts(layout, source, key)?;
    if parts.is_empty() {
        return Ok(None);
    }

    let stored: usize = parts.iter().map(|(_, data)| data.len()).sum();
    let mut value = Vec::with_capacity(stored - COUNT_LEN);
    for (part, (_, data)) in parts.iter().enumerate() {
        let data = if part == 0 { &data[COUNT_LEN..] } else { &data[..] };
        value.extend_from_slice(data);
    }
    Ok(Some(value))
}

/// Every stored part of `key` as `(page, cell data)`, in part order
fn locate_parts<S: PageSource>(
    layout: &BucketLayout,
    source: &mut S,
    key: &[u8],
) -> Result<Vec<(PageId, Vec<u8>)>> {
    let head = layout.bucket_for(key);
    let len = chain_len(source, head)?;

    let mut parts = Vec::new();
    let mut expected = None;
    for position in 0..len {
        let page_id = layout.page_at(head, position);
        let cell = cell_key(key, parts.len() as u32);
        let Some(data) = source.with_page(page_id, |page| page.get(&cell).map(<[u8]>::to_vec))?
        else {
            continue;
        };
        if parts.is_empty() {
            expected = Some(part_count(page_id, &data)?);
        }
        parts.push((page_id, data));
        if expected == Some(parts.len()) {
            return Ok(parts);
        }
    }

    if parts.is_empty() {
        return Ok(parts);
    }
    Err(TideError::Corruption(format!(
        "value in bucket {} is missing part {}",
        head,
        parts.len()
    )))
}

fn part_count(page_id: PageId, data: &[u8]) -> Result<usize> {
    if data.len() < COUNT_LEN {
        return Err(TideError::Corruption(format!(
            "page {} holds a value without a part count",
            page_id
        )));
    }
    match le_u32(&data[..COUNT_LEN]) {
        0 => Err(TideError::Corruption(format!(
            "page {} holds a value with zero parts",
            page_id
        ))),
        count => Ok(count as usize),
    }
}

/// One cell set or removed by a `ChainEditor`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellChange {
    pub page_id: PageId,
    pub cell: Vec<u8>,
    pub before: Option<Vec<u8>>,
    pub after: Option<Vec<u8>>,
}

/// Stages value writes on copies of the pages they touch
///
/// Nothing reaches the underlying source. `finish` hands back the changed
/// copies and the cell changes that produced them, in order.
pub struct ChainEditor<S> {
    layout: BucketLayout,
    base: S,
    pages: BTreeMap<PageId, Page>,
    changes: Vec<CellChange>,
}

impl<S: PageSource> PageSource for ChainEditor<S> {
    fn with_page<R>(&mut self, id: PageId, f: impl FnOnce(&Page) -> R) -> Result<R> {
        match self.pages.get(&id) {
            Some(page) => Ok(f(page)),
            None => self.base.with_page(id, f),
        }
    }
}

impl<S: PageSource> ChainEditor<S> {
    pub fn new(layout: BucketLayout, base: S) -> Self {
        Self {
            layout,
            base,
            pages: BTreeMap::new(),
            changes: Vec::new(),
        }
    }

    /// Value of `key` including the writes staged so far
    pub fn read_value(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let layout = self.layout;
        read_value(&layout, self, key)
    }

    /// Replace (`Some`) or remove (`None`) the value stored under `key`
    pub fn write_value(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let layout = self.layout;
        layout.check_key(key)?;
        let old = locate_parts(&layout, self, key)?;
        for (part, (page_id, _)) in old.into_iter().enumerate() {
            self.set(page_id, cell_key(key, part as u32), None)?;
        }
        match value {
            Some(value) => self.place(key, value),
            None => Ok(()),
        }
    }

    pub fn finish(self) -> (BTreeMap<PageId, Page>, Vec<CellChange>) {
        (self.pages, self.changes)
    }

    /// First-fit along the chain. A value that fits one page stays whole;
    /// a larger one is cut into pieces of at least `MIN_PIECE` bytes.
    fn place(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let layout = self.layout;
        let head = layout.bucket_for(key);
        let len = chain_len(self, head)?;
        let has_link = self.with_page(head, |page| page.get(LINK_CELL).is_some())?;
        // The head always keeps room to record a longer chain
        let link_reserve = if has_link {
            0
        } else {
            entry_size(LINK_CELL, &[0; LINK_VALUE_LEN])
        };

        let sample_cell = cell_key(key, 0);
        let total = COUNT_LEN + value.len();
        let whole = total <= layout.piece_capacity(key);

        let mut pieces: Vec<(PageId, usize)> = Vec::new();
        let mut remaining = total;
        let mut position = 0;
        while remaining > 0 {
            if position >= MAX_CHAIN_PAGES {
                return Err(TideError::PageFull(head));
            }
            let page_id = layout.page_at(head, position);
            let mut room = self.with_page(page_id, |page| page.room_for(&sample_cell))?;
            if position == 0 {
                room = room.saturating_sub(link_reserve);
            }

            let take = if remaining <= room {
                remaining
            } else if !whole && room >= MIN_PIECE {
                room
            } else {
                0
            };
            if take > 0 {
                pieces.push((page_id, take));
                remaining -= take;
            }
            position += 1;
        }

        let mut stream = Vec::with_capacity(total);
        stream.extend_from_slice(&(pieces.len() as u32).to_le_bytes());
        stream.extend_from_slice(value);
        let mut offset = 0;
        for (part, (page_id, take)) in pieces.into_iter().enumerate() {
            let piece = stream[offset..offset + take].to_vec();
            self.set(page_id, cell_key(key, part as u32), Some(piece))?;
            offset += take;
        }

        if position > len {
            self.set(head, LINK_CELL.to_vec(), Some(position.to_le_bytes().to_vec()))?;
        }
        Ok(())
    }

    fn set(&mut self, page_id: PageId, cell: Vec<u8>, after: Option<Vec<u8>>) -> Result<()> {
        let page = self.page_mut(page_id)?;
        let lsn = page.page_lsn();
        let before = page.apply(&cell, after.as_deref(), lsn)?;
        self.changes.push(CellChange {
            page_id,
            cell,
            before,
            after,
        });
        Ok(())
    }

    fn page_mut(&mut self, id: PageId) -> Result<&mut Page> {
        match self.pages.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let page = self.base.with_page(id, Page::clone)?;
                Ok(entry.insert(page))
            }
        }
    }
}
