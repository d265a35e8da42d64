//! Buffer pool
//!
//! A fixed set of frames shared by every thread of one engine instance.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, warn};

use super::bucket::BucketLayout;
use super::page::Page;
use super::replacer::{FrameId, LruReplacer, Replacer};
use super::store::PageStore;
use super::{DirtyPage, FlushRetry, PoolStats, WalDurability};
use crate::error::{Result, TideError};
use crate::lsn::{Lsn, PageId};

/// A frame's page image. Pool bookkeeping lives in `PoolState`.
struct Frame {
    page: RwLock<Page>,
    flush_lock: Mutex<()>,
    /// Bumped by every `PageHandle::write`
    generation: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
struct FrameMeta {
    page_id: Option<PageId>,
    pin_count: u32,
    dirty: bool,
    rec_lsn: Lsn,
}

struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    /// Pages being read from the store right now
    loading: HashSet<PageId>,
    meta: Vec<FrameMeta>,
    free: Vec<FrameId>,
    replacer: Box<dyn Replacer>,
}

impl PoolState {
    fn pin_frame(&mut self, frame: FrameId) {
        self.meta[frame].pin_count += 1;
        self.replacer.record_access(frame);
        self.replacer.set_evictable(frame, false);
    }

    fn unpin_frame(&mut self, frame: FrameId) {
        let meta = &mut self.meta[frame];
        if meta.pin_count == 0 {
            error!(frame, "unpin of a frame with no pins");
            return;
        }
        meta.pin_count -= 1;
        if meta.pin_count == 0 && meta.page_id.is_some() {
            self.replacer.set_evictable(frame, true);
        }
    }

    fn mark_dirty(&mut self, frame: FrameId, rec_lsn: Lsn) {
        let meta = &mut self.meta[frame];
        if meta.dirty {
            meta.rec_lsn = meta.rec_lsn.min(rec_lsn);
        } else {
            meta.dirty = true;
            meta.rec_lsn = rec_lsn;
        }
    }
}

/// Outcome of one round of victim selection
enum Victim {
    Ready(FrameId),
    Flushed,
    Unflushable(FrameId, TideError),
    None,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
}

/// Page cache owned by one engine instance
pub struct BufferPool {
    store: Arc<PageStore>,
    durability: Arc<dyn WalDurability>,
    retry: FlushRetry,
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
    loaded: Condvar,
    counters: Counters,
}

impl BufferPool {
    pub fn new(
        store: Arc<PageStore>,
        frames: usize,
        durability: Arc<dyn WalDurability>,
        retry: FlushRetry,
    ) -> Self {
        let page_size = store.page_size();
        Self {
            frames: (0..frames)
                .map(|_| Frame {
                    page: RwLock::new(Page::new(PageId(0), page_size)),
                    flush_lock: Mutex::new(()),
                    generation: AtomicU64::new(0),
                })
                .collect(),
            state: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(frames),
                loading: HashSet::new(),
                meta: vec![FrameMeta::default(); frames],
                free: (0..frames).rev().collect(),
                replacer: Box::new(LruReplacer::new(frames)),
            }),
            loaded: Condvar::new(),
            counters: Counters::default(),
            store,
            durability,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    pub fn layout(&self) -> BucketLayout {
        self.store.layout()
    }

    /// Head page of the bucket that owns `key`
    pub fn page_for(&self, key: &[u8]) -> PageId {
        self.store.bucket_for(key)
    }

    /// Pin a page, loading it on a miss
    ///
    /// May block on another thread's load of the same page, or on the flush of
    /// a dirty victim.
    pub fn pin(&self, page_id: PageId) -> Result<PageHandle<'_>> {
        if !self.store.contains(page_id) {
            return Err(TideError::PageNotFound(page_id));
        }

        // Dirty frames whose flush failed during this pin
        let mut unflushable: Vec<FrameId> = Vec::new();
        let mut flush_error = None;

        let mut state = self.state.lock();
        loop {
            if let Some(&frame) = state.page_table.get(&page_id) {
                state.pin_frame(frame);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(PageHandle::new(self, frame, page_id));
            }
            if state.loading.contains(&page_id) {
                self.loaded.wait(&mut state);
                continue;
            }

            let frame = match state.free.pop() {
                Some(frame) => frame,
                None => match self.take_victim(&mut state, &unflushable) {
                    Victim::Ready(frame) => frame,
                    // A dirty victim was flushed; look again
                    Victim::Flushed => continue,
                    Victim::Unflushable(frame, e) => {
                        warn!(page = %page_id, frame, error = %e, "dirty victim could not be flushed, trying the next one");
                        unflushable.push(frame);
                        flush_error = Some(e);
                        continue;
                    }
                    Victim::None => {
                        return Err(flush_error.unwrap_or(TideError::PoolExhausted));
                    }
                },
            };

            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            state.loading.insert(page_id);
            state.meta[frame] = FrameMeta {
                page_id: None,
                pin_count: 1,
                dirty: false,
                rec_lsn: Lsn::ZERO,
            };

            // The frame is unmapped and pinned, so nobody else touches it
            let loaded = MutexGuard::unlocked(&mut state, || {
                let page = self.store.read_page(page_id)?;
                *self.frames[frame].page.write() = page;
                Ok::<_, TideError>(())
            });

            state.loading.remove(&page_id);
            self.loaded.notify_all();

            return match loaded {
                Ok(()) => {
                    state.meta[frame].page_id = Some(page_id);
                    state.page_table.insert(page_id, frame);
                    state.replacer.record_access(frame);
                    Ok(PageHandle::new(self, frame, page_id))
                }
                Err(e) => {
                    state.meta[frame] = FrameMeta::default();
                    state.free.push(frame);
                    Err(e)
                }
            };
        }
    }

    /// Release a pin. `mark_dirty` is sticky until the next flush.
    pub fn unpin(&self, mut handle: PageHandle<'_>, mark_dirty: bool) {
        handle.release(mark_dirty);
    }

    /// Pick an evictable frame, passing over frames in `skip`
    ///
    /// Returns `Flushed` after writing back a dirty victim so the caller
    /// restarts selection with the pool mutex re-acquired.
    fn take_victim(&self, state: &mut MutexGuard<'_, PoolState>, skip: &[FrameId]) -> Victim {
        let Some(victim) = state.replacer.victim(skip) else {
            return Victim::None;
        };

        if state.meta[victim].dirty {
            state.pin_frame(victim);
            let flushed = MutexGuard::unlocked(state, || self.flush_frame(victim));
            state.unpin_frame(victim);
            return match flushed {
                Ok(_) => Victim::Flushed,
                Err(e) => Victim::Unflushable(victim, e),
            };
        }

        if let Some(old) = state.meta[victim].page_id.take() {
            state.page_table.remove(&old);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        state.replacer.set_evictable(victim, false);
        Victim::Ready(victim)
    }

    /// Write one frame back if it is dirty
    ///
    /// Returns whether anything was written.
    fn flush_frame(&self, frame: FrameId) -> Result<bool> {
        let slot = &self.frames[frame];
        let _flushing = slot.flush_lock.lock();

        let (page_id, page_lsn, generation, image) = {
            let page = slot.page.read();
            (
                page.id(),
                page.page_lsn(),
                slot.generation.load(Ordering::Acquire),
                page.encode(),
            )
        };
        {
            let state = self.state.lock();
            let meta = &state.meta[frame];
            if meta.page_id != Some(page_id) || !meta.dirty {
                return Ok(false);
            }
        }

        // Write-ahead rule
        self.durability.flush_through(page_lsn)?;
        if self.durability.durable_lsn() < page_lsn {
            return Err(TideError::DurabilityFault(format!(
                "WAL durable at {} but page {} is at {}",
                self.durability.durable_lsn(),
                page_id,
                page_lsn
            )));
        }
        self.write_with_retry(page_id, &image)?;

        let mut state = self.state.lock();
        let still_same = slot.generation.load(Ordering::Acquire) == generation;
        let meta = &mut state.meta[frame];
        if still_same && meta.page_id == Some(page_id) {
            meta.dirty = false;
            meta.rec_lsn = Lsn::ZERO;
        }
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn write_with_retry(&self, page_id: PageId, image: &[u8]) -> Result<()> {
        let mut backoff = self.retry.backoff;
        let mut attempt = 1;
        loop {
            match self.store.write_page(page_id, image) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry.attempts => {
                    warn!(page = %page_id, attempt, error = %e, "page write failed, retrying");
                    thread::sleep(backoff);
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    error!(page = %page_id, attempts = attempt, error = %e, "page write failed");
                    return Err(TideError::DurabilityFault(format!(
                        "page {} write failed after {} attempts: {}",
                        page_id, attempt, e
                    )));
                }
            }
        }
    }

    /// Flush one page if it is resident and dirty
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let frame = {
            let mut state = self.state.lock();
            match state.page_table.get(&page_id).copied() {
                Some(frame) => {
                    state.pin_frame(frame);
                    frame
                }
                None => return Ok(false),
            }
        };

        let flushed = self.flush_frame(frame);
        self.state.lock().unpin_frame(frame);
        flushed
    }

    /// Flush every dirty page
    pub fn flush_all(&self) -> Result<usize> {
        let mut flushed = 0;
        for dirty in self.dirty_pages() {
            if self.flush_page(dirty.page_id)? {
                flushed += 1;
            }
        }
        debug!(flushed, "flushed all dirty pages");
        Ok(flushed)
    }

    /// fsync the page store
    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    /// Snapshot of the dirty page table
    pub fn dirty_pages(&self) -> Vec<DirtyPage> {
        let state = self.state.lock();
        let mut dirty: Vec<_> = state
            .meta
            .iter()
            .enumerate()
            .filter(|(_, meta)| meta.dirty)
            .filter_map(|(frame, meta)| {
                meta.page_id.map(|page_id| DirtyPage {
                    page_id,
                    page_lsn: self.frames[frame].page.read().page_lsn(),
                    rec_lsn: meta.rec_lsn,
                })
            })
            .collect();
        dirty.sort_by_key(|d| d.rec_lsn);
        dirty
    }

    /// Oldest change not yet on disk, if any page is dirty
    pub fn min_rec_lsn(&self) -> Option<Lsn> {
        let state = self.state.lock();
        state
            .meta
            .iter()
            .filter(|meta| meta.dirty)
            .map(|meta| meta.rec_lsn)
            .min()
    }

    /// Pin count of a resident page
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        state
            .page_table
            .get(&page_id)
            .map(|&frame| state.meta[frame].pin_count)
    }

    pub fn is_resident(&self, page_id: PageId) -> bool {
        self.state.lock().page_table.contains_key(&page_id)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            frames: self.frames.len(),
            resident: state.page_table.len(),
            pinned: state.meta.iter().filter(|m| m.pin_count > 0).count(),
            dirty: state.meta.iter().filter(|m| m.dirty).count(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
        }
    }
}

/// A pinned page
///
/// Dropping the handle unpins it, dirty if `write` was used.
pub struct PageHandle<'a> {
    pool: &'a BufferPool,
    frame: FrameId,
    page_id: PageId,
    /// `page_lsn` seen by the first `write`
    pre_write_lsn: Option<Lsn>,
    /// First LSN applied through this handle, when the caller knows it
    rec_lsn: Option<Lsn>,
    written: bool,
    released: bool,
}

impl std::fmt::Debug for PageHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("frame", &self.frame)
            .field("page_id", &self.page_id)
            .field("pre_write_lsn", &self.pre_write_lsn)
            .field("rec_lsn", &self.rec_lsn)
            .field("written", &self.written)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<'a> PageHandle<'a> {
    fn new(pool: &'a BufferPool, frame: FrameId, page_id: PageId) -> Self {
        Self {
            pool,
            frame,
            page_id,
            pre_write_lsn: None,
            rec_lsn: None,
            written: false,
            released: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'a, Page> {
        self.pool.frames[self.frame].page.read()
    }

    pub fn write(&mut self) -> RwLockWriteGuard<'a, Page> {
        let pool = self.pool;
        let slot = &pool.frames[self.frame];
        let guard = slot.page.write();
        slot.generation.fetch_add(1, Ordering::AcqRel);
        if self.pre_write_lsn.is_none() {
            self.pre_write_lsn = Some(guard.page_lsn());
        }
        self.written = true;
        guard
    }

    /// Mark the frame dirty now, with `first_lsn` as the oldest change
    ///
    /// Used when the dirty page table must reflect a change before the pin
    /// is released.
    pub fn mark_dirty(&mut self, first_lsn: Lsn) {
        self.rec_lsn = Some(self.rec_lsn.map_or(first_lsn, |lsn| lsn.min(first_lsn)));
        self.pool.state.lock().mark_dirty(self.frame, first_lsn);
    }

    fn release(&mut self, mark_dirty: bool) {
        if self.released {
            return;
        }
        self.released = true;

        let dirty = mark_dirty || self.written;
        let rec_lsn = if dirty {
            Some(match (self.rec_lsn, self.pre_write_lsn) {
                (Some(lsn), _) => lsn,
                (None, Some(pre)) => pre.next(),
                (None, None) => self.read().page_lsn().next(),
            })
        } else {
            None
        };

        let mut state = self.pool.state.lock();
        if let Some(rec_lsn) = rec_lsn {
            state.mark_dirty(self.frame, rec_lsn);
        }
        state.unpin_frame(self.frame);
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        self.release(false);
    }
}
