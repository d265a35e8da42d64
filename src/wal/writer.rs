//! WAL Writer
//!
//! Appends records to the active segment and makes them durable with group
//! commit.
//!
//! ## Write path
//! - `append` allocates the LSN and stages the encoded frame. The staging lock
//!   only orders LSNs against buffer positions; no I/O happens under it.
//! - `flush_through` hands a request to the flusher thread and blocks on a
//!   per-request reply channel.
//! - The flusher collects requests for up to the batching window, swaps the
//!   staged buffer out and does one write plus one fsync per segment touched.
//! - A failed write or fsync truncates the segment back to its last synced
//!   offset before any waiter is answered. If that truncate fails too, the
//!   fault is fatal and only a restart clears it.
//!
//! ## Lock order
//! `segments` before `staging`. Writers appending records take only `staging`.

use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
#[cfg(test)]
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::record::{RecordKind, WalRecord};
use super::segment::{self, ActiveSegment};
use crate::buffer::WalDurability;
use crate::config::{Config, WalSyncStrategy};
use crate::error::{Result, TideError};
use crate::lsn::{Lsn, LsnAllocator, TxnId};

/// Writer settings derived from `Config`
#[derive(Debug, Clone, Copy)]
pub struct WalOptions {
    pub segment_size: u64,
    pub sync_strategy: WalSyncStrategy,
}

impl WalOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            segment_size: config.wal_segment_size,
            sync_strategy: config.wal_sync_strategy,
        }
    }
}

impl Default for WalOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Writes records to the segmented WAL
pub struct WalWriter {
    shared: Arc<Shared>,
    requests: Option<Sender<FlushRequest>>,
    flusher: Option<JoinHandle<()>>,
}

struct FlushRequest {
    lsn: Lsn,
    reply: Sender<Result<()>>,
}

/// Frames appended but not yet handed to the flusher
#[derive(Default)]
struct Staging {
    buf: BytesMut,
    /// LSN and end offset in `buf` of every staged frame
    frames: Vec<(Lsn, usize)>,
}

struct StagedBatch {
    bytes: Bytes,
    frames: Vec<(Lsn, usize)>,
    /// Every LSN issued so far is in this batch, already durable, or dropped
    covers: Lsn,
}

impl Staging {
    fn push(&mut self, lsn: Lsn, frame: &[u8]) {
        self.buf.extend_from_slice(frame);
        self.frames.push((lsn, self.buf.len()));
    }

    fn take(&mut self, covers: Lsn) -> StagedBatch {
        StagedBatch {
            bytes: self.buf.split().freeze(),
            frames: mem::take(&mut self.frames),
            covers,
        }
    }

    fn clear(&mut self) -> usize {
        let dropped = self.frames.len();
        self.buf.clear();
        self.frames.clear();
        dropped
    }
}

struct Shared {
    dir: PathBuf,
    options: WalOptions,
    allocator: LsnAllocator,
    staging: Mutex<Staging>,
    segments: Mutex<ActiveSegment>,
    durable_lsn: AtomicU64,
    bytes_appended: AtomicU64,
    failed: AtomicBool,
    /// The unsynced tail could not be removed; only a restart recovers
    fatal: AtomicBool,
    failure: Mutex<Option<String>>,
    #[cfg(test)]
    injected_faults: AtomicU32,
    #[cfg(test)]
    injected_sync_faults: AtomicU32,
}

impl WalWriter {
    /// Open the WAL in `dir` for append
    ///
    /// The newest segment is reopened when one exists; otherwise a segment
    /// starting at `next_lsn` is created. The tail must already have been
    /// cleaned by `WalRecovery::recover`.
    pub fn open(dir: &Path, options: WalOptions, next_lsn: Lsn) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let active = match segment::list_segments(dir)?.last() {
            Some(info) => ActiveSegment::open(info)?,
            None => ActiveSegment::create(dir, next_lsn)?,
        };

        // A reopened segment may start past the last surviving record
        let allocator = LsnAllocator::new(next_lsn.max(active.start_lsn()));
        let durable = allocator.last_issued();
        info!(
            dir = %dir.display(),
            segment = %active.path().display(),
            next_lsn = %allocator.peek(),
            "WAL opened"
        );

        let shared = Arc::new(Shared {
            dir: dir.to_path_buf(),
            options,
            allocator,
            staging: Mutex::new(Staging::default()),
            segments: Mutex::new(active),
            durable_lsn: AtomicU64::new(durable.0),
            bytes_appended: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            failure: Mutex::new(None),
            #[cfg(test)]
            injected_faults: AtomicU32::new(0),
            #[cfg(test)]
            injected_sync_faults: AtomicU32::new(0),
        });

        let (tx, rx) = channel::unbounded();
        let flusher_shared = Arc::clone(&shared);
        let flusher = thread::Builder::new()
            .name("tidekv-wal-flusher".into())
            .spawn(move || run_flusher(flusher_shared, rx))?;

        Ok(Self {
            shared,
            requests: Some(tx),
            flusher: Some(flusher),
        })
    }

    /// Stage a record and return its LSN
    ///
    /// The record is not durable until `flush_through` covers its LSN.
    pub fn append(&self, txn_id: TxnId, kind: &RecordKind) -> Result<Lsn> {
        self.shared.check_healthy()?;
        let body = WalRecord::encode_body(txn_id, kind)?;

        let mut staging = self.shared.staging.lock();
        self.shared.check_healthy()?;
        let lsn = self.shared.allocator.next();
        let frame = WalRecord::frame(lsn, &body);
        staging.push(lsn, &frame);
        drop(staging);

        self.shared
            .bytes_appended
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(lsn)
    }

    /// Block until every record up to `lsn` is on disk
    pub fn flush_through(&self, lsn: Lsn) -> Result<()> {
        let target = lsn.min(self.last_lsn());
        if self.durable_lsn() >= target {
            return Ok(());
        }
        self.shared.check_healthy()?;

        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| TideError::WalFailed("WAL is closed".into()))?;
        let (reply, outcome) = channel::bounded(1);
        requests
            .send(FlushRequest { lsn: target, reply })
            .map_err(|_| TideError::WalFailed("flusher thread stopped".into()))?;
        outcome
            .recv()
            .map_err(|_| TideError::WalFailed("flusher thread stopped".into()))?
    }

    /// Highest LSN known to be on disk
    pub fn durable_lsn(&self) -> Lsn {
        self.shared.durable_lsn()
    }

    /// Highest LSN handed out so far
    pub fn last_lsn(&self) -> Lsn {
        self.shared.allocator.last_issued()
    }

    /// LSN the next `append` will receive
    pub fn next_lsn(&self) -> Lsn {
        self.shared.allocator.peek()
    }

    /// Total framed bytes appended since open
    pub fn bytes_appended(&self) -> u64 {
        self.shared.bytes_appended.load(Ordering::Relaxed)
    }

    /// Whether a write fault is latched
    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /// Delete sealed segments whose records all precede `redo_lsn`
    ///
    /// A segment is removable once the segment after it starts at or below
    /// `redo_lsn`. The active segment is never removed.
    pub fn purge_before(&self, redo_lsn: Lsn) -> Result<usize> {
        let active = self.shared.segments.lock();
        let segments = segment::list_segments(&self.shared.dir)?;

        let mut removed = 0;
        for pair in segments.windows(2) {
            let (current, next) = (&pair[0], &pair[1]);
            if next.start_lsn > redo_lsn || current.start_lsn >= active.start_lsn() {
                break;
            }
            fs::remove_file(&current.path)?;
            removed += 1;
        }
        if removed > 0 {
            segment::sync_dir(&self.shared.dir)?;
            debug!(removed, redo_lsn = %redo_lsn, "purged WAL segments");
        }
        Ok(removed)
    }

    /// Recover from a latched write fault
    ///
    /// Truncates the active segment to its last durable offset, drops every
    /// staged record and accepts appends again. The LSNs of dropped records
    /// are never reused, not even after a restart. A fault whose unsynced
    /// tail could not be truncated is not clearable.
    pub fn clear_fault(&self) -> Result<()> {
        let mut active = self.shared.segments.lock();
        let mut staging = self.shared.staging.lock();
        if !self.is_failed() {
            return Ok(());
        }
        if self.shared.fatal.load(Ordering::Acquire) {
            return Err(self.shared.failure_error());
        }

        let truncated = active.truncate_to_durable()?;
        let dropped = staging.clear();

        // Fence above every dropped LSN. A later flush cannot report a dropped
        // LSN durable without writing a record past it.
        let body = WalRecord::encode_body(TxnId(0), &RecordKind::Abort)?;
        let fence = self.shared.allocator.next();
        let frame = WalRecord::frame(fence, &body);
        staging.push(fence, &frame);
        self.shared
            .bytes_appended
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        *self.shared.failure.lock() = None;
        self.shared.failed.store(false, Ordering::Release);

        info!(
            truncated_bytes = truncated,
            dropped_records = dropped,
            durable_lsn = %self.durable_lsn(),
            "WAL fault cleared"
        );
        Ok(())
    }

    /// Make the next `count` physical writes fail
    #[cfg(test)]
    pub(crate) fn inject_write_faults(&self, count: u32) {
        self.shared.injected_faults.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` fsyncs fail after the bytes were written
    #[cfg(test)]
    pub(crate) fn inject_sync_faults(&self, count: u32) {
        self.shared.injected_sync_faults.store(count, Ordering::SeqCst);
    }
}

impl WalDurability for WalWriter {
    fn durable_lsn(&self) -> Lsn {
        WalWriter::durable_lsn(self)
    }

    fn flush_through(&self, lsn: Lsn) -> Result<()> {
        WalWriter::flush_through(self, lsn)
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        // Closing the channel lets the flusher drain and exit
        self.requests.take();
        if let Some(handle) = self.flusher.take() {
            if handle.join().is_err() {
                error!("WAL flusher thread panicked");
            }
        }
    }
}

impl Shared {
    fn durable_lsn(&self) -> Lsn {
        Lsn(self.durable_lsn.load(Ordering::Acquire))
    }

    fn check_healthy(&self) -> Result<()> {
        if !self.failed.load(Ordering::Acquire) {
            return Ok(());
        }
        Err(self.failure_error())
    }

    fn failure_error(&self) -> TideError {
        let reason = self
            .failure
            .lock()
            .clone()
            .unwrap_or_else(|| "write fault".into());
        if self.fatal.load(Ordering::Acquire) {
            TideError::DurabilityFault(reason)
        } else {
            TideError::WalFailed(reason)
        }
    }

    fn latch_failure(&self, err: &TideError) {
        error!(error = %err, durable_lsn = %self.durable_lsn(), "WAL write failed, refusing appends");
        *self.failure.lock() = Some(err.to_string());
        self.failed.store(true, Ordering::Release);
    }

    /// Write and fsync everything staged so far
    fn flush_staged(&self) -> Result<()> {
        let mut active = self.segments.lock();
        self.check_healthy()?;

        let batch = {
            let mut staging = self.staging.lock();
            staging.take(self.allocator.last_issued())
        };

        if let Err(e) = self.write_batch(&mut active, &batch) {
            // Bytes past the last fsync could still reach disk, so they go
            // before any waiter hears that its record was lost
            let e = match active.truncate_to_durable() {
                Ok(dropped) => {
                    debug!(dropped_bytes = dropped, "truncated unsynced WAL tail");
                    e
                }
                Err(truncate) => {
                    self.fatal.store(true, Ordering::Release);
                    TideError::DurabilityFault(format!(
                        "{}; the unsynced tail could not be truncated: {}",
                        e, truncate
                    ))
                }
            };
            self.latch_failure(&e);
            return Err(e);
        }
        self.durable_lsn.fetch_max(batch.covers.0, Ordering::AcqRel);
        Ok(())
    }

    fn write_batch(&self, active: &mut ActiveSegment, batch: &StagedBatch) -> Result<()> {
        let mut chunk_start = 0;
        let mut offset = 0;
        for &(lsn, end) in &batch.frames {
            let frame_len = (end - offset) as u64;
            let pending = (offset - chunk_start) as u64;
            let would_overflow =
                active.len() + pending + frame_len > self.options.segment_size;

            if would_overflow && (!active.is_empty() || pending > 0) {
                self.write_chunk(active, &batch.bytes[chunk_start..offset])?;
                self.rotate(active, lsn)?;
                chunk_start = offset;
            }
            offset = end;
        }

        if chunk_start < offset {
            self.write_chunk(active, &batch.bytes[chunk_start..offset])?;
            self.sync_segment(active)?;
        }
        Ok(())
    }

    fn write_chunk(&self, active: &mut ActiveSegment, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        if self.take_injected_fault() {
            // A torn write: half the chunk reaches the file
            active.write(&bytes[..bytes.len() / 2])?;
            return Err(TideError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write fault",
            )));
        }

        active.write(bytes)
    }

    fn sync_segment(&self, active: &mut ActiveSegment) -> Result<()> {
        if self.take_injected_sync_fault() {
            return Err(TideError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected fsync fault",
            )));
        }
        active.sync()
    }

    #[cfg(test)]
    fn take_injected_fault(&self) -> bool {
        take_one(&self.injected_faults)
    }

    #[cfg(test)]
    fn take_injected_sync_fault(&self) -> bool {
        take_one(&self.injected_sync_faults)
    }

    #[cfg(not(test))]
    fn take_injected_fault(&self) -> bool {
        false
    }

    #[cfg(not(test))]
    fn take_injected_sync_fault(&self) -> bool {
        false
    }

    /// Seal the active segment and start a new one at `start_lsn`
    fn rotate(&self, active: &mut ActiveSegment, start_lsn: Lsn) -> Result<()> {
        self.sync_segment(active)?;
        // Everything before the new segment is now on disk
        self.durable_lsn
            .fetch_max(start_lsn.prev().0, Ordering::AcqRel);

        let sealed = active.start_lsn();
        *active = ActiveSegment::create(&self.dir, start_lsn)?;
        debug!(sealed = %sealed, start_lsn = %start_lsn, "WAL rotated");
        Ok(())
    }
}

#[cfg(test)]
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn run_flusher(shared: Arc<Shared>, requests: Receiver<FlushRequest>) {
    let (max_batch, window) = shared.options.sync_strategy.batch_window();
    let mut batch = Vec::with_capacity(max_batch);

    while let Ok(first) = requests.recv() {
        batch.push(first);
        let deadline = Instant::now() + window;
        while batch.len() < max_batch {
            match requests.recv_deadline(deadline) {
                Ok(req) => batch.push(req),
                Err(_) => break,
            }
        }

        let outcome = shared.flush_staged();
        let durable = shared.durable_lsn();
        for req in batch.drain(..) {
            let reply = if durable >= req.lsn {
                Ok(())
            } else {
                match &outcome {
                    Err(e) => Err(e.duplicate()),
                    Ok(()) => Err(TideError::WalFailed(format!(
                        "lsn {} was dropped before reaching disk",
                        req.lsn
                    ))),
                }
            };
            // The requester may have given up
            let _ = req.reply.send(reply);
        }
    }

    // Channel closed: make a final attempt so a clean shutdown loses nothing
    if let Err(e) = shared.flush_staged() {
        error!(error = %e, "final WAL flush failed");
    }
}
