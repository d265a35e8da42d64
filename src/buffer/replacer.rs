//! Frame replacement policy

/// Index of a frame in the pool
pub type FrameId = usize;

/// Picks which unpinned frame gives up its page
pub trait Replacer: Send {
    /// Note a use of `frame`
    fn record_access(&mut self, frame: FrameId);

    /// Mark whether `frame` may be chosen. Pinned frames are never evictable.
    fn set_evictable(&mut self, frame: FrameId, evictable: bool);

    /// Best candidate among evictable frames not in `skip`, without
    /// removing it
    fn victim(&self, skip: &[FrameId]) -> Option<FrameId>;

    /// Number of frames that may currently be chosen
    fn evictable_count(&self) -> usize;
}

/// Least-recently-used replacement
pub struct LruReplacer {
    clock: u64,
    last_access: Vec<u64>,
    evictable: Vec<bool>,
    count: usize,
}

impl LruReplacer {
    pub fn new(frames: usize) -> Self {
        Self {
            clock: 0,
            last_access: vec![0; frames],
            evictable: vec![false; frames],
            count: 0,
        }
    }
}

impl Replacer for LruReplacer {
    fn record_access(&mut self, frame: FrameId) {
        self.clock += 1;
        self.last_access[frame] = self.clock;
    }

    fn set_evictable(&mut self, frame: FrameId, evictable: bool) {
        if self.evictable[frame] != evictable {
            self.evictable[frame] = evictable;
            if evictable {
                self.count += 1;
            } else {
                self.count -= 1;
            }
        }
    }

    fn victim(&self, skip: &[FrameId]) -> Option<FrameId> {
        self.evictable
            .iter()
            .enumerate()
            .filter(|(frame, &evictable)| evictable && !skip.contains(frame))
            .min_by_key(|(frame, _)| self.last_access[*frame])
            .map(|(frame, _)| frame)
    }

    fn evictable_count(&self) -> usize {
        self.count
    }
}
