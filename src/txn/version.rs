//! MVCC version store
//!
//! Every key with recent history has a `VersionChain`: an arena of version
//! nodes linked newest first through stable `VersionId`s. Each chain sits
//! behind its own `RwLock` and is shared through an `Arc`, so:
//!
//! - readers hold the read lock only while walking the chain;
//! - reclaiming a node needs the write lock, so no reader can still be
//!   looking at it;
//! - a reader that cloned the `Arc` keeps the whole chain alive even after
//!   GC unlinks it from the index.
//!
//! Keys without a chain read straight from their page.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::Result;
use crate::lsn::{Lsn, TxnId};

const SHARDS: usize = 16;

/// Stable index of a node inside its chain's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionState {
    /// Installed by a commit that is not durable yet; invisible to readers
    Pending,
    Committed,
}

/// One version of a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub commit_lsn: Lsn,
    pub txn_id: TxnId,
    pub state: VersionState,
    /// `None` is a tombstone
    pub value: Option<Bytes>,
    pub prev: Option<VersionId>,
}

impl VersionedRecord {
    /// Approximate heap footprint, for GC accounting
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.value.as_ref().map_or(0, Bytes::len)
    }
}

/// Per-key version list, newest first
#[derive(Debug, Default)]
pub struct VersionChain {
    nodes: Vec<Option<VersionedRecord>>,
    free: Vec<VersionId>,
    head: Option<VersionId>,
    live: usize,
}

/// Nodes reclaimed from one chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneResult {
    pub versions: u64,
    pub bytes: u64,
}

impl VersionChain {
    /// A chain holding the durable page value as its only, oldest version
    pub fn with_base(value: Option<Bytes>) -> Self {
        let mut chain = Self::default();
        chain.push(VersionedRecord {
            commit_lsn: Lsn::ZERO,
            txn_id: TxnId(0),
            state: VersionState::Committed,
            value,
            prev: None,
        });
        chain
    }

    fn node(&self, id: VersionId) -> Option<&VersionedRecord> {
        self.nodes.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn alloc(&mut self, record: VersionedRecord) -> VersionId {
        self.live += 1;
        match self.free.pop() {
            Some(id) => {
                self.nodes[id.0 as usize] = Some(record);
                id
            }
            None => {
                self.nodes.push(Some(record));
                VersionId((self.nodes.len() - 1) as u32)
            }
        }
    }

    fn reclaim(&mut self, id: VersionId) -> Option<VersionedRecord> {
        let record = self.nodes.get_mut(id.0 as usize)?.take()?;
        self.free.push(id);
        self.live -= 1;
        Some(record)
    }

    /// Newest version, committed or not
    pub fn head(&self) -> Option<&VersionedRecord> {
        self.head.and_then(|id| self.node(id))
    }

    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            chain: self,
            next: self.head,
        }
    }

    /// Number of live versions
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Newest committed version with `commit_lsn <= snapshot`
    pub fn visible(&self, snapshot: Lsn) -> Option<&VersionedRecord> {
        self.iter()
            .find(|v| v.state == VersionState::Committed && v.commit_lsn <= snapshot)
    }

    /// Install a new head. Versions must arrive in increasing `commit_lsn`.
    pub fn push(&mut self, mut record: VersionedRecord) -> VersionId {
        debug_assert!(self.head().map_or(true, |h| h.commit_lsn < record.commit_lsn));
        record.prev = self.head;
        let id = self.alloc(record);
        self.head = Some(id);
        id
    }

    /// Publish the pending version written by `txn_id` at `commit_lsn`
    pub fn commit(&mut self, txn_id: TxnId, commit_lsn: Lsn) -> bool {
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let Some(node) = self.nodes.get_mut(id.0 as usize).and_then(Option::as_mut) else {
                return false;
            };
            if node.txn_id == txn_id && node.commit_lsn == commit_lsn {
                node.state = VersionState::Committed;
                return true;
            }
            cursor = node.prev;
        }
        false
    }

    /// Remove the pending version written by `txn_id` at `commit_lsn`
    pub fn unlink_pending(&mut self, txn_id: TxnId, commit_lsn: Lsn) -> bool {
        let mut newer: Option<VersionId> = None;
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let Some(node) = self.node(id) else {
                return false;
            };
            let prev = node.prev;
            if node.txn_id == txn_id
                && node.commit_lsn == commit_lsn
                && node.state == VersionState::Pending
            {
                match newer {
                    None => self.head = prev,
                    Some(newer_id) => {
                        if let Some(n) = self.nodes[newer_id.0 as usize].as_mut() {
                            n.prev = prev;
                        }
                    }
                }
                self.reclaim(id);
                return true;
            }
            newer = Some(id);
            cursor = prev;
        }
        false
    }

    /// Reclaim every version older than the newest committed one at or
    /// below `watermark`
    ///
    /// No snapshot at or above the watermark can see past that version.
    pub fn prune(&mut self, watermark: Lsn) -> PruneResult {
        let mut result = PruneResult::default();

        let mut cursor = self.head;
        let mut keep = None;
        while let Some(id) = cursor {
            let Some(node) = self.node(id) else { break };
            if node.state == VersionState::Committed && node.commit_lsn <= watermark {
                keep = Some(id);
                break;
            }
            cursor = node.prev;
        }
        let Some(keep) = keep else {
            return result;
        };

        let mut cursor = self.node(keep).and_then(|n| n.prev);
        if let Some(n) = self.nodes[keep.0 as usize].as_mut() {
            n.prev = None;
        }
        while let Some(id) = cursor {
            match self.reclaim(id) {
                Some(old) => {
                    result.versions += 1;
                    result.bytes += old.size() as u64;
                    cursor = old.prev;
                }
                None => break,
            }
        }
        result
    }

    /// True when only one committed version at or below `watermark` is left.
    /// Such a chain carries nothing its page does not.
    pub fn is_settled(&self, watermark: Lsn) -> bool {
        self.live == 1
            && self
                .head()
                .map_or(false, |h| h.state == VersionState::Committed && h.commit_lsn <= watermark)
    }
}

/// Walks a chain newest first
pub struct ChainIter<'a> {
    chain: &'a VersionChain,
    next: Option<VersionId>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a VersionedRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.chain.node(self.next?)?;
        self.next = node.prev;
        Some(node)
    }
}

pub type SharedChain = Arc<RwLock<VersionChain>>;
type Shard = RwLock<HashMap<Vec<u8>, SharedChain>>;

/// Index from key to version chain
pub struct VersionStore {
    shards: Vec<Shard>,
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    /// Shard that owns `key`
    pub(crate) fn shard(&self, key: &[u8]) -> &Shard {
        &self.shards[crc32fast::hash(key) as usize % SHARDS]
    }

    pub fn get(&self, key: &[u8]) -> Option<SharedChain> {
        self.shard(key).read().get(key).cloned()
    }

    /// Existing chain for `key`, or a new one seeded by `base`
    ///
    /// `base` runs before the shard is locked, so it may do page I/O. Callers
    /// hold the commit lock, which keeps the stored value from changing before
    /// the insert.
    pub fn get_or_create(
        &self,
        key: &[u8],
        base: impl FnOnce() -> Result<Option<Bytes>>,
    ) -> Result<SharedChain> {
        if let Some(chain) = self.get(key) {
            return Ok(chain);
        }
        let base = base()?;
        let mut shard = self.shard(key).write();
        Ok(Arc::clone(
            shard
                .entry(key.to_vec())
                .or_insert_with(|| Arc::new(RwLock::new(VersionChain::with_base(base)))),
        ))
    }

    /// Drop the chain for `key` if `settled` still holds under the shard lock
    pub fn remove_if(&self, key: &[u8], settled: impl Fn(&VersionChain) -> bool) -> bool {
        let mut shard = self.shard(key).write();
        let remove = shard.get(key).map_or(false, |chain| settled(&chain.read()));
        if remove {
            shard.remove(key);
        }
        remove
    }

    /// Every chain, shard by shard
    pub fn chains(&self) -> Vec<(Vec<u8>, SharedChain)> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .iter()
                    .map(|(k, c)| (k.clone(), Arc::clone(c)))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn chain_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn version_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().values().map(|c| c.read().len()).sum::<usize>())
            .sum()
    }
}
