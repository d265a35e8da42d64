//! Log sequence numbers and identifiers
//!
//! `Lsn` is the single ordering space shared by every log record, page stamp
//! and MVCC version in the engine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Log Sequence Number. `Lsn::ZERO` sorts before every issued LSN.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);
    pub const MAX: Lsn = Lsn(u64::MAX);

    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }

    pub fn prev(self) -> Lsn {
        Lsn(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier, assigned at `begin`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a page slot in the page store. Slot 0 holds store metadata.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues strictly increasing LSNs.
///
/// Safe under any number of concurrent callers. Callers that need log order
/// to match LSN order (the WAL) allocate while holding their own ordering lock.
#[derive(Debug)]
pub struct LsnAllocator {
    next: AtomicU64,
}

impl LsnAllocator {
    /// Create an allocator whose first issued LSN is `first`.
    pub fn new(first: Lsn) -> Self {
        Self {
            next: AtomicU64::new(first.0.max(1)),
        }
    }

    /// Issue the next LSN.
    pub fn next(&self) -> Lsn {
        Lsn(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// The most recently issued LSN (`Lsn::ZERO` if none yet).
    pub fn last_issued(&self) -> Lsn {
        Lsn(self.next.load(Ordering::SeqCst) - 1)
    }

    /// Peek at the LSN the next call to `next` will return.
    pub fn peek(&self) -> Lsn {
        Lsn(self.next.load(Ordering::SeqCst))
    }

    /// Make sure every future LSN is greater than `lsn`.
    pub fn advance_past(&self, lsn: Lsn) {
        self.next.fetch_max(lsn.0 + 1, Ordering::SeqCst);
    }
}

impl Default for LsnAllocator {
    fn default() -> Self {
        Self::new(Lsn(1))
    }
}
