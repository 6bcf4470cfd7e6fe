//! Identifiers for executors and deferred work.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);
static NEXT_EXECUTOR: AtomicU64 = AtomicU64::new(1);

/// Process-wide creation order of deferred work items.
///
/// Two items with equal deadlines are dispatched in sequence order, so
/// simultaneously eligible work runs FIFO.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sequence(u64);

impl Sequence {
    /// Allocates the next sequence number.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequence({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies the scheduling wrapper that owns a deferred work item.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExecutorId(u64);

impl ExecutorId {
    /// Allocates a fresh identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_EXECUTOR.fetch_add(1, Ordering::Relaxed))
    }

    /// Identifier reserved for items that belong to the queue itself.
    pub const QUEUE: Self = Self(0);
}

impl fmt::Debug for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecutorId({})", self.0)
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}
