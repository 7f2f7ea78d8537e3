//! Identifiers for operations, entries and subscribers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OPERATION: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of an operation definition.
///
/// Allocated once per [`Query`](crate::Query) or [`Mutation`](crate::Mutation)
/// and embedded in every key derived from it, so two operations never share
/// entries even when called with equal arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        OperationId(NEXT_OPERATION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable arena index of one entry instance.
///
/// A key evicted and recreated gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) u64);

/// Identifier of one subscriber. Ordered by registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u64);

/// Monotonic id source scoped to one cache instance.
#[derive(Debug, Default)]
pub(crate) struct IdSource(AtomicU64);

impl IdSource {
    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}
