//! Per-target operation registry.
//!
//! Binds in-flight operations to a named slot on a target object (the
//! caller's view), holding at most one binding per `(target, slot)` pair.
//! Binding a replacement cancels the previous occupant first, so a
//! recycled view never receives a stale image. A slot may hold a sequence
//! of operations for multi-frame sets that spawn parallel downloads.

use crate::operation::Operation;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Global counter for generating unique target IDs.
static TARGET_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of a target object (a view) in the registry.
///
/// IDs are monotonically increasing and unique within a process lifetime;
/// a target object obtains one at construction and keeps it for life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(u64);

impl TargetId {
    /// Allocate a new unique target ID.
    pub fn new() -> Self {
        Self(TARGET_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, for logging.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "target-{}", self.0)
    }
}

enum Bound {
    Single(Arc<dyn Operation>),
    Sequence(Vec<Arc<dyn Operation>>),
}

impl Bound {
    fn cancel(&self) {
        match self {
            Self::Single(op) => op.cancel(),
            Self::Sequence(ops) => {
                for op in ops {
                    op.cancel();
                }
            }
        }
    }
}

/// Map from `(target, slot)` to the operation(s) bound there.
#[derive(Default)]
pub struct OperationRegistry {
    bindings: DashMap<(TargetId, String), Bound>,
}

impl OperationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an operation under `(target, slot)`, cancelling any previous
    /// occupant first.
    pub fn bind(&self, target: TargetId, slot: &str, operation: Arc<dyn Operation>) {
        self.cancel(target, slot);
        self.bindings
            .insert((target, slot.to_string()), Bound::Single(operation));
    }

    /// Bind a sequence of operations under one slot, cancelling any
    /// previous occupant first.
    pub fn bind_sequence(&self, target: TargetId, slot: &str, operations: Vec<Arc<dyn Operation>>) {
        self.cancel(target, slot);
        self.bindings
            .insert((target, slot.to_string()), Bound::Sequence(operations));
    }

    /// Cancel and unbind whatever occupies `(target, slot)`.
    pub fn cancel(&self, target: TargetId, slot: &str) {
        // Remove first so cancel hooks run outside the map shard lock.
        if let Some((_, bound)) = self.bindings.remove(&(target, slot.to_string())) {
            debug!(%target, slot, "cancelling bound operation");
            bound.cancel();
        }
    }

    /// Unbind `(target, slot)` without cancelling, for callers that have
    /// taken over the operation's lifecycle.
    pub fn remove(&self, target: TargetId, slot: &str) {
        self.bindings.remove(&(target, slot.to_string()));
    }

    /// Whether anything is bound under `(target, slot)`.
    pub fn is_bound(&self, target: TargetId, slot: &str) -> bool {
        self.bindings.contains_key(&(target, slot.to_string()))
    }

    /// Total number of live bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the registry holds no bindings.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
