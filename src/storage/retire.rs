//! Retirement Queue
//!
//! Chains whose reference count reached zero are not freed on the spot.
//! They are parked here and handed back to the allocator in one batch,
//! either when the queue fills up or when reclamation is forced.

use crate::storage::item::ItemRef;

/// Default number of chains held before a forced reclamation
pub const DEFAULT_RETIRE_CAPACITY: usize = 256;

/// A bounded batch of chain heads awaiting reclamation.
#[derive(Debug)]
pub struct RetirementQueue {
    heads: Vec<ItemRef>,
    capacity: usize,
}

impl Default for RetirementQueue {
    fn default() -> Self {
        Self::new(DEFAULT_RETIRE_CAPACITY)
    }
}

impl RetirementQueue {
    /// Creates a queue holding up to `capacity` chains (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            heads: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Parks a chain head. Returns `true` once the queue is full and must be drained.
    pub fn push(&mut self, head: ItemRef) -> bool {
        self.heads.push(head);
        self.is_full()
    }

    /// Takes every parked chain, most recently retired first.
    pub fn drain(&mut self) -> impl Iterator<Item = ItemRef> + '_ {
        self.heads.drain(..).rev()
    }

    pub fn is_full(&self) -> bool {
        self.heads.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
