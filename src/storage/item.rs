//! Variable-Length Item Chains
//!
//! A logical record (key + value) is stored as a chain of slab objects.
//! Each object starts with a fixed 16-byte node header:
//!
//! ```text
//!  0        8          10      12             14        16
//!  ┌────────┬──────────┬───────┬──────────────┬─────────┐
//!  │  next  │ refcount │ size  │ value_offset │ key_len │
//!  └────────┴──────────┴───────┴──────────────┴─────────┘
//! ```
//!
//! The head node holds the key (padded to a 4-byte boundary) right after
//! the header, then the first part of the value. Value bytes that do not
//! fit spill into successor nodes, each holding only value bytes:
//!
//! ```text
//! head                       node 2                 tail
//! ┌──────┬─────┬────────┐    ┌──────┬──────────┐    ┌──────┬──────┐
//! │ hdr  │ key │ value… │──> │ hdr  │ …value…  │──> │ hdr  │ …val │
//! └──────┴─────┴────────┘    └──────┴──────────┘    └──────┴──────┘
//! ```
//!
//! `size` is the number of bytes of the node actually in use, so the last
//! node of a chain may occupy less than its slot. The reference count is
//! only meaningful on the head.

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::retire::RetirementQueue;
use crate::storage::slab::{SlabAllocator, SlabStats, SlotHandle, MAX_OBJECT_SIZE};
use tracing::{error, trace};

/// Bytes taken by the header at the start of every node
pub const NODE_HEADER_SIZE: usize = 16;

/// Longest key that fits, padded, in a head node
pub const MAX_KEY_LEN: usize = MAX_OBJECT_SIZE - NODE_HEADER_SIZE;

/// Rounds a key length up to a 4-byte boundary.
#[inline]
pub fn padded_key_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Handle to the head node of a chain, which stands for the whole record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemRef(SlotHandle);

impl ItemRef {
    /// The slab slot of the head node.
    pub fn handle(&self) -> SlotHandle {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeHeader {
    next: Option<SlotHandle>,
    refcount: u16,
    size: u16,
    value_offset: u16,
    key_len: u16,
}

impl NodeHeader {
    const EMPTY: NodeHeader = NodeHeader {
        next: None,
        refcount: 0,
        size: 0,
        value_offset: 0,
        key_len: 0,
    };

    fn decode(bytes: &[u8]) -> Self {
        let Some(raw) = bytes.get(..NODE_HEADER_SIZE) else {
            return Self::EMPTY;
        };
        let mut next = [0u8; 8];
        next.copy_from_slice(&raw[0..8]);
        let half = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);

        Self {
            next: SlotHandle::unpack(u64::from_le_bytes(next)),
            refcount: half(8),
            size: half(10),
            value_offset: half(12),
            key_len: half(14),
        }
    }

    fn encode(&self, bytes: &mut [u8]) {
        let Some(raw) = bytes.get_mut(..NODE_HEADER_SIZE) else {
            return;
        };
        let next = self.next.map_or(SlotHandle::NONE, |h| h.pack());
        raw[0..8].copy_from_slice(&next.to_le_bytes());
        raw[8..10].copy_from_slice(&self.refcount.to_le_bytes());
        raw[10..12].copy_from_slice(&self.size.to_le_bytes());
        raw[12..14].copy_from_slice(&self.value_offset.to_le_bytes());
        raw[14..16].copy_from_slice(&self.key_len.to_le_bytes());
    }

    fn value_range(&self) -> std::ops::Range<usize> {
        self.value_offset as usize..self.size as usize
    }
}

/// Creates, reads, and reclaims item chains on top of the slab allocator.
#[derive(Debug)]
pub struct ItemStore {
    slabs: SlabAllocator,
    retired: RetirementQueue,
    /// Chains created and not yet reclaimed
    live_chains: usize,
}

impl Default for ItemStore {
    fn default() -> Self {
        Self::new(RetirementQueue::default().capacity(), None)
    }
}

impl ItemStore {
    /// Creates an item store whose retirement queue holds `retire_capacity`
    /// chains, over an allocator capped at `max_slabs` slabs.
    pub fn new(retire_capacity: usize, max_slabs: Option<usize>) -> Self {
        Self {
            slabs: SlabAllocator::new(max_slabs),
            retired: RetirementQueue::new(retire_capacity),
            live_chains: 0,
        }
    }

    /// Stores `key` and `value` as a new chain with a reference count of zero.
    ///
    /// Fails with [`StoreError::OutOfSpace`] if the key cannot fit in a head
    /// node or the allocator is exhausted. Nothing stays allocated on failure.
    pub fn create(&mut self, key: &[u8], value: &[u8]) -> StoreResult<ItemRef> {
        if key.len() > MAX_KEY_LEN {
            return Err(StoreError::OutOfSpace);
        }

        let padded = padded_key_len(key.len());
        let nodes = self.alloc_chain(padded + value.len())?;
        let Some(&(head, _)) = nodes.first() else {
            return Err(StoreError::Internal("empty chain".to_string()));
        };

        for (i, &(handle, size)) in nodes.iter().enumerate() {
            let header = NodeHeader {
                next: nodes.get(i + 1).map(|&(next, _)| next),
                refcount: 0,
                size,
                value_offset: if i == 0 {
                    (NODE_HEADER_SIZE + padded) as u16
                } else {
                    NODE_HEADER_SIZE as u16
                },
                key_len: if i == 0 { key.len() as u16 } else { 0 },
            };
            header.encode(self.slabs.bytes_mut(handle));
        }

        let key_area = self
            .slabs
            .bytes_mut(head)
            .get_mut(NODE_HEADER_SIZE..NODE_HEADER_SIZE + padded);
        match key_area {
            Some(area) => {
                area[..key.len()].copy_from_slice(key);
                area[key.len()..].fill(0);
            }
            None => {
                free_chain(&mut self.slabs, head);
                return Err(StoreError::Internal("head node cannot hold key".to_string()));
            }
        }

        let written = self.fill_value(head, value);
        if written < value.len() {
            error!(
                head = ?head,
                missing = value.len() - written,
                "Item not fully stored"
            );
            free_chain(&mut self.slabs, head);
            return Err(StoreError::Internal(format!(
                "item not fully stored: {} of {} value bytes",
                written,
                value.len()
            )));
        }

        self.live_chains += 1;
        trace!(nodes = nodes.len(), key_len = key.len(), value_len = value.len(), "Item created");
        Ok(ItemRef(head))
    }

    /// Allocates enough nodes for `payload` bytes. Every node but the last
    /// comes from the largest class; at least one node is always allocated.
    fn alloc_chain(&mut self, payload: usize) -> StoreResult<Vec<(SlotHandle, u16)>> {
        let mut nodes = Vec::new();
        let mut remaining = payload;

        loop {
            let want = (remaining + NODE_HEADER_SIZE).min(MAX_OBJECT_SIZE);
            match self.slabs.allocate(want) {
                Ok(handle) => nodes.push((handle, want as u16)),
                Err(e) => {
                    for (handle, _) in nodes {
                        self.slabs.release(handle);
                    }
                    return Err(e);
                }
            }
            remaining -= want - NODE_HEADER_SIZE;
            if remaining == 0 {
                return Ok(nodes);
            }
        }
    }

    fn fill_value(&mut self, head: SlotHandle, value: &[u8]) -> usize {
        let mut src = value;
        let mut node = Some(head);

        while let Some(handle) = node {
            if src.is_empty() {
                break;
            }
            let bytes = self.slabs.bytes_mut(handle);
            let header = NodeHeader::decode(bytes);
            if let Some(region) = bytes.get_mut(header.value_range()) {
                let n = region.len().min(src.len());
                region[..n].copy_from_slice(&src[..n]);
                src = &src[n..];
            }
            node = header.next;
        }

        value.len() - src.len()
    }

    /// Copies the value into `buf`, walking the chain until it ends or `buf`
    /// is full. Returns the number of bytes copied.
    pub fn read(&self, item: ItemRef, buf: &mut [u8]) -> usize {
        let mut filled = 0;
        let mut node = Some(item.0);

        while let Some(handle) = node {
            if filled == buf.len() {
                break;
            }
            let bytes = self.slabs.bytes(handle);
            let header = NodeHeader::decode(bytes);
            if let Some(region) = bytes.get(header.value_range()) {
                let n = region.len().min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&region[..n]);
                filled += n;
            }
            node = header.next;
        }

        filled
    }

    /// Total value length of a chain.
    pub fn value_len(&self, item: ItemRef) -> usize {
        self.headers(item).map(|h| h.value_range().len()).sum()
    }

    /// Number of nodes in a chain.
    pub fn node_count(&self, item: ItemRef) -> usize {
        self.headers(item).count()
    }

    fn headers(&self, item: ItemRef) -> impl Iterator<Item = NodeHeader> + '_ {
        let mut node = Some(item.0);
        std::iter::from_fn(move || {
            let handle = node?;
            let header = NodeHeader::decode(self.slabs.bytes(handle));
            node = header.next;
            Some(header)
        })
    }

    /// The key stored in the head node.
    pub fn key(&self, item: ItemRef) -> &[u8] {
        let bytes = self.slabs.bytes(item.0);
        let key_len = NodeHeader::decode(bytes).key_len as usize;
        bytes
            .get(NODE_HEADER_SIZE..NODE_HEADER_SIZE + key_len)
            .unwrap_or_default()
    }

    /// Exact (length, bytes) key comparison.
    pub fn key_matches(&self, item: ItemRef, key: &[u8]) -> bool {
        self.key(item) == key
    }

    /// Current reference count of a chain head.
    pub fn refcount(&self, item: ItemRef) -> u16 {
        NodeHeader::decode(self.slabs.bytes(item.0)).refcount
    }

    /// Takes a reference on a chain. Returns the new count.
    pub fn acquire(&mut self, item: ItemRef) -> StoreResult<u16> {
        let bytes = self.slabs.bytes_mut(item.0);
        let mut header = NodeHeader::decode(bytes);
        header.refcount = header
            .refcount
            .checked_add(1)
            .ok_or_else(|| StoreError::Internal("reference count overflow".to_string()))?;
        header.encode(bytes);
        Ok(header.refcount)
    }

    /// Drops a reference on a chain, retiring it once the count reaches zero.
    /// Returns the new count.
    pub fn release(&mut self, item: ItemRef) -> u16 {
        let bytes = self.slabs.bytes_mut(item.0);
        let mut header = NodeHeader::decode(bytes);
        header.refcount = header.refcount.saturating_sub(1);
        header.encode(bytes);

        if header.refcount == 0 {
            self.retire(item);
        }
        header.refcount
    }

    /// Parks an unreferenced chain on the retirement queue. A full queue is
    /// reclaimed immediately.
    pub fn retire(&mut self, item: ItemRef) {
        if self.retired.push(item) {
            trace!(capacity = self.retired.capacity(), "Retirement queue full");
            self.shrink();
        }
    }

    /// Frees a chain that was never published. Skips the retirement queue.
    pub fn discard(&mut self, item: ItemRef) {
        free_chain(&mut self.slabs, item.0);
        self.live_chains = self.live_chains.saturating_sub(1);
    }

    /// Returns every node of every retired chain to its size class.
    /// Returns the number of chains reclaimed.
    pub fn shrink(&mut self) -> usize {
        let mut chains = 0;
        for head in self.retired.drain() {
            free_chain(&mut self.slabs, head.0);
            chains += 1;
        }
        self.live_chains = self.live_chains.saturating_sub(chains);
        chains
    }

    /// Chains waiting on the retirement queue.
    pub fn retired(&self) -> usize {
        self.retired.len()
    }

    /// Chains created and not yet reclaimed.
    pub fn live_chains(&self) -> usize {
        self.live_chains
    }

    pub fn slab_stats(&self) -> SlabStats {
        self.slabs.stats()
    }

    /// Destroys every slab. All outstanding [`ItemRef`]s become invalid.
    pub fn teardown(&mut self) -> usize {
        self.retired.drain().for_each(drop);
        self.live_chains = 0;
        self.slabs.teardown()
    }
}

/// Walks a chain node by node, releasing each to its size class.
fn free_chain(slabs: &mut SlabAllocator, head: SlotHandle) -> usize {
    let mut freed = 0;
    let mut node = Some(head);
    while let Some(handle) = node {
        node = NodeHeader::decode(slabs.bytes(handle)).next;
        slabs.release(handle);
        freed += 1;
    }
    freed
}
