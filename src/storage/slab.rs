//! Size-Classed Slab Allocator
//!
//! Objects are carved out of fixed-size slabs. Each power-of-two object size
//! between [`MIN_OBJECT_SIZE`] and [`MAX_OBJECT_SIZE`] is a *size class* that
//! owns its own slabs for their whole lifetime.
//!
//! ## Layout
//!
//! ```text
//! SlabAllocator
//! ├── classes[0]  (16 B)    partial: [s3]   full: [s0 s1 s2]   free: [h h h]
//! ├── classes[1]  (32 B)    (created lazily on first use)
//! ├── ...
//! ├── classes[8]  (4096 B)
//! └── pool        free slabs, refilled SLAB_REFILL_BATCH at a time
//! ```
//!
//! ## Allocation Order
//!
//! 1. Pop a recycled slot from the class's free-object list.
//! 2. Otherwise bump the offset of the slab currently being filled.
//!    When it reaches the edge, the slab moves from the partial list to the
//!    full list.
//! 3. Otherwise take a fresh slab from the global pool, refilling the pool
//!    from the system allocator when it runs dry.
//!
//! Releasing a slot never frees memory: the slot goes onto the free-object
//! list of its class. Slabs are only destroyed by [`SlabAllocator::teardown`]
//! (or when the allocator is dropped).
//!
//! Slots are addressed by [`SlotHandle`] (class, slab, slot) rather than by
//! pointer, so a slab's memory can move freely while handles stay valid.

use crate::storage::error::{StoreError, StoreResult};
use tracing::{debug, trace};

/// Smallest size class is `1 << MIN_CLASS_POWER` bytes.
pub const MIN_CLASS_POWER: u32 = 4;

/// Largest size class is `1 << MAX_CLASS_POWER` bytes.
pub const MAX_CLASS_POWER: u32 = 12;

/// Smallest object size handed out by the allocator
pub const MIN_OBJECT_SIZE: usize = 1 << MIN_CLASS_POWER;

/// Largest object size handed out by the allocator
pub const MAX_OBJECT_SIZE: usize = 1 << MAX_CLASS_POWER;

/// Number of size classes
pub const NUM_CLASSES: usize = (MAX_CLASS_POWER - MIN_CLASS_POWER + 1) as usize;

/// Total size of one slab (two 4 KiB pages)
pub const SLAB_SIZE: usize = 2 * 4096;

/// Number of slabs the global pool acquires each time it runs dry
pub const SLAB_REFILL_BATCH: usize = 8;

/// Returns the object size of a size class.
#[inline]
pub fn object_size(class: usize) -> usize {
    1 << (class as u32 + MIN_CLASS_POWER)
}

/// Maps a requested size to its size class.
///
/// The size is rounded up to the next power of two, and anything below the
/// minimum lands in the smallest class. Returns `None` for zero and for sizes
/// above [`MAX_OBJECT_SIZE`].
pub fn class_for_size(size: usize) -> Option<usize> {
    if size == 0 || size > MAX_OBJECT_SIZE {
        return None;
    }
    let power = size.next_power_of_two().trailing_zeros().max(MIN_CLASS_POWER);
    Some((power - MIN_CLASS_POWER) as usize)
}

/// Address of one slot: size class, slab within the class, slot within the slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    class: u8,
    slab: u32,
    slot: u16,
}

impl SlotHandle {
    /// Packed value that never corresponds to a real handle.
    pub const NONE: u64 = u64::MAX;

    fn new(class: usize, slab: u32, slot: u16) -> Self {
        Self {
            class: class as u8,
            slab,
            slot,
        }
    }

    /// The size class this slot belongs to.
    #[inline]
    pub fn class(&self) -> usize {
        self.class as usize
    }

    /// Size in bytes of the slot.
    #[inline]
    pub fn object_size(&self) -> usize {
        object_size(self.class())
    }

    /// Packs the handle into a `u64` for storage inside object memory.
    #[inline]
    pub fn pack(&self) -> u64 {
        (u64::from(self.class) << 48) | (u64::from(self.slab) << 16) | u64::from(self.slot)
    }

    /// Reverses [`SlotHandle::pack`]. [`SlotHandle::NONE`] unpacks to `None`.
    #[inline]
    pub fn unpack(raw: u64) -> Option<Self> {
        if raw == Self::NONE {
            return None;
        }
        Some(Self {
            class: (raw >> 48) as u8,
            slab: (raw >> 16) as u32,
            slot: raw as u16,
        })
    }
}

/// One contiguous region, filled front to back.
#[derive(Debug)]
struct Slab {
    memory: Box<[u8]>,
    /// End of the used space in the slab
    offset: usize,
}

/// All slabs and recycled slots of one object size.
#[derive(Debug)]
struct SizeClass {
    index: usize,
    object_size: usize,
    /// Last usable byte boundary: a whole number of objects
    edge: usize,
    slabs: Vec<Slab>,
    /// Slabs with room left; the last one is being filled
    partial: Vec<u32>,
    full: Vec<u32>,
    free_objects: Vec<SlotHandle>,
    in_use: usize,
}

impl SizeClass {
    fn new(index: usize) -> Self {
        let object_size = object_size(index);
        Self {
            index,
            object_size,
            edge: (SLAB_SIZE / object_size) * object_size,
            slabs: Vec::new(),
            partial: Vec::new(),
            full: Vec::new(),
            free_objects: Vec::new(),
            in_use: 0,
        }
    }

    fn allocate(&mut self, pool: &mut SlabPool) -> StoreResult<SlotHandle> {
        if let Some(handle) = self.free_objects.pop() {
            self.in_use += 1;
            return Ok(handle);
        }

        let slab_id = match self.partial.last() {
            Some(&id) => id,
            None => {
                let id = u32::try_from(self.slabs.len()).map_err(|_| StoreError::OutOfSpace)?;
                let memory = pool.take()?;
                self.slabs.push(Slab { memory, offset: 0 });
                self.partial.push(id);
                trace!(class = self.index, slab = id, "Size class acquired a slab");
                id
            }
        };

        let slab = &mut self.slabs[slab_id as usize];
        let slot = (slab.offset / self.object_size) as u16;
        slab.offset += self.object_size;

        if slab.offset >= self.edge {
            self.partial.pop();
            self.full.push(slab_id);
        }

        self.in_use += 1;
        Ok(SlotHandle::new(self.index, slab_id, slot))
    }

    fn release(&mut self, handle: SlotHandle) {
        debug_assert!(!self.free_objects.contains(&handle), "double release");
        self.free_objects.push(handle);
        self.in_use = self.in_use.saturating_sub(1);
    }

    fn range(&self, handle: SlotHandle) -> (usize, std::ops::Range<usize>) {
        let start = handle.slot as usize * self.object_size;
        (handle.slab as usize, start..start + self.object_size)
    }

    fn stats(&self) -> ClassStats {
        ClassStats {
            object_size: self.object_size,
            slabs: self.slabs.len(),
            partial_slabs: self.partial.len(),
            full_slabs: self.full.len(),
            free_objects: self.free_objects.len(),
            in_use: self.in_use,
        }
    }
}

/// Global pool of slabs not yet owned by any size class.
#[derive(Debug, Default)]
struct SlabPool {
    free: Vec<Box<[u8]>>,
    /// Slabs ever acquired from the system and not yet destroyed
    created: usize,
    limit: Option<usize>,
}

impl SlabPool {
    fn new(limit: Option<usize>) -> Self {
        Self {
            free: Vec::new(),
            created: 0,
            limit,
        }
    }

    fn take(&mut self) -> StoreResult<Box<[u8]>> {
        if self.free.is_empty() {
            self.refill();
        }
        self.free.pop().ok_or(StoreError::OutOfSpace)
    }

    fn refill(&mut self) {
        for _ in 0..SLAB_REFILL_BATCH {
            if self.limit.is_some_and(|limit| self.created >= limit) {
                break;
            }
            match alloc_slab() {
                Some(memory) => {
                    self.free.push(memory);
                    self.created += 1;
                }
                None => break,
            }
        }
        debug!(
            pooled = self.free.len(),
            created = self.created,
            "Slab pool refilled"
        );
    }

    fn destroy(&mut self, count: usize) {
        self.created = self.created.saturating_sub(count);
    }

    fn clear(&mut self) -> usize {
        let count = self.free.len();
        self.free.clear();
        self.destroy(count);
        count
    }
}

/// Acquires one zeroed slab from the system allocator without aborting on failure.
fn alloc_slab() -> Option<Box<[u8]>> {
    let mut memory = Vec::new();
    memory.try_reserve_exact(SLAB_SIZE).ok()?;
    memory.resize(SLAB_SIZE, 0);
    Some(memory.into_boxed_slice())
}

/// The slab allocator: one lazily created size class per power of two,
/// fed by a shared pool of free slabs.
#[derive(Debug)]
pub struct SlabAllocator {
    classes: [Option<SizeClass>; NUM_CLASSES],
    pool: SlabPool,
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SlabAllocator {
    /// Creates an allocator. With `max_slabs`, no more than that many slabs
    /// are ever held at once, and allocation beyond it fails with
    /// [`StoreError::OutOfSpace`].
    pub fn new(max_slabs: Option<usize>) -> Self {
        Self {
            classes: std::array::from_fn(|_| None),
            pool: SlabPool::new(max_slabs),
        }
    }

    /// Allocates a slot large enough for `size` bytes.
    pub fn allocate(&mut self, size: usize) -> StoreResult<SlotHandle> {
        let class = class_for_size(size).ok_or(StoreError::OutOfSpace)?;
        self.allocate_in(class)
    }

    /// Allocates a slot from a specific size class.
    pub fn allocate_in(&mut self, class: usize) -> StoreResult<SlotHandle> {
        if class >= NUM_CLASSES {
            return Err(StoreError::OutOfSpace);
        }
        let pool = &mut self.pool;
        let size_class = self.classes[class].get_or_insert_with(|| {
            debug!(class, object_size = object_size(class), "Size class created");
            SizeClass::new(class)
        });
        size_class.allocate(pool)
    }

    /// Returns a slot to its class's free-object list. O(1), never frees memory.
    pub fn release(&mut self, handle: SlotHandle) {
        if let Some(size_class) = self
            .classes
            .get_mut(handle.class())
            .and_then(Option::as_mut)
        {
            size_class.release(handle);
        }
    }

    /// The bytes of a slot. Unknown handles yield an empty slice.
    pub fn bytes(&self, handle: SlotHandle) -> &[u8] {
        match self.classes.get(handle.class()).and_then(Option::as_ref) {
            Some(size_class) => {
                let (slab, range) = size_class.range(handle);
                size_class
                    .slabs
                    .get(slab)
                    .and_then(|s| s.memory.get(range))
                    .unwrap_or_default()
            }
            None => &[],
        }
    }

    /// The bytes of a slot, mutably. Unknown handles yield an empty slice.
    pub fn bytes_mut(&mut self, handle: SlotHandle) -> &mut [u8] {
        match self.classes.get_mut(handle.class()).and_then(Option::as_mut) {
            Some(size_class) => {
                let (slab, range) = size_class.range(handle);
                size_class
                    .slabs
                    .get_mut(slab)
                    .and_then(|s| s.memory.get_mut(range))
                    .unwrap_or_default()
            }
            None => Default::default(),
        }
    }

    /// Per-class accounting, or `None` if the class was never used.
    pub fn class_stats(&self, class: usize) -> Option<ClassStats> {
        self.classes
            .get(class)
            .and_then(Option::as_ref)
            .map(SizeClass::stats)
    }

    /// Allocator-wide accounting.
    pub fn stats(&self) -> SlabStats {
        let mut stats = SlabStats {
            pooled_slabs: self.pool.free.len(),
            ..SlabStats::default()
        };
        for size_class in self.classes.iter().flatten() {
            stats.classes += 1;
            stats.slabs += size_class.slabs.len();
            stats.full_slabs += size_class.full.len();
            stats.slots_in_use += size_class.in_use;
            stats.free_slots += size_class.free_objects.len();
            stats.bytes_in_use += size_class.in_use * size_class.object_size;
        }
        stats
    }

    /// Destroys every slab owned by every size class, then the pool.
    ///
    /// Returns the number of slabs destroyed. Every outstanding handle is
    /// invalid afterwards.
    pub fn teardown(&mut self) -> usize {
        let mut destroyed = 0;
        for slot in self.classes.iter_mut() {
            if let Some(size_class) = slot.take() {
                destroyed += size_class.slabs.len();
            }
        }
        self.pool.destroy(destroyed);
        destroyed += self.pool.clear();
        debug!(slabs = destroyed, "Slab allocator torn down");
        destroyed
    }
}

/// Accounting for one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    /// Object size of the class
    pub object_size: usize,
    /// Slabs owned by the class
    pub slabs: usize,
    /// Slabs still being filled
    pub partial_slabs: usize,
    /// Slabs with no room left
    pub full_slabs: usize,
    /// Recycled slots waiting for reuse
    pub free_objects: usize,
    /// Slots handed out and not released
    pub in_use: usize,
}

/// Allocator-wide accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabStats {
    /// Size classes created so far
    pub classes: usize,
    /// Slabs owned by size classes
    pub slabs: usize,
    /// Of those, slabs with no room left
    pub full_slabs: usize,
    /// Slabs in the global pool
    pub pooled_slabs: usize,
    /// Slots handed out and not released
    pub slots_in_use: usize,
    /// Recycled slots across all classes
    pub free_slots: usize,
    /// Object bytes handed out and not released
    pub bytes_in_use: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_for_size() {
        assert_eq!(class_for_size(0), None);
        assert_eq!(class_for_size(1), Some(0));
        assert_eq!(class_for_size(16), Some(0));
        assert_eq!(class_for_size(17), Some(1));
        assert_eq!(class_for_size(100), Some(3));
        assert_eq!(class_for_size(4096), Some(NUM_CLASSES - 1));
        assert_eq!(class_for_size(4097), None);
        assert_eq!(object_size(NUM_CLASSES - 1), MAX_OBJECT_SIZE);
    }

    #[test]
    fn test_handle_packing() {
        let handle = SlotHandle::new(8, 70_000, 511);
        assert_eq!(SlotHandle::unpack(handle.pack()), Some(handle));
        assert_eq!(SlotHandle::unpack(SlotHandle::NONE), None);
        assert_eq!(handle.object_size(), 4096);
    }

    #[test]
    fn test_bump_allocation_gives_distinct_slots() {
        let mut slabs = SlabAllocator::default();

        let a = slabs.allocate(20).unwrap();
        let b = slabs.allocate(20).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.class(), 1);

        slabs.bytes_mut(a).fill(0xAA);
        slabs.bytes_mut(b).fill(0xBB);
        assert!(slabs.bytes(a).iter().all(|&x| x == 0xAA));
        assert!(slabs.bytes(b).iter().all(|&x| x == 0xBB));
        assert_eq!(slabs.bytes(a).len(), 32);
    }

    #[test]
    fn test_released_slot_is_reused() {
        let mut slabs = SlabAllocator::default();

        let a = slabs.allocate(64).unwrap();
        let _b = slabs.allocate(64).unwrap();
        slabs.release(a);

        let stats = slabs.class_stats(2).unwrap();
        assert_eq!(stats.free_objects, 1);
        assert_eq!(stats.in_use, 1);

        assert_eq!(slabs.allocate(64).unwrap(), a);
        assert_eq!(slabs.class_stats(2).unwrap().free_objects, 0);
    }

    #[test]
    fn test_full_slab_moves_to_full_list() {
        let mut slabs = SlabAllocator::default();
        let per_slab = SLAB_SIZE / MAX_OBJECT_SIZE;

        for _ in 0..per_slab {
            slabs.allocate(MAX_OBJECT_SIZE).unwrap();
        }
        let stats = slabs.class_stats(NUM_CLASSES - 1).unwrap();
        assert_eq!(stats.slabs, 1);
        assert_eq!(stats.full_slabs, 1);
        assert_eq!(stats.partial_slabs, 0);

        slabs.allocate(MAX_OBJECT_SIZE).unwrap();
        let stats = slabs.class_stats(NUM_CLASSES - 1).unwrap();
        assert_eq!(stats.slabs, 2);
        assert_eq!(stats.partial_slabs, 1);
    }

    #[test]
    fn test_pool_refills_in_batches() {
        let mut slabs = SlabAllocator::default();
        slabs.allocate(16).unwrap();

        let stats = slabs.stats();
        assert_eq!(stats.slabs, 1);
        assert_eq!(stats.pooled_slabs, SLAB_REFILL_BATCH - 1);

        // A second class draws from the same pool without a refill.
        slabs.allocate(2048).unwrap();
        assert_eq!(slabs.stats().pooled_slabs, SLAB_REFILL_BATCH - 2);
    }

    #[test]
    fn test_size_classes_created_lazily() {
        let mut slabs = SlabAllocator::default();
        assert_eq!(slabs.stats().classes, 0);
        assert!(slabs.class_stats(0).is_none());

        slabs.allocate(1).unwrap();
        assert_eq!(slabs.stats().classes, 1);
        assert!(slabs.class_stats(0).is_some());
    }

    #[test]
    fn test_out_of_range_requests_fail() {
        let mut slabs = SlabAllocator::default();
        assert_eq!(slabs.allocate(0), Err(StoreError::OutOfSpace));
        assert_eq!(
            slabs.allocate(MAX_OBJECT_SIZE + 1),
            Err(StoreError::OutOfSpace)
        );
        assert_eq!(slabs.allocate_in(NUM_CLASSES), Err(StoreError::OutOfSpace));
        assert_eq!(slabs.stats(), SlabStats::default());
    }

    #[test]
    fn test_slab_limit_surfaces_out_of_space() {
        let mut slabs = SlabAllocator::new(Some(1));
        let per_slab = SLAB_SIZE / MAX_OBJECT_SIZE;

        for _ in 0..per_slab {
            slabs.allocate(MAX_OBJECT_SIZE).unwrap();
        }
        assert_eq!(
            slabs.allocate(MAX_OBJECT_SIZE),
            Err(StoreError::OutOfSpace)
        );

        // The failed attempt left nothing half-committed.
        let stats = slabs.stats();
        assert_eq!(stats.slabs, 1);
        assert_eq!(stats.slots_in_use, per_slab);

        // Another class cannot grow past the limit either.
        let handle = slabs.allocate(16);
        assert_eq!(handle, Err(StoreError::OutOfSpace));
    }

    #[test]
    fn test_stats_track_bytes_in_use() {
        let mut slabs = SlabAllocator::default();
        let a = slabs.allocate(100).unwrap();
        let b = slabs.allocate(1000).unwrap();

        let stats = slabs.stats();
        assert_eq!(stats.slots_in_use, 2);
        assert_eq!(stats.bytes_in_use, 128 + 1024);

        slabs.release(a);
        slabs.release(b);
        let stats = slabs.stats();
        assert_eq!(stats.slots_in_use, 0);
        assert_eq!(stats.bytes_in_use, 0);
        assert_eq!(stats.free_slots, 2);
    }

    #[test]
    fn test_teardown_destroys_everything() {
        let mut slabs = SlabAllocator::default();
        slabs.allocate(16).unwrap();
        slabs.allocate(4096).unwrap();

        let destroyed = slabs.teardown();
        assert_eq!(destroyed, SLAB_REFILL_BATCH);
        assert_eq!(slabs.stats(), SlabStats::default());
        assert_eq!(slabs.pool.created, 0);
    }
}
