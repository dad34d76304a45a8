//! Sparse Three-Level Hash Index
//!
//! Maps a 32-bit key digest to the head of an item chain. The digest is
//! split into three slices, each selecting a slot one level deeper:
//!
//! ```text
//!   digest:  [ 31 ........ 22 | 21 ........ 12 | 11 ......... 0 ]
//!                  top (1024)       mid (1024)     leaf (% 128)
//!
//!   top ──> mid table ──> leaf table ──> bucket head ──> entry <──> entry
//! ```
//!
//! Mid and leaf tables are materialized on first use, so a sparse key
//! space never pays for tables it does not touch. Each bucket is a doubly
//! linked list of entries; entries live in an arena and are linked by id.
//!
//! The index never compares keys itself. Lookups take a predicate that
//! tells whether the chain behind an entry holds the wanted key, because
//! only the item store can read it.

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::item::ItemRef;
use std::hash::{DefaultHasher, Hash, Hasher};

/// Slots in the top-level table
pub const TOP_SLOTS: usize = 1024;
/// Slots in each mid-level table
pub const MID_SLOTS: usize = 1024;
/// Bucket heads in each leaf table
pub const LEAF_SLOTS: usize = 128;

/// Computes the 32-bit digest of a key.
#[inline]
pub fn digest(key: &[u8]) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

/// Arena id of an index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u32);

/// Position of a bucket head, valid until the index is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRef {
    top: usize,
    mid: usize,
    leaf: usize,
}

impl BucketRef {
    fn for_digest(digest: u32) -> Self {
        Self {
            top: ((digest >> 22) & 0x3FF) as usize,
            mid: ((digest >> 12) & 0x3FF) as usize,
            leaf: ((digest & 0xFFF) as usize) % LEAF_SLOTS,
        }
    }
}

/// Result of [`Index::locate_or_prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    /// The entry holding the key, if any
    pub entry: Option<EntryId>,
    /// Where a new entry for this digest would be spliced in. `None` when
    /// the tables were not materialized and creation was not requested.
    pub bucket: Option<BucketRef>,
}

#[derive(Debug)]
struct IndexEntry {
    digest: u32,
    item: ItemRef,
    prev: Option<EntryId>,
    next: Option<EntryId>,
}

type LeafTable = Box<[Option<EntryId>]>;
type MidTable = Box<[Option<LeafTable>]>;

/// Allocates a table of `len` empty slots, reporting exhaustion instead of aborting.
fn alloc_table<T>(len: usize) -> StoreResult<Box<[Option<T>]>> {
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(len)
        .map_err(|_| StoreError::OutOfSpace)?;
    slots.resize_with(len, || None);
    Ok(slots.into_boxed_slice())
}

/// The key index.
#[derive(Debug)]
pub struct Index {
    top: Vec<Option<MidTable>>,
    entries: Vec<Option<IndexEntry>>,
    vacant: Vec<u32>,
    len: usize,
    tables: usize,
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

impl Index {
    pub fn new() -> Self {
        let mut top = Vec::with_capacity(TOP_SLOTS);
        top.resize_with(TOP_SLOTS, || None);
        Self {
            top,
            entries: Vec::new(),
            vacant: Vec::new(),
            len: 0,
            tables: 0,
        }
    }

    fn entry(&self, id: EntryId) -> Option<&IndexEntry> {
        self.entries.get(id.0 as usize)?.as_ref()
    }

    fn entry_mut(&mut self, id: EntryId) -> Option<&mut IndexEntry> {
        self.entries.get_mut(id.0 as usize)?.as_mut()
    }

    fn head(&self, bucket: BucketRef) -> Option<EntryId> {
        let mid = self.top[bucket.top].as_ref()?;
        let leaf = mid[bucket.mid].as_ref()?;
        leaf[bucket.leaf]
    }

    fn head_slot(&mut self, bucket: BucketRef) -> Option<&mut Option<EntryId>> {
        let mid = self.top[bucket.top].as_mut()?;
        let leaf = mid[bucket.mid].as_mut()?;
        Some(&mut leaf[bucket.leaf])
    }

    fn scan<F>(&self, mut cursor: Option<EntryId>, digest: u32, matches: F) -> Option<EntryId>
    where
        F: Fn(ItemRef) -> bool,
    {
        while let Some(id) = cursor {
            let entry = self.entry(id)?;
            if entry.digest == digest && matches(entry.item) {
                return Some(id);
            }
            cursor = entry.next;
        }
        None
    }

    /// Finds the entry whose digest equals `digest` and whose chain
    /// satisfies `matches`.
    pub fn find<F>(&self, digest: u32, matches: F) -> Option<EntryId>
    where
        F: Fn(ItemRef) -> bool,
    {
        let head = self.head(BucketRef::for_digest(digest));
        self.scan(head, digest, matches)
    }

    /// Finds the entry for a key and returns the bucket a new entry would
    /// go in. With `create_missing`, absent tables along the path are
    /// materialized so the bucket reference is always present.
    pub fn locate_or_prepare<F>(
        &mut self,
        digest: u32,
        create_missing: bool,
        matches: F,
    ) -> StoreResult<Located>
    where
        F: Fn(ItemRef) -> bool,
    {
        let bucket = BucketRef::for_digest(digest);

        if create_missing {
            self.materialize(bucket)?;
        } else if self.head_slot(bucket).is_none() {
            return Ok(Located {
                entry: None,
                bucket: None,
            });
        }

        let entry = self.scan(self.head(bucket), digest, matches);
        Ok(Located {
            entry,
            bucket: Some(bucket),
        })
    }

    fn materialize(&mut self, bucket: BucketRef) -> StoreResult<()> {
        if self.top[bucket.top].is_none() {
            self.top[bucket.top] = Some(alloc_table(MID_SLOTS)?);
            self.tables += 1;
        }
        if let Some(mid) = self.top[bucket.top].as_mut() {
            if mid[bucket.mid].is_none() {
                mid[bucket.mid] = Some(alloc_table(LEAF_SLOTS)?);
                self.tables += 1;
            }
        }
        Ok(())
    }

    /// Splices a new entry at the head of `bucket`.
    pub fn insert(&mut self, digest: u32, item: ItemRef, bucket: BucketRef) -> StoreResult<EntryId> {
        let old_head = self
            .head_slot(bucket)
            .ok_or_else(|| StoreError::Internal("bucket not materialized".to_string()))?
            .take();

        let entry = IndexEntry {
            digest,
            item,
            prev: None,
            next: old_head,
        };
        let id = match self.vacant.pop() {
            Some(slot) => {
                self.entries[slot as usize] = Some(entry);
                EntryId(slot)
            }
            None => {
                let slot = u32::try_from(self.entries.len()).map_err(|_| StoreError::OutOfSpace);
                let pushed = slot.and_then(|slot| {
                    self.entries
                        .try_reserve(1)
                        .map_err(|_| StoreError::OutOfSpace)?;
                    self.entries.push(Some(entry));
                    Ok(EntryId(slot))
                });
                match pushed {
                    Ok(id) => id,
                    Err(e) => {
                        if let Some(head) = self.head_slot(bucket) {
                            *head = old_head;
                        }
                        return Err(e);
                    }
                }
            }
        };

        if let Some(next) = old_head.and_then(|next| self.entry_mut(next)) {
            next.prev = Some(id);
        }
        if let Some(head) = self.head_slot(bucket) {
            *head = Some(id);
        }
        self.len += 1;
        Ok(id)
    }

    /// Unlinks an entry from `bucket` and returns the chain it referenced.
    pub fn remove(&mut self, id: EntryId, bucket: BucketRef) -> Option<ItemRef> {
        let entry = self.entries.get_mut(id.0 as usize)?.take()?;

        match entry.prev {
            Some(prev) => {
                if let Some(prev) = self.entry_mut(prev) {
                    prev.next = entry.next;
                }
            }
            None => {
                if let Some(head) = self.head_slot(bucket) {
                    *head = entry.next;
                }
            }
        }
        if let Some(next) = entry.next.and_then(|next| self.entry_mut(next)) {
            next.prev = entry.prev;
        }

        self.vacant.push(id.0);
        self.len -= 1;
        Some(entry.item)
    }

    /// The chain an entry points at.
    pub fn item(&self, id: EntryId) -> Option<ItemRef> {
        self.entry(id).map(|e| e.item)
    }

    /// Points an entry at a new chain, returning the previous one.
    pub fn swap_item(&mut self, id: EntryId, item: ItemRef) -> Option<ItemRef> {
        let entry = self.entry_mut(id)?;
        Some(std::mem::replace(&mut entry.item, item))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of materialized mid and leaf tables.
    pub fn tables(&self) -> usize {
        self.tables
    }

    /// Releases every table and entry, returning the chains they referenced.
    pub fn drain(&mut self) -> Vec<ItemRef> {
        let items = self.entries.drain(..).flatten().map(|e| e.item).collect();
        self.vacant.clear();
        self.top.iter_mut().for_each(|slot| *slot = None);
        self.len = 0;
        self.tables = 0;
        items
    }
}
