//! Key/Value Storage Engine
//!
//! The engine composes the [`Index`] and the [`ItemStore`] into the six
//! storage operations: `get`, `set`, `add`, `replace`, `delete`, `shrink`.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                        Engine                        │
//! │  ┌────────────────── Mutex<Store> ────────────────┐  │
//! │  │  Index ──(entry → chain head)──> ItemStore     │  │
//! │  │                                  ├ SlabAllocator│  │
//! │  │                                  └ Retirement  │  │
//! │  └────────────────────────────────────────────────┘  │
//! │  op counters (atomics, outside the lock)             │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation, `shrink` included, runs under the one mutation lock,
//! so the index and the item store carry no locking of their own. A new
//! chain is always fully written and referenced before the chain it
//! supersedes is released, so readers only ever observe a complete value.
//!
//! ## Signed Entry Points
//!
//! [`engine_get`] and friends wrap the typed API in the signed convention
//! used by byte-buffer adapters: a non-negative length on success, or a
//! negative errno-style code (see [`StoreError::errno`]).

use crate::storage::error::{to_signed, StoreError, StoreResult};
use crate::storage::index::{digest, EntryId, Index, Located};
use crate::storage::item::{ItemRef, ItemStore};
use crate::storage::retire::DEFAULT_RETIRE_CAPACITY;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Retired chains held before reclamation is forced
    pub retire_capacity: usize,
    /// Upper bound on slabs held by the allocator (`None` = unbounded)
    pub max_slabs: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retire_capacity: DEFAULT_RETIRE_CAPACITY,
            max_slabs: None,
        }
    }
}

/// Everything the mutation lock protects.
#[derive(Debug)]
struct Store {
    items: ItemStore,
    index: Index,
}

impl Store {
    fn locate(&mut self, key: &[u8], create_missing: bool) -> StoreResult<Located> {
        let Store { items, index } = self;
        index.locate_or_prepare(digest(key), create_missing, |item| {
            items.key_matches(item, key)
        })
    }

    fn find_entry(&self, key: &[u8]) -> Option<EntryId> {
        self.index
            .find(digest(key), |item| self.items.key_matches(item, key))
    }

    fn find(&self, key: &[u8]) -> Option<ItemRef> {
        self.find_entry(key).and_then(|id| self.index.item(id))
    }

    /// Publishes a fresh chain under a new index entry.
    fn insert_new(&mut self, key: &[u8], item: ItemRef, located: Located) -> StoreResult<()> {
        let Some(bucket) = located.bucket else {
            self.items.discard(item);
            return Err(StoreError::Internal("bucket not prepared".to_string()));
        };
        if let Err(e) = self.items.acquire(item) {
            self.items.discard(item);
            return Err(e);
        }
        if let Err(e) = self.index.insert(digest(key), item, bucket) {
            self.items.discard(item);
            return Err(e);
        }
        Ok(())
    }

    /// Points an existing entry at a fresh chain. The new chain is
    /// referenced before the old one is released.
    fn swap(&mut self, id: EntryId, item: ItemRef) -> StoreResult<()> {
        if let Err(e) = self.items.acquire(item) {
            self.items.discard(item);
            return Err(e);
        }
        match self.index.swap_item(id, item) {
            Some(old) => {
                self.items.release(old);
                Ok(())
            }
            None => {
                self.items.discard(item);
                Err(StoreError::Internal("index entry vanished".to_string()))
            }
        }
    }

    /// Releases every entry and chain, then destroys all slabs.
    fn teardown(&mut self) -> (usize, usize) {
        let heads = self.index.drain();
        let entries = heads.len();
        for head in heads {
            self.items.release(head);
        }
        self.items.shrink();
        (entries, self.items.teardown())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let (entries, slabs) = self.teardown();
        debug!(entries, slabs, "Engine torn down");
    }
}

/// Snapshot of operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub keys: u64,
    pub get_ops: u64,
    pub set_ops: u64,
    pub add_ops: u64,
    pub replace_ops: u64,
    pub del_ops: u64,
    pub shrink_ops: u64,
    /// Operations that failed because the key was absent
    pub misses: u64,
    /// Chains handed back to the allocator by explicit shrinks
    pub reclaimed: u64,
}

/// Snapshot of memory held by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Slabs owned by size classes
    pub slabs: usize,
    /// Slabs waiting in the global pool
    pub pooled_slabs: usize,
    pub slots_in_use: usize,
    pub free_slots: usize,
    pub bytes_in_use: usize,
    /// Chains created and not yet reclaimed
    pub live_chains: usize,
    /// Chains waiting on the retirement queue
    pub retired: usize,
    pub index_entries: usize,
    /// Materialized mid and leaf index tables
    pub index_tables: usize,
}

/// The storage engine.
///
/// Designed to be wrapped in an `Arc` and shared by every session and
/// by the background reclaimer. All operations are thread-safe.
///
/// # Example
///
/// ```
/// use kkv::storage::{Engine, StoreError};
///
/// let engine = Engine::new();
/// engine.set(b"name", b"Ariz").unwrap();
///
/// let mut buf = [0u8; 16];
/// let n = engine.get(b"name", &mut buf).unwrap();
/// assert_eq!(&buf[..n], b"Ariz");
///
/// assert_eq!(engine.add(b"name", b"x"), Err(StoreError::AlreadyExists));
/// ```
pub struct Engine {
    store: Mutex<Store>,
    get_count: AtomicU64,
    set_count: AtomicU64,
    add_count: AtomicU64,
    replace_count: AtomicU64,
    del_count: AtomicU64,
    shrink_count: AtomicU64,
    miss_count: AtomicU64,
    reclaimed_count: AtomicU64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("get_count", &self.get_count.load(Ordering::Relaxed))
            .field("set_count", &self.set_count.load(Ordering::Relaxed))
            .field("del_count", &self.del_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn check_key(key: &[u8]) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidRequest("empty key".to_string()));
    }
    Ok(())
}

impl Engine {
    /// Creates an engine with default settings.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            store: Mutex::new(Store {
                items: ItemStore::new(config.retire_capacity, config.max_slabs),
                index: Index::new(),
            }),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            add_count: AtomicU64::new(0),
            replace_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            shrink_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
            reclaimed_count: AtomicU64::new(0),
        }
    }

    fn miss(&self) -> StoreError {
        self.miss_count.fetch_add(1, Ordering::Relaxed);
        StoreError::NotFound
    }

    /// Copies the value stored under `key` into `buf`.
    ///
    /// Returns the number of bytes copied, which is less than the value
    /// length when `buf` is shorter.
    pub fn get(&self, key: &[u8], buf: &mut [u8]) -> StoreResult<usize> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        check_key(key)?;

        let store = self.store.lock();
        match store.find(key) {
            Some(item) => Ok(store.items.read(item, buf)),
            None => Err(self.miss()),
        }
    }

    /// Returns the whole value stored under `key`.
    pub fn get_owned(&self, key: &[u8]) -> StoreResult<Bytes> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        check_key(key)?;

        let store = self.store.lock();
        let item = store.find(key).ok_or_else(|| self.miss())?;
        let mut value = vec![0u8; store.items.value_len(item)];
        let n = store.items.read(item, &mut value);
        value.truncate(n);
        Ok(Bytes::from(value))
    }

    /// Stores `value` under `key`, superseding any existing value.
    pub fn set(&self, key: &[u8], value: &[u8]) -> StoreResult<usize> {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        check_key(key)?;

        let mut store = self.store.lock();
        let item = store.items.create(key, value)?;
        let located = match store.locate(key, true) {
            Ok(located) => located,
            Err(e) => {
                store.items.discard(item);
                return Err(e);
            }
        };

        match located.entry {
            Some(id) => store.swap(id, item)?,
            None => store.insert_new(key, item, located)?,
        }
        Ok(0)
    }

    /// Stores `value` under `key` only if the key is absent.
    pub fn add(&self, key: &[u8], value: &[u8]) -> StoreResult<usize> {
        self.add_count.fetch_add(1, Ordering::Relaxed);
        check_key(key)?;

        let mut store = self.store.lock();
        let located = store.locate(key, true)?;
        if located.entry.is_some() {
            return Err(StoreError::AlreadyExists);
        }
        let item = store.items.create(key, value)?;
        store.insert_new(key, item, located)?;
        Ok(0)
    }

    /// Stores `value` under `key` only if the key is present.
    pub fn replace(&self, key: &[u8], value: &[u8]) -> StoreResult<usize> {
        self.replace_count.fetch_add(1, Ordering::Relaxed);
        check_key(key)?;

        let mut store = self.store.lock();
        let id = store.find_entry(key).ok_or_else(|| self.miss())?;
        let item = store.items.create(key, value)?;
        store.swap(id, item)?;
        Ok(0)
    }

    /// Removes `key`. Its chain is retired once unreferenced.
    pub fn delete(&self, key: &[u8]) -> StoreResult<usize> {
        self.del_count.fetch_add(1, Ordering::Relaxed);
        check_key(key)?;

        let mut store = self.store.lock();
        let located = store.locate(key, false)?;
        let (Some(id), Some(bucket)) = (located.entry, located.bucket) else {
            return Err(self.miss());
        };
        let item = store
            .index
            .remove(id, bucket)
            .ok_or_else(|| StoreError::Internal("index entry vanished".to_string()))?;
        store.items.release(item);
        Ok(0)
    }

    /// Reclaims every retired chain. Returns how many were reclaimed.
    pub fn shrink(&self) -> usize {
        self.shrink_count.fetch_add(1, Ordering::Relaxed);
        let reclaimed = self.store.lock().items.shrink();
        self.reclaimed_count
            .fetch_add(reclaimed as u64, Ordering::Relaxed);
        reclaimed
    }

    /// Chains waiting on the retirement queue.
    pub fn retired(&self) -> usize {
        self.store.lock().items.retired()
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.store.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            keys: self.len() as u64,
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            add_ops: self.add_count.load(Ordering::Relaxed),
            replace_ops: self.replace_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            shrink_ops: self.shrink_count.load(Ordering::Relaxed),
            misses: self.miss_count.load(Ordering::Relaxed),
            reclaimed: self.reclaimed_count.load(Ordering::Relaxed),
        }
    }

    pub fn memory_info(&self) -> MemoryInfo {
        let store = self.store.lock();
        let slabs = store.items.slab_stats();
        MemoryInfo {
            slabs: slabs.slabs,
            pooled_slabs: slabs.pooled_slabs,
            slots_in_use: slabs.slots_in_use,
            free_slots: slabs.free_slots,
            bytes_in_use: slabs.bytes_in_use,
            live_chains: store.items.live_chains(),
            retired: store.items.retired(),
            index_entries: store.index.len(),
            index_tables: store.index.tables(),
        }
    }
}

// ============================================================================
// Signed Entry Points
// ============================================================================

/// Reads the value of `key` into `value`. Returns bytes read or a negative code.
pub fn engine_get(engine: &Engine, key: &[u8], value: &mut [u8]) -> isize {
    to_signed(engine.get(key, value))
}

/// Returns 0 or a negative code.
pub fn engine_set(engine: &Engine, key: &[u8], value: &[u8]) -> isize {
    to_signed(engine.set(key, value))
}

/// Returns 0, or `-EEXIST` if the key is present.
pub fn engine_add(engine: &Engine, key: &[u8], value: &[u8]) -> isize {
    to_signed(engine.add(key, value))
}

/// Returns 0, or `-ENOENT` if the key is absent.
pub fn engine_replace(engine: &Engine, key: &[u8], value: &[u8]) -> isize {
    to_signed(engine.replace(key, value))
}

/// Returns 0, or `-ENOENT` if the key is absent.
pub fn engine_delete(engine: &Engine, key: &[u8]) -> isize {
    to_signed(engine.delete(key))
}

/// Always returns 0.
pub fn engine_shrink(engine: &Engine) -> isize {
    engine.shrink();
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::error::{EEXIST, ENOENT, ENOSPC};
    use crate::storage::slab::{SlabStats, MAX_OBJECT_SIZE};
    use std::sync::Arc;
    use std::thread;

    fn value_of(engine: &Engine, key: &[u8]) -> StoreResult<Bytes> {
        engine.get_owned(key)
    }

    #[test]
    fn test_get_missing() {
        let engine = Engine::new();
        let mut buf = [0u8; 8];
        assert_eq!(engine.get(b"nope", &mut buf), Err(StoreError::NotFound));
        assert_eq!(engine.stats().misses, 1);
    }

    #[test]
    fn test_set_and_get() {
        let engine = Engine::new();
        assert_eq!(engine.set(b"name", b"Ariz"), Ok(0));
        assert_eq!(value_of(&engine, b"name").unwrap(), Bytes::from("Ariz"));
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_set_overwrites() {
        let engine = Engine::new();
        engine.set(b"key", b"value1").unwrap();
        engine.set(b"key", b"value2").unwrap();

        assert_eq!(value_of(&engine, b"key").unwrap(), Bytes::from("value2"));
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.retired(), 1);
    }

    #[test]
    fn test_add() {
        let engine = Engine::new();
        engine.add(b"a", b"first").unwrap();

        assert_eq!(engine.add(b"a", b"second"), Err(StoreError::AlreadyExists));
        assert_eq!(value_of(&engine, b"a").unwrap(), Bytes::from("first"));
    }

    #[test]
    fn test_replace() {
        let engine = Engine::new();
        assert_eq!(engine.replace(b"b", b"y"), Err(StoreError::NotFound));
        assert!(engine.is_empty());

        engine.set(b"b", b"x").unwrap();
        engine.replace(b"b", b"y").unwrap();
        assert_eq!(value_of(&engine, b"b").unwrap(), Bytes::from("y"));
    }

    #[test]
    fn test_delete() {
        let engine = Engine::new();
        engine.set(b"gone", b"soon").unwrap();

        assert_eq!(engine.delete(b"gone"), Ok(0));
        assert_eq!(value_of(&engine, b"gone"), Err(StoreError::NotFound));
        assert_eq!(engine.delete(b"gone"), Err(StoreError::NotFound));
    }

    #[test]
    fn test_delete_untouched_region() {
        // Index tables for this digest were never materialized.
        let engine = Engine::new();
        assert_eq!(engine.delete(b"never"), Err(StoreError::NotFound));
        assert_eq!(engine.memory_info().index_tables, 0);
    }

    #[test]
    fn test_empty_key_rejected() {
        let engine = Engine::new();
        assert!(matches!(
            engine.set(b"", b"v"),
            Err(StoreError::InvalidRequest(_))
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(
            engine.get(b"", &mut buf),
            Err(StoreError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_oversized_key() {
        let engine = Engine::new();
        let key = vec![b'k'; MAX_OBJECT_SIZE];
        assert_eq!(engine.set(&key, b"v"), Err(StoreError::OutOfSpace));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_value_sizes_round_trip() {
        let engine = Engine::new();
        let sizes = [1, MAX_OBJECT_SIZE, MAX_OBJECT_SIZE * 7 / 2];

        for (n, size) in sizes.into_iter().enumerate() {
            let key = format!("key{}", n);
            let value: Vec<u8> = (0..size).map(|i| (i * 31 % 256) as u8).collect();
            engine.set(key.as_bytes(), &value).unwrap();
            assert_eq!(&value_of(&engine, key.as_bytes()).unwrap()[..], &value[..]);
        }
    }

    #[test]
    fn test_get_into_short_buffer() {
        let engine = Engine::new();
        engine.set(b"k", b"hello world").unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(engine.get(b"k", &mut buf), Ok(5));
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_replaced_storage_is_reclaimed() {
        let engine = Engine::new();
        engine.set(b"seed", b"x").unwrap();
        let baseline = engine.memory_info().slots_in_use;

        engine.set(b"k", &vec![1u8; 10_000]).unwrap();
        engine.replace(b"k", &vec![2u8; 10_000]).unwrap();
        engine.delete(b"k").unwrap();
        assert!(engine.memory_info().slots_in_use > baseline);

        assert_eq!(engine.shrink(), 2);
        let info = engine.memory_info();
        assert_eq!(info.slots_in_use, baseline);
        assert_eq!(info.retired, 0);
        assert_eq!(info.live_chains, 1);
    }

    #[test]
    fn test_shrink_is_idempotent() {
        let engine = Engine::new();
        assert_eq!(engine.shrink(), 0);
        assert_eq!(engine.shrink(), 0);
        assert_eq!(engine.stats().shrink_ops, 2);
    }

    #[test]
    fn test_out_of_space_leaves_store_consistent() {
        let engine = Engine::with_config(EngineConfig {
            retire_capacity: 16,
            max_slabs: Some(1),
        });
        engine.set(b"small", b"fits").unwrap();

        let big = vec![0u8; MAX_OBJECT_SIZE * 4];
        assert_eq!(engine.set(b"big", &big), Err(StoreError::OutOfSpace));
        assert_eq!(engine.len(), 1);
        assert_eq!(value_of(&engine, b"small").unwrap(), Bytes::from("fits"));
    }

    #[test]
    fn test_signed_entry_points() {
        let engine = Engine::new();
        let mut buf = [0u8; 8];

        assert_eq!(engine_get(&engine, b"a", &mut buf), -(ENOENT as isize));
        assert_eq!(engine_set(&engine, b"a", b"hello"), 0);
        assert_eq!(engine_get(&engine, b"a", &mut buf), 5);
        assert_eq!(engine_add(&engine, b"a", b"x"), -(EEXIST as isize));
        assert_eq!(engine_replace(&engine, b"b", b"y"), -(ENOENT as isize));
        assert_eq!(engine_delete(&engine, b"a"), 0);
        assert_eq!(engine_delete(&engine, b"a"), -(ENOENT as isize));
        assert_eq!(engine_shrink(&engine), 0);

        let tight = Engine::with_config(EngineConfig {
            retire_capacity: 1,
            max_slabs: Some(1),
        });
        let big = vec![0u8; MAX_OBJECT_SIZE * 4];
        assert_eq!(engine_set(&tight, b"big", &big), -(ENOSPC as isize));
    }

    #[test]
    fn test_stats() {
        let engine = Engine::new();
        engine.set(b"a", b"1").unwrap();
        engine.add(b"b", b"2").unwrap();
        engine.replace(b"a", b"3").unwrap();
        engine.delete(b"b").unwrap();
        let _ = engine.get_owned(b"b");

        let stats = engine.stats();
        assert_eq!(stats.keys, 1);
        assert_eq!(stats.set_ops, 1);
        assert_eq!(stats.add_ops, 1);
        assert_eq!(stats.replace_ops, 1);
        assert_eq!(stats.del_ops, 1);
        assert_eq!(stats.get_ops, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_concurrent_disjoint_sets() {
        let engine = Arc::new(Engine::new());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("t{}-k{}", t, i);
                        let value = format!("value-{}-{}", t, i);
                        engine.set(key.as_bytes(), value.as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.len(), 1600);
        for t in 0..8 {
            for i in 0..200 {
                let key = format!("t{}-k{}", t, i);
                let expected = format!("value-{}-{}", t, i);
                assert_eq!(
                    value_of(&engine, key.as_bytes()).unwrap(),
                    Bytes::from(expected)
                );
            }
        }
    }

    #[test]
    fn test_teardown_releases_everything() {
        let engine = Engine::new();
        for i in 0..50u32 {
            engine.set(&i.to_le_bytes(), &vec![0u8; 5000]).unwrap();
        }
        engine.delete(&0u32.to_le_bytes()).unwrap();
        engine.set(&0u32.to_le_bytes(), b"again").unwrap();
        assert!(engine.retired() > 0);

        let mut store = engine.store.lock();
        let (entries, slabs) = store.teardown();
        assert_eq!(entries, 50);
        assert!(slabs > 0);

        assert_eq!(store.items.slab_stats(), SlabStats::default());
        assert_eq!(store.items.live_chains(), 0);
        assert_eq!(store.items.retired(), 0);
        assert!(store.index.is_empty());
        assert_eq!(store.index.tables(), 0);

        // Drop runs teardown again on the emptied store
        assert_eq!(store.teardown(), (0, 0));
    }
}
