//! Storage Engine Module
//!
//! Memory for keys and values comes from a purpose-built slab allocator.
//! A record is a chain of slab objects, found through a sparse hash index,
//! and freed in batches through a retirement queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Engine                           │
//! │   get / set / add / replace / delete / shrink            │
//! │                                                          │
//! │   ┌──────────┐   entry → head   ┌──────────────────────┐ │
//! │   │  Index   │ ───────────────> │      ItemStore       │ │
//! │   │ 3 levels │                  │  chains, refcounts   │ │
//! │   └──────────┘                  │  RetirementQueue     │ │
//! │                                 │  SlabAllocator       │ │
//! │                                 └──────────────────────┘ │
//! └──────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │ shrink (locked)
//!              ┌─────────────┴─────────────┐
//!              │        Reclaimer          │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use kkv::storage::Engine;
//! use std::sync::Arc;
//!
//! let engine = Arc::new(Engine::new());
//!
//! engine.set(b"name", b"Ariz").unwrap();
//! assert_eq!(engine.get_owned(b"name").unwrap(), "Ariz");
//!
//! engine.delete(b"name").unwrap();
//! assert_eq!(engine.shrink(), 1);
//! ```

pub mod engine;
pub mod error;
pub mod index;
pub mod item;
pub mod reclaim;
pub mod retire;
pub mod slab;

// Re-export commonly used types
pub use engine::{
    engine_add, engine_delete, engine_get, engine_replace, engine_set, engine_shrink, Engine,
    EngineConfig, EngineStats, MemoryInfo,
};
pub use error::{StoreError, StoreResult};
pub use reclaim::{ReclaimConfig, Reclaimer};
