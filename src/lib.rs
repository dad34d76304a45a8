//! # kkv - A Slab-Backed Key/Value Store
//!
//! kkv keeps keys and values in memory it carves out itself: a slab
//! allocator with power-of-two size classes, records stored as chains of
//! slab objects, and a sparse three-level hash index. Clients talk to it
//! over a compact binary protocol.
//!
//! ## Features
//!
//! - **Custom slab allocator**: size classes from 16 B to 4 KiB, recycled slots
//! - **Arbitrary value sizes**: large values span several 4 KiB nodes
//! - **Batched reclamation**: freed records are retired and reclaimed together
//! - **Worker lanes**: each connection is pinned to one single-threaded runtime
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                 kkv                                     │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │   Server    │───>│  Session    │───>│  Command    │                  │
//! │  │ (Listener)  │    │ (per lane)  │    │  Handler    │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │                         │
//! │                                               ▼                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐    │
//! │  │   Packet    │    │                  Engine                      │    │
//! │  │   Parser    │    │   Index ──> ItemStore ──> SlabAllocator      │    │
//! │  └─────────────┘    └──────────────────────────────────────────────┘    │
//! │                                               ▲                         │
//! │                                               │                         │
//! │                     ┌─────────────────────────┴───────────────────────┐ │
//! │                     │              Reclaimer                          │ │
//! │                     │        (Background Tokio Task)                  │ │
//! │                     └─────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use kkv::connection::{Server, ServerConfig};
//! use kkv::storage::{Engine, ReclaimConfig, Reclaimer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Arc::new(Engine::new());
//!     let _reclaimer = Reclaimer::start(Arc::clone(&engine), ReclaimConfig::default());
//!
//!     let server = Server::start(engine, ServerConfig::default())?;
//!     server.configure("127.0.0.1:7370".parse()?)?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.deconfigure();
//!     Ok(())
//! }
//! ```
//!
//! ## Commands
//!
//! - `GET`, `SET`, `ADD`, `REPLACE`, `DELETE`, `SHRINK`
//! - `CONFIG` (start listening on an address), `DECONFIG` (stop)
//!
//! ## Module Overview
//!
//! - [`protocol`]: packet header, framing and parsing
//! - [`storage`]: slab allocator, item chains, index, engine
//! - [`commands`]: request dispatch and in-place responses
//! - [`connection`]: sessions, worker lanes, the listener

pub mod commands;
pub mod connection;
pub mod protocol;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use connection::{ConnectionStats, Server, ServerConfig};
pub use protocol::{Command, ParseError};
pub use storage::{Engine, EngineConfig, ReclaimConfig, Reclaimer, StoreError};

/// The default port kkv listens on
pub const DEFAULT_PORT: u16 = 7370;

/// The default host kkv binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of kkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
