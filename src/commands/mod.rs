//! Command Handler Module
//!
//! Receives a framed request from a session, executes it against the
//! storage engine (or the listener, for `CONFIG`/`DECONFIG`), and builds
//! the response in place.
//!
//! ## Architecture
//!
//! ```text
//! Session buffer
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  Packet parser  │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │     Engine      │  (storage module)
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! - `GET`, `SET`, `ADD`, `REPLACE`, `DELETE`, `SHRINK`
//! - `CONFIG`, `DECONFIG`

pub mod handler;

// Re-export the main command handler
pub use handler::{CommandHandler, ListenerControl, Reply};
