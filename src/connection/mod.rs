//! Connection Handling Module
//!
//! Accepts clients, pins each one to a worker lane, and drives its
//! receive → process → send cycle with non-blocking socket I/O.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Server (accept loop)                        │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept()
//!                        ▼
//!           ┌────────────────────────┐
//!           │  Scheduler (lanes)     │  round-robin placement
//!           └────────────┬───────────┘
//!                        │
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Session                                │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │  Receiving  │───>│    Busy     │───>│   Sending   │      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘      │
//! │         ▲                                     │             │
//! │         └─────────────────────────────────────┘             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use kkv::connection::{Server, ServerConfig};
//! use kkv::storage::Engine;
//! use std::sync::Arc;
//!
//! let engine = Arc::new(Engine::new());
//! let server = Server::start(engine, ServerConfig::default())?;
//! let addr = server.configure("127.0.0.1:7370".parse()?)?;
//! ```

pub mod scheduler;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use scheduler::{Scheduler, SessionContext};
pub use server::{Server, ServerConfig, ServerError};
pub use session::{ConnectionError, ConnectionStats, Session, SessionState};
