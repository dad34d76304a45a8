//! Per-Connection Session
//!
//! A session owns one accepted socket and one fixed-size buffer that holds
//! the current request and, after processing, its response. It cycles
//! through three states:
//!
//! ```text
//!          read-ready, frame complete
//!   ┌───────────┐ ───────────────> ┌────────┐
//!   │ Receiving │                  │  Busy  │  handler runs on the lane
//!   └───────────┘ <──┐             └────────┘
//!         ▲          │ response        │
//!         │          │ fully sent      ▼
//!         │          │            ┌─────────┐
//!         └──────────┴─────────── │ Sending │  write-ready
//!                                 └─────────┘
//! ```
//!
//! The socket is driven by readiness: the session waits for `readable()`
//! or `writable()` and then makes a single non-blocking attempt. If that
//! attempt would block, the readiness was spurious and the session waits
//! again without changing state.
//!
//! Requests on one connection are handled strictly one at a time. Bytes
//! that arrive past the end of the current request are set aside and
//! become the start of the next one once the response has been sent.

use crate::commands::CommandHandler;
use crate::protocol::{frame_len, Command, PacketHeader, ParseError, HEADER_LEN};
use bytes::BytesMut;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Default size of the per-session request/response buffer (64 KB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total requests processed
    pub requests_processed: AtomicU64,
    /// Requests answered with NACK
    pub requests_failed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_processed(&self, acked: bool) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        if !acked {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The request can never fit in the session buffer
    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    /// Client disconnected between requests
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Client disconnected in the middle of a request
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer filled up without a complete request
    #[error("Buffer size limit exceeded")]
    BufferFull,

    /// The lane running the session is shutting down
    #[error("Lane shutting down")]
    Shutdown,
}

/// Where a session is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the rest of a request
    Receiving,
    /// A complete request is being processed
    Busy,
    /// Writing the response
    Sending,
}

/// One client connection.
pub struct Session {
    id: u64,
    lane: usize,
    stream: TcpStream,
    addr: SocketAddr,
    state: SessionState,
    buf: Box<[u8]>,
    /// Bytes of the current request held in `buf`
    received: usize,
    /// Length of the complete request at the start of `buf`
    frame: usize,
    /// Response bytes at the start of `buf`, and how many are written
    reply_len: usize,
    sent: usize,
    /// Bytes received past the current request
    surplus: BytesMut,
    handler: CommandHandler,
    stats: Arc<ConnectionStats>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("lane", &self.lane)
            .field("client", &self.addr)
            .field("state", &self.state)
            .field("received", &self.received)
            .finish()
    }
}

impl Session {
    /// Creates a session for an accepted stream. Must be called on the
    /// runtime of the lane that will drive it.
    pub fn new(
        id: u64,
        lane: usize,
        stream: TcpStream,
        addr: SocketAddr,
        buffer_size: usize,
        handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            id,
            lane,
            stream,
            addr,
            state: SessionState::Receiving,
            buf: vec![0u8; buffer_size.max(HEADER_LEN)].into_boxed_slice(),
            received: 0,
            frame: 0,
            reply_len: 0,
            sent: 0,
            surplus: BytesMut::new(),
            handler,
            stats,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the session until the client goes away or an error occurs,
    /// then destroys it.
    pub async fn run(self) {
        let (_keep, shutdown) = watch::channel(false);
        self.run_until(shutdown).await;
    }

    /// Like [`run`](Session::run), but also ends the session once
    /// `shutdown` turns `true` or its sender is dropped.
    pub async fn run_until(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(client = %self.addr, session = self.id, lane = self.lane, "Client connected");

        let result = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => Err(ConnectionError::Shutdown),
            result = self.drive() => result,
        };

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(client = %self.addr, "Client disconnected")
                }
                ConnectionError::Shutdown => {
                    debug!(client = %self.addr, session = self.id, "Session closed by lane shutdown")
                }
                ConnectionError::IoError(io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    debug!(client = %self.addr, "Connection reset by client")
                }
                _ => warn!(client = %self.addr, error = %e, "Connection error"),
            },
        }

        if matches!(
            result,
            Err(ConnectionError::BufferFull) | Err(ConnectionError::ParseError(_))
        ) {
            self.reject_oversized().await;
        }
        self.destroy();
    }

    async fn drive(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.state {
                SessionState::Receiving => {
                    if self.try_frame()? {
                        continue;
                    }
                    self.stream.readable().await?;
                    self.receive()?;
                }
                SessionState::Busy => self.process(),
                SessionState::Sending => {
                    self.stream.writable().await?;
                    self.send()?;
                }
            }
        }
    }

    /// Moves to `Busy` if a complete request is buffered.
    fn try_frame(&mut self) -> Result<bool, ConnectionError> {
        match frame_len(&self.buf[..self.received], self.buf.len())? {
            Some(frame) => {
                self.frame = frame;
                self.state = SessionState::Busy;
                Ok(true)
            }
            None if self.received == self.buf.len() => Err(ConnectionError::BufferFull),
            None => Ok(false),
        }
    }

    fn receive(&mut self) -> Result<(), ConnectionError> {
        match self.stream.try_read(&mut self.buf[self.received..]) {
            Ok(0) if self.received == 0 => Err(ConnectionError::ClientDisconnected),
            Ok(0) => Err(ConnectionError::UnexpectedEof),
            Ok(n) => {
                self.received += n;
                self.stats.bytes_read(n);
                trace!(client = %self.addr, bytes = n, "Read data");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                trace!(client = %self.addr, "Spurious read readiness");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn process(&mut self) {
        if self.received > self.frame {
            self.surplus
                .extend_from_slice(&self.buf[self.frame..self.received]);
        }

        let reply = self.handler.process(&mut self.buf, self.frame);
        self.stats.request_processed(reply.is_ack());
        trace!(
            client = %self.addr,
            code = reply.code,
            len = reply.len,
            "Request processed"
        );

        self.reply_len = reply.len;
        self.sent = 0;
        self.state = SessionState::Sending;
    }

    fn send(&mut self) -> Result<(), ConnectionError> {
        match self.stream.try_write(&self.buf[self.sent..self.reply_len]) {
            Ok(n) => {
                self.sent += n;
                self.stats.bytes_written(n);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                trace!(client = %self.addr, "Spurious write readiness");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if self.sent == self.reply_len {
            trace!(client = %self.addr, bytes = self.reply_len, "Sent response");
            let carried = self.surplus.len();
            self.buf[..carried].copy_from_slice(&self.surplus);
            self.surplus.clear();
            self.received = carried;
            self.state = SessionState::Receiving;
        }
        Ok(())
    }

    /// Answers a request that can never fit the buffer with a `NACK`
    /// carrying its id, before the connection is torn down.
    async fn reject_oversized(&mut self) {
        if self.received < HEADER_LEN {
            return;
        }
        PacketHeader::write_response(&mut self.buf, Command::Nack.code(), 0, 0);
        match self.stream.write_all(&self.buf[..HEADER_LEN]).await {
            Ok(()) => {
                self.stats.request_processed(false);
                self.stats.bytes_written(HEADER_LEN);
            }
            Err(e) => debug!(client = %self.addr, error = %e, "Failed to send NACK"),
        }
    }

    /// Shuts the socket down and releases it.
    fn destroy(self) {
        self.stats.connection_closed();
        match self.stream.into_std() {
            Ok(stream) => {
                if let Err(e) = stream.shutdown(Shutdown::Both) {
                    trace!(client = %self.addr, error = %e, "Socket shutdown");
                }
            }
            Err(e) => debug!(client = %self.addr, error = %e, "Failed to detach socket"),
        }
        debug!(client = %self.addr, session = self.id, "Session destroyed");
    }
}

/// Resolves once shutdown is signalled or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
