//! Listener Lifecycle
//!
//! The server owns the worker lanes and, while configured, one listening
//! socket with its accept loop. `CONFIG` starts listening, `DECONFIG`
//! stops it; both arrive as ordinary requests, so the server is also the
//! [`ListenerControl`] behind every session's command handler.
//!
//! ```text
//!   CONFIG "ip:port" ──> bind + listen ──> accept loop (server runtime)
//!                                              │
//!                                              │ nodelay, into_std
//!                                              ▼
//!                                      Scheduler::assign ──> lane
//!   DECONFIG ──────────> abort accept loop, close listener
//! ```
//!
//! Sessions already running are not affected by `DECONFIG`.

use crate::commands::{CommandHandler, ListenerControl};
use crate::connection::scheduler::{Scheduler, SessionContext};
use crate::connection::session::{ConnectionStats, DEFAULT_BUFFER_SIZE};
use crate::storage::error::{EEXIST, EFAULT, EINVAL};
use crate::storage::Engine;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Worker lanes (0 = one per available CPU)
    pub lanes: usize,
    /// Per-session request/response buffer size
    pub buffer_size: usize,
    /// Disable Nagle's algorithm on accepted sockets
    pub nodelay: bool,
    /// Listen backlog
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lanes: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            nodelay: true,
            backlog: 1024,
        }
    }
}

/// Errors from the listener and the lanes.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("already listening on {0}")]
    AlreadyListening(SocketAddr),

    #[error("invalid listen address: {0}")]
    InvalidAddress(String),

    #[error("worker lane {0} failed to start")]
    LaneStartup(usize),

    #[error("no Tokio runtime to run the accept loop on")]
    NoRuntime,
}

impl ServerError {
    /// Negative errno-style code reported to the client.
    pub fn errno(&self) -> i32 {
        match self {
            ServerError::AlreadyListening(_) => -EEXIST,
            ServerError::InvalidAddress(_) => -EINVAL,
            _ => -EFAULT,
        }
    }
}

/// State shared with the accept loop.
#[derive(Debug)]
struct Shared {
    scheduler: Scheduler,
    ctx: SessionContext,
    nodelay: bool,
    next_session: AtomicU64,
}

impl Shared {
    fn admit(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(self.nodelay) {
            debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
        }
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                error!(client = %addr, error = %e, "Failed to detach accepted socket");
                return;
            }
        };

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let lane = self.scheduler.assign(id, stream, addr, self.ctx.clone());
        debug!(client = %addr, session = id, lane, "Session assigned");
    }
}

#[derive(Debug)]
struct ActiveListener {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

/// The network server.
#[derive(Debug)]
pub struct Server {
    shared: Arc<Shared>,
    runtime: Handle,
    backlog: u32,
    listener: Mutex<Option<ActiveListener>>,
}

impl Server {
    /// Starts the worker lanes. Must be called from within a Tokio runtime,
    /// which will run the accept loop. Nothing listens until [`configure`].
    ///
    /// [`configure`]: Server::configure
    pub fn start(engine: Arc<Engine>, config: ServerConfig) -> Result<Arc<Self>, ServerError> {
        let runtime = Handle::try_current().map_err(|_| ServerError::NoRuntime)?;
        let scheduler = Scheduler::start(config.lanes)?;
        let stats = Arc::new(ConnectionStats::new());

        Ok(Arc::new_cyclic(|weak: &Weak<Server>| {
            let control: Weak<dyn ListenerControl> = weak.clone();
            Server {
                shared: Arc::new(Shared {
                    scheduler,
                    ctx: SessionContext {
                        handler: CommandHandler::with_control(engine, control),
                        stats,
                        buffer_size: config.buffer_size,
                    },
                    nodelay: config.nodelay,
                    next_session: AtomicU64::new(1),
                }),
                runtime,
                backlog: config.backlog,
                listener: Mutex::new(None),
            }
        }))
    }

    /// Binds `addr` and starts accepting connections.
    pub fn configure(&self, addr: SocketAddr) -> Result<SocketAddr, ServerError> {
        let mut listener = self.listener.lock();
        if let Some(active) = listener.as_ref() {
            if !active.task.is_finished() {
                return Err(ServerError::AlreadyListening(active.addr));
            }
        }

        let _guard = self.runtime.enter();
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let tcp = socket.listen(self.backlog)?;
        let bound = tcp.local_addr()?;

        let task = self
            .runtime
            .spawn(accept_loop(tcp, Arc::clone(&self.shared)));
        *listener = Some(ActiveListener { addr: bound, task });

        info!(addr = %bound, "Listening");
        Ok(bound)
    }

    /// Stops accepting connections. Returns whether a listener was running.
    pub fn deconfigure(&self) -> bool {
        match self.listener.lock().take() {
            Some(active) => {
                active.task.abort();
                info!(addr = %active.addr, "Listener closed");
                true
            }
            None => false,
        }
    }

    /// The bound address, while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|active| active.addr)
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.shared.ctx.stats
    }

    pub fn lane_count(&self) -> usize {
        self.shared.scheduler.lane_count()
    }

    /// Live sessions per lane.
    pub fn lane_sessions(&self) -> Vec<usize> {
        self.shared.scheduler.lane_sessions()
    }

    /// A handler wired to this server, for in-process requests.
    pub fn handler(&self) -> CommandHandler {
        self.shared.ctx.handler.clone()
    }
}

impl ListenerControl for Server {
    fn configure(&self, addr: SocketAddr) -> Result<SocketAddr, ServerError> {
        Server::configure(self, addr)
    }

    fn deconfigure(&self) -> bool {
        Server::deconfigure(self)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.deconfigure();
    }
}

/// Accepts connections until aborted.
async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => shared.admit(stream, addr),
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
