//! Worker Lanes
//!
//! Each lane is an OS thread running its own single-threaded Tokio runtime.
//! A session is placed on a lane when it is accepted and stays there for
//! its whole life; lanes share nothing but the round-robin counter used to
//! pick the next one.
//!
//! Stopping a lane signals every session on it. Each session destroys
//! itself, and the lane thread exits only after the last one is gone.
//!
//! ```text
//!              accept loop
//!                   │ assign (round-robin)
//!        ┌──────────┼──────────┐
//!        ▼          ▼          ▼
//!   ┌─────────┐┌─────────┐┌─────────┐
//!   │ lane 0  ││ lane 1  ││ lane N  │   current-thread runtimes
//!   │ s1 s4 … ││ s2 s5 … ││ s3 s6 … │
//!   └─────────┘└─────────┘└─────────┘
//! ```

use crate::commands::CommandHandler;
use crate::connection::server::ServerError;
use crate::connection::session::{ConnectionStats, Session};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Everything a session needs besides its socket.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub handler: CommandHandler,
    pub stats: Arc<ConnectionStats>,
    pub buffer_size: usize,
}

struct Lane {
    index: usize,
    handle: Handle,
    sessions: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    /// Cloned into every session task; the lane drains once all are dropped
    done_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Lane {
    /// The runtime is built here so its handle is available at once, then
    /// handed to the lane thread, which owns and drops it.
    fn start(index: usize) -> Result<Self, ServerError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (runtime_tx, runtime_rx) = oneshot::channel::<Runtime>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = mpsc::channel::<()>(1);

        let spawned = std::thread::Builder::new()
            .name(format!("kkv-lane-{}", index))
            .spawn(move || {
                let Ok(runtime) = runtime_rx.blocking_recv() else {
                    return;
                };
                runtime.block_on(lane_main(index, shutdown_rx, done_rx));
                debug!(lane = index, "Lane stopped");
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                runtime.shutdown_background();
                return Err(e.into());
            }
        };
        if let Err(runtime) = runtime_tx.send(runtime) {
            runtime.shutdown_background();
            return Err(ServerError::LaneStartup(index));
        }

        Ok(Self {
            index,
            handle,
            sessions: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            done_tx: Some(done_tx),
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.done_tx = None;
        if let Some(thread) = self.thread.take() {
            // Dropped from a session on this very lane: the thread exits on its own.
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                warn!(lane = self.index, "Lane thread panicked");
            }
        }
    }
}

/// Runs until shutdown is signalled, then until every session has ended.
async fn lane_main(
    index: usize,
    mut shutdown_rx: watch::Receiver<bool>,
    mut done_rx: mpsc::Receiver<()>,
) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
    debug!(lane = index, "Lane draining sessions");
    // Never sent on; yields `None` once every sender is dropped.
    let _ = done_rx.recv().await;
}

/// The set of worker lanes.
pub struct Scheduler {
    lanes: Vec<Lane>,
    next: AtomicUsize,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("lanes", &self.lanes.len())
            .field("sessions", &self.lane_sessions())
            .finish()
    }
}

/// Number of lanes to start for a requested count (0 = one per CPU).
pub fn lane_count(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Scheduler {
    /// Starts `lanes` worker lanes (0 = one per available CPU).
    pub fn start(lanes: usize) -> Result<Self, ServerError> {
        let count = lane_count(lanes);
        let lanes = (0..count)
            .map(Lane::start)
            .collect::<Result<Vec<_>, _>>()?;

        info!(lanes = count, "Worker lanes started");
        Ok(Self {
            lanes,
            next: AtomicUsize::new(0),
        })
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Live sessions per lane.
    pub fn lane_sessions(&self) -> Vec<usize> {
        self.lanes
            .iter()
            .map(|lane| lane.sessions.load(Ordering::Relaxed))
            .collect()
    }

    /// Places a new session on the next lane. The stream must be in
    /// non-blocking mode. Returns the lane index.
    pub fn assign(
        &self,
        id: u64,
        stream: std::net::TcpStream,
        addr: SocketAddr,
        ctx: SessionContext,
    ) -> usize {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.lanes.len();
        let lane = &self.lanes[index];
        let Some(done) = lane.done_tx.clone() else {
            warn!(client = %addr, lane = index, "Lane stopped, dropping connection");
            return index;
        };
        let shutdown = lane.shutdown_tx.subscribe();
        let sessions = Arc::clone(&lane.sessions);
        sessions.fetch_add(1, Ordering::Relaxed);

        lane.handle.spawn(async move {
            match TcpStream::from_std(stream) {
                Ok(stream) => {
                    Session::new(
                        id,
                        index,
                        stream,
                        addr,
                        ctx.buffer_size,
                        ctx.handler,
                        ctx.stats,
                    )
                    .run_until(shutdown)
                    .await
                }
                Err(e) => error!(client = %addr, error = %e, "Failed to register socket"),
            }
            sessions.fetch_sub(1, Ordering::Relaxed);
            drop(done);
        });

        index
    }

    /// Stops every lane. Sessions still running are destroyed first.
    pub fn shutdown(&mut self) {
        for lane in &mut self.lanes {
            lane.stop();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_request, parse_response, Command};
    use crate::storage::Engine;
    use std::io::{Read, Write};
    use std::time::Duration;

    fn context() -> SessionContext {
        SessionContext {
            handler: CommandHandler::new(Arc::new(Engine::new())),
            stats: Arc::new(ConnectionStats::new()),
            buffer_size: 1024,
        }
    }

    #[test]
    fn test_lane_count() {
        assert_eq!(lane_count(3), 3);
        assert!(lane_count(0) >= 1);
    }

    #[test]
    fn test_round_robin_assignment() {
        let scheduler = Scheduler::start(2).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = context();

        let mut clients = Vec::new();
        let mut lanes = Vec::new();
        for id in 0..4 {
            clients.push(std::net::TcpStream::connect(addr).unwrap());
            let (stream, peer) = listener.accept().unwrap();
            stream.set_nonblocking(true).unwrap();
            lanes.push(scheduler.assign(id, stream, peer, ctx.clone()));
        }
        assert_eq!(lanes, vec![0, 1, 0, 1]);

        let client = &mut clients[3];
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
            .write_all(&encode_request(9, Command::Set, b"k", b"v"))
            .unwrap();
        let mut buf = [0u8; 16];
        client.read_exact(&mut buf).unwrap();
        let (response, _) = parse_response(&buf).unwrap().unwrap();
        assert_eq!(response.id, 9);
        assert!(response.is_ack());

        assert_eq!(scheduler.lane_sessions().iter().sum::<usize>(), 4);
    }

    #[test]
    fn test_shutdown_destroys_sessions() {
        let mut scheduler = Scheduler::start(1).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        let ctx = context();
        let stats = Arc::clone(&ctx.stats);
        scheduler.assign(1, stream, peer, ctx);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(scheduler.lane_sessions(), vec![1]);

        scheduler.shutdown();

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
        assert_eq!(scheduler.lane_sessions(), vec![0]);

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    }

    #[test]
    fn test_assign_after_shutdown_drops_connection() {
        let mut scheduler = Scheduler::start(1).unwrap();
        scheduler.shutdown();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        assert_eq!(scheduler.assign(1, stream, peer, context()), 0);
        assert_eq!(scheduler.lane_sessions(), vec![0]);

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    }
}
