//! Background Reclaimer
//!
//! Retired chains are normally handed back to the allocator only when the
//! retirement queue fills up or a client sends `SHRINK`. On a quiet server
//! the queue can sit half full for a long time, holding memory that no key
//! references any more.
//!
//! The reclaimer is a Tokio task that wakes up every `interval` and, if the
//! queue is non-empty, runs the same locked `shrink` a client would. It
//! never touches the queue outside the engine lock.

use crate::storage::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Configuration for the background reclaimer.
#[derive(Debug, Clone)]
pub struct ReclaimConfig {
    /// Time between checks of the retirement queue (default: 1s)
    pub interval: Duration,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// A handle to the running reclaimer.
///
/// When this handle is dropped, the reclaimer task is stopped.
#[derive(Debug)]
pub struct Reclaimer {
    shutdown_tx: watch::Sender<bool>,
}

impl Reclaimer {
    /// Starts the reclaimer as a background task on the current runtime.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use kkv::storage::{Engine, ReclaimConfig, Reclaimer};
    /// use std::sync::Arc;
    ///
    /// let engine = Arc::new(Engine::new());
    /// let reclaimer = Reclaimer::start(engine, ReclaimConfig::default());
    ///
    /// // Dropping the handle stops the task
    /// drop(reclaimer);
    /// ```
    pub fn start(engine: Arc<Engine>, config: ReclaimConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(reclaim_loop(engine, config, shutdown_rx));

        info!("Background reclaimer started");

        Self { shutdown_tx }
    }

    /// Stops the reclaimer. Called automatically on drop.
    pub fn stop(&self) {
        if self.shutdown_tx.send(true).is_ok() {
            info!("Background reclaimer stopped");
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn reclaim_loop(
    engine: Arc<Engine>,
    config: ReclaimConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Reclaimer received shutdown signal");
                    return;
                }
            }
        }

        if engine.retired() == 0 {
            trace!("Retirement queue empty");
            continue;
        }

        let reclaimed = engine.shrink();
        debug!(
            reclaimed,
            slots_in_use = engine.memory_info().slots_in_use,
            "Retired chains reclaimed"
        );
    }
}
