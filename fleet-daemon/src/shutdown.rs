//! Graceful shutdown handling for fleetd.
//!
//! Background loops stop on the shutdown broadcast; the hook queue is then
//! drained so that every hook already triggered runs before exit.

use fleet_core::{shutdown_observability, VmPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Manages graceful shutdown of the daemon.
pub struct ShutdownManager {
    pool: Arc<VmPool>,
    /// Time allowed for background loops to finish their current tick
    loop_timeout: Duration,
}

impl ShutdownManager {
    pub fn new(pool: Arc<VmPool>) -> Self {
        Self { pool, loop_timeout: Duration::from_secs(30) }
    }

    /// Wait for the background loops, then drain the hook queue.
    pub async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        info!("Starting graceful shutdown...");

        for task in tasks {
            match tokio::time::timeout(self.loop_timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Background task failed: {}", e),
                Err(_) => warn!("Background task did not stop in {:?}", self.loop_timeout),
            }
        }

        self.pool.shutdown().await;
        shutdown_observability();

        info!("Graceful shutdown complete");
    }
}

/// Create a shutdown signal sender.
///
/// The returned sender fires once when SIGTERM or SIGINT is received;
/// subscribe to it for each background loop.
pub fn shutdown_signal() -> broadcast::Sender<()> {
    let (tx, _) = broadcast::channel(1);
    let notify = tx.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
        }

        let _ = notify.send(());
    });

    tx
}
