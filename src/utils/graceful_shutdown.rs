use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{signal, sync::broadcast};

/// Why the process is going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / SIGTERM, or triggered from code
    Graceful,
    /// Drain deadline exceeded
    Force,
}

/// Fans a single shutdown signal out to the server, the health checker and
/// background sweeps.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
    /// How long in-flight requests may drain before the process exits anyway
    drain_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            drain_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Start shutdown; later calls are ignored.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!(reason = ?reason, "Shutdown initiated");
            // no subscribers simply means nothing is left to stop
            let _ = self.shutdown_tx.send(reason);
        } else {
            tracing::debug!(reason = ?reason, "Shutdown already initiated, ignoring");
        }
    }

    /// Wait for SIGINT or SIGTERM, then trigger a graceful shutdown.
    pub async fn run_signal_handler(&self) {
        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for SIGINT");
                    return;
                }
                tracing::info!("Received SIGINT, shutting down");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, shutting down");
            }
        }
        self.trigger_shutdown(ShutdownReason::Graceful);
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut receiver = self.subscribe();
        if self.is_shutdown_initiated() {
            return ShutdownReason::Graceful;
        }
        receiver.recv().await.unwrap_or(ShutdownReason::Force)
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
