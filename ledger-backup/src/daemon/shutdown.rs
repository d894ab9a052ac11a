//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! On a signal the `watch` loop stops feeding the queue, drops any pending
//! auto-backup and lets an in-flight run finish before exiting.

use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(100);

pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Wait for SIGTERM or SIGINT, then notify subscribers.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.trigger();
    }

    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            warn!("Shutdown requested with no listeners");
        }
    }

    /// Wait until `busy` reports false or `limit` elapses. Returns whether it drained.
    pub async fn drain(&self, busy: impl Fn() -> bool, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while busy() {
            if tokio::time::Instant::now() >= deadline {
                warn!("Shutdown drain timed out with work still running");
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        info!("Graceful shutdown complete");
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_trigger_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();

        let handle = tokio::spawn(async move {
            rx.recv().await.ok();
        });

        coordinator.trigger();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_idle() {
        let coordinator = ShutdownCoordinator::new();
        let busy = Arc::new(AtomicBool::new(true));

        let busy_clone = Arc::clone(&busy);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            busy_clone.store(false, Ordering::SeqCst);
        });

        assert!(
            coordinator
                .drain(|| busy.load(Ordering::SeqCst), Duration::from_secs(5))
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_limit() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.drain(|| true, Duration::from_secs(1)).await);
    }
}
