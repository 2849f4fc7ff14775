use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use eyre::{Result, WrapErr};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Graceful shutdown requested (SIGTERM, SIGINT)
    Graceful,
    /// Drain timeout exceeded
    Force,
}

/// Coordinates shutdown between the signal handler, the HTTP server and the
/// background tasks (config watcher, rate-limit purge, log shipping).
///
/// Background tasks hold a child of [`token`](Self::token) and exit when it
/// is cancelled; the server stops accepting connections and drains in-flight
/// requests for at most `drain_timeout`.
#[derive(Clone)]
pub struct GracefulShutdown {
    token: CancellationToken,
    initiated: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new GracefulShutdown manager with default 30-second drain timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            initiated: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(Mutex::new(None)),
            drain_timeout,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Token cancelled once shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.initiated.load(Ordering::Relaxed)
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|reason| *reason)
    }

    /// Start shutdown. Only the first call has an effect.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("Shutdown initiated: {:?}", reason);
            if let Ok(mut slot) = self.reason.lock() {
                *slot = Some(reason);
            }
            self.token.cancel();
        } else {
            tracing::warn!("Shutdown already initiated, ignoring {:?}", reason);
        }
    }

    /// Wait for SIGINT or SIGTERM and start shutdown.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        #[cfg(unix)]
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to register SIGTERM handler")?;

        #[cfg(unix)]
        let terminate = sigterm.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => return Ok(()),
        }
        self.trigger_shutdown(ShutdownReason::Graceful);
        Ok(())
    }

    /// Resolve once shutdown has been initiated.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Graceful)
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_graceful_shutdown_creation() {
        let shutdown = GracefulShutdown::new();
        assert!(!shutdown.is_shutdown_initiated());
        assert!(shutdown.reason().is_none());
        assert_eq!(shutdown.drain_timeout(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_manual_trigger_shutdown() {
        let shutdown = GracefulShutdown::new();
        let token = shutdown.token();

        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        assert!(shutdown.is_shutdown_initiated());
        assert!(token.is_cancelled());
        assert_eq!(
            shutdown.wait_for_shutdown_signal().await,
            ShutdownReason::Graceful
        );
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let shutdown = GracefulShutdown::new();
        shutdown.trigger_shutdown(ShutdownReason::Force);
        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Force));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_secs(1));
        let clone = shutdown.clone();
        let waiter = tokio::spawn(async move { clone.wait_for_shutdown_signal().await });

        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, ShutdownReason::Graceful);
    }
}
