//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is cloned into every long-running component. Once
//! it fires (SIGINT, SIGTERM or [`ShutdownSignal::trigger`]) it stays
//! fired, so components that check late still see it.
//!
//! # Example
//!
//! ```rust,ignore
//! use mailgate::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! tokio::spawn(shutdown.clone().listen_for_os_signals());
//!
//! loop {
//!     tokio::select! {
//!         _ = shutdown.cancelled() => break,
//!         batch = queue.receive_batch(10) => { /* ... */ }
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Default time allowed for in-flight work after shutdown starts.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    timeout: Duration,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown triggered");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once the signal has fired.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = receiver.wait_for(|fired| *fired).await;
    }

    /// Wait for SIGINT or SIGTERM, then fire.
    pub async fn listen_for_os_signals(self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
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
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
            _ = self.cancelled() => return,
        }

        self.trigger();
    }

    /// Wait for `task` to finish, giving up after the shutdown timeout.
    ///
    /// Returns `None` on timeout.
    pub async fn drain<F: std::future::Future>(&self, task: F) -> Option<F::Output> {
        match tokio::time::timeout(self.timeout, task).await {
            Ok(output) => Some(output),
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Shutdown timeout reached, forcing shutdown");
                None
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
