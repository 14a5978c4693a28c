use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

/// Graceful shutdown coordinator for TaskHive.
///
/// Cloneable handle around a watch channel; any clone can trigger, every clone
/// observes.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender, receiver }
    }

    /// Request shutdown
    pub fn trigger(&self, reason: &str) {
        if !*self.sender.borrow() {
            info!(reason = %reason, "Shutdown requested");
        }
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// A receiver that flips to `true` on shutdown
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.receiver.clone()
    }

    /// Resolve once shutdown has been requested
    pub async fn wait(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|triggered| *triggered).await.is_err() {
            warn!("Shutdown channel closed");
        }
    }

    /// Install SIGINT/SIGTERM handlers that trigger this coordinator
    pub fn install_signal_handlers(&self) -> Result<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(signal) => coordinator.trigger(signal),
                Err(e) => warn!(error = %e, "Failed to listen for shutdown signals"),
            }
        });

        info!("Shutdown coordinator ready - will shutdown gracefully on SIGINT/SIGTERM");
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "Ctrl-C")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_all_clones() {
        let shutdown = ShutdownCoordinator::new();
        let observer = shutdown.clone();
        let waiter = tokio::spawn(async move { observer.wait().await });

        assert!(!shutdown.is_triggered());
        shutdown.trigger("test");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns_immediately() {
        let shutdown = ShutdownCoordinator::new();
        shutdown.trigger("test");
        tokio::time::timeout(Duration::from_millis(100), shutdown.wait())
            .await
            .unwrap();
    }
}
