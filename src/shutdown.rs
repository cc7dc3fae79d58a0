//! Shutdown coordination for the daemon.
//!
//! Waits for ctrl+c (or a programmatic trigger), lets the connection
//! manager say goodbye to its peers, then cancels background tasks.

use crate::network::connection_manager::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ShutdownManager {
    /// Token to signal shutdown to all tasks
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
    task_timeout: Duration,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
            task_timeout: TASK_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Request shutdown without a signal
    pub fn trigger(&self) {
        self.cancel_token.cancel();
    }

    /// Resolves on ctrl+c or `trigger`
    pub async fn wait_for_signal(&self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::info!("🛑 Shutdown signal received"),
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            },
            _ = self.cancel_token.cancelled() => {
                tracing::info!("🛑 Shutdown requested");
            }
        }
    }

    /// Stop the connection manager, then wind down registered tasks
    pub async fn shutdown(mut self, manager: &Arc<ConnectionManager>) {
        manager.stop().await;
        self.cancel_token.cancel();

        let handles: Vec<JoinHandle<()>> = self.task_handles.drain(..).collect();
        let shutdown_tasks = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(self.task_timeout, shutdown_tasks).await {
            Ok(_) => tracing::info!("✓ All tasks shut down gracefully"),
            Err(_) => tracing::warn!("⏱️  Shutdown timeout: Some tasks did not complete"),
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection_manager::{ConnectionManagerConfig, ManagerState};
    use crate::network::transport::{SimulatorNetwork, SimulatorTransport};
    use crate::types::{IdGenerator, PeerDescriptor};
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn running_manager() -> Arc<ConnectionManager> {
        let ids = Arc::new(IdGenerator::new());
        let network = SimulatorNetwork::new(Duration::from_millis(1));
        let transport =
            SimulatorTransport::new(network, PeerDescriptor::new(vec![1u8; 4]), true, ids.clone());
        let manager = ConnectionManager::new(ConnectionManagerConfig::default(), transport, ids);
        manager.start().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_trigger_releases_waiter() {
        let shutdown = ShutdownManager::new();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait_for_signal())
            .await
            .unwrap();
        assert!(shutdown.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_stops_manager_and_tasks() {
        let manager = running_manager().await;
        let mut shutdown = ShutdownManager::new();

        let finished = Arc::new(AtomicBool::new(false));
        let token = shutdown.token();
        let flag = finished.clone();
        shutdown.register_task(tokio::spawn(async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        }));

        shutdown.shutdown(&manager).await;
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stuck_task_hits_timeout() {
        let manager = running_manager().await;
        let mut shutdown = ShutdownManager::new().with_task_timeout(Duration::from_millis(20));
        shutdown.register_task(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }));

        tokio::time::timeout(Duration::from_secs(2), shutdown.shutdown(&manager))
            .await
            .unwrap();
    }
}
