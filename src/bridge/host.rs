//! Process-level lifecycle of the bridge

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::manager::BridgeManager;
use super::types::BridgeState;
use crate::core::error::{BridgeError, Result};

/// Brings the foreign environment up once, initializes the bridge manager,
/// idles until cancelled and then shuts everything down in order.
pub struct BridgeHost {
    manager: Arc<BridgeManager>,
    idle_interval: Duration,
    state: watch::Sender<BridgeState>,
    environment_ready: AtomicBool,
}

impl BridgeHost {
    pub fn new(manager: Arc<BridgeManager>, idle_interval: Duration) -> Self {
        let (state, _) = watch::channel(BridgeState::NotStarted);
        Self {
            manager,
            idle_interval,
            state,
            environment_ready: AtomicBool::new(false),
        }
    }

    pub fn manager(&self) -> &Arc<BridgeManager> {
        &self.manager
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    fn transition(&self, state: BridgeState) {
        info!(state = ?state, "Bridge state changed");
        self.state.send_replace(state);
    }

    /// Initialize the environment and the manager. Fails unless the host has not started yet.
    pub async fn start(&self) -> Result<()> {
        if self.state() != BridgeState::NotStarted {
            return Err(BridgeError::InvalidOperation(format!(
                "bridge host cannot start from state {:?}",
                self.state()
            )));
        }

        self.transition(BridgeState::EnvironmentInitializing);
        let runtime = self.manager.runtime().clone();
        if !self.environment_ready.load(Ordering::SeqCst) {
            runtime
                .initialize_environment(self.manager.folders())
                .await
                .map_err(|e| BridgeError::Initialization(format!("{} environment: {}", runtime.name(), e)))?;
            self.environment_ready.store(true, Ordering::SeqCst);
            info!(runtime = %runtime.name(), "Foreign environment initialized");
        }

        self.transition(BridgeState::ManagerInitializing);
        self.manager.initialize().await?;

        self.transition(BridgeState::Ready);
        Ok(())
    }

    /// Run until `token` is cancelled. Startup failures are returned after
    /// tearing down whatever was brought up.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        if let Err(e) = self.start().await {
            error!(error = %e, "Bridge startup failed");
            self.stop().await;
            return Err(e);
        }

        info!("Bridge ready");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.idle_interval) => {}
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Dispose every module and tear the environment down. Never fails.
    pub async fn stop(&self) {
        if self.state() == BridgeState::Stopped {
            return;
        }

        self.transition(BridgeState::ShuttingDown);
        self.manager.shutdown().await;

        if self.environment_ready.swap(false, Ordering::SeqCst) {
            let runtime = self.manager.runtime();
            if let Err(e) = runtime.shutdown_environment().await {
                warn!(runtime = %runtime.name(), error = %e, "Failed to shut down foreign environment");
            }
        }

        self.transition(BridgeState::Stopped);
        info!("Bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::loader::UnloadPolicy;
    use crate::bridge::package::ZipPayloadConverter;
    use crate::bridge::testing::*;
    use crate::bridge::types::ModuleFormat;
    use crate::core::folders::WorkingFolders;
    use tempfile::TempDir;

    fn host(dir: &TempDir, runtime: Arc<MockRuntime>) -> BridgeHost {
        let folders = Arc::new(WorkingFolders::new(dir.path(), Some(&dir.path().join("tmp"))).unwrap());
        let manager = BridgeManager::new(
            folders,
            runtime,
            MockDownloader::new(),
            Arc::new(ZipPayloadConverter::new(ModuleFormat::Archive)),
            UnloadPolicy { attempts: 3, interval: Duration::from_millis(1), drain_timeout: Duration::from_secs(1) },
            Vec::new(),
        );
        BridgeHost::new(Arc::new(manager), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        let host = Arc::new(host(&dir, runtime.clone()));
        let mut states = host.subscribe();
        assert_eq!(host.state(), BridgeState::NotStarted);

        let token = CancellationToken::new();
        let running = {
            let host = host.clone();
            let token = token.clone();
            tokio::spawn(async move { host.run(token).await })
        };

        states.wait_for(|s| *s == BridgeState::Ready).await.unwrap();
        assert!(host.manager().is_initialized());

        token.cancel();
        running.await.unwrap().unwrap();
        assert_eq!(host.state(), BridgeState::Stopped);
        assert_eq!(runtime.environment_inits.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.environment_shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_environment_initialized_once() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        let host = host(&dir, runtime.clone());

        host.start().await.unwrap();
        assert!(matches!(host.start().await, Err(BridgeError::InvalidOperation(_))));
        assert_eq!(runtime.environment_inits.load(Ordering::SeqCst), 1);

        host.stop().await;
        host.stop().await;
        assert_eq!(runtime.environment_shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_environment_failure_is_propagated() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        runtime.fail_environment.store(true, Ordering::SeqCst);
        let host = host(&dir, runtime.clone());

        let err = host.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Initialization(_)));
        assert_eq!(host.state(), BridgeState::Stopped);
        assert!(!host.manager().is_initialized());
        assert_eq!(runtime.environment_shutdowns.load(Ordering::SeqCst), 0);
    }
}
