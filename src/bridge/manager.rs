//! Bridge manager
//!
//! Owns the repository and module managers, fixes their initialization
//! order and pushes the host-wide network overrides into the foreign
//! runtime's settings.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::downloader::{HttpRepositoryDownloader, RepositoryDownloader};
use super::loader::UnloadPolicy;
use super::modules::ModuleManager;
use super::package::{PackageConverter, ZipPayloadConverter};
use super::proxy::{ModuleRegistry, PublicModuleManager, PublicRepositoryManager, RepositoryRegistry};
use super::repositories::RepositoryManager;
use super::runtime::{ForeignRuntime, RuntimeSettings};
use super::types::{BridgePreferences, ModuleFormat};
use crate::core::config::Config;
use crate::core::error::{BridgeError, Result};
use crate::core::folders::{read_json, write_json, WorkingFolders};

pub struct BridgeManager {
    folders: Arc<WorkingFolders>,
    runtime: Arc<dyn ForeignRuntime>,
    repositories: Arc<RepositoryManager>,
    modules: Arc<ModuleManager>,
    module_registry: Arc<PublicModuleManager>,
    repository_registry: Arc<PublicRepositoryManager>,
    initial_repositories: Vec<String>,
    preferences: Mutex<BridgePreferences>,
    init_lock: Mutex<()>,
    initialized: AtomicBool,
    shutdown: CancellationToken,
}

impl BridgeManager {
    pub fn new(
        folders: Arc<WorkingFolders>,
        runtime: Arc<dyn ForeignRuntime>,
        downloader: Arc<dyn RepositoryDownloader>,
        converter: Arc<dyn PackageConverter>,
        policy: UnloadPolicy,
        initial_repositories: Vec<String>,
    ) -> Self {
        let repositories = Arc::new(RepositoryManager::new(folders.clone(), downloader.clone()));
        let modules = Arc::new(ModuleManager::new(
            folders.clone(),
            repositories.clone(),
            downloader,
            converter,
            runtime.clone(),
            policy,
        ));

        Self {
            module_registry: Arc::new(PublicModuleManager::new(modules.clone())),
            repository_registry: Arc::new(PublicRepositoryManager::new(repositories.clone(), modules.clone())),
            folders,
            runtime,
            repositories,
            modules,
            initial_repositories,
            preferences: Mutex::new(BridgePreferences::default()),
            init_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a manager with the HTTP downloader and zip converter described by `config`
    pub fn from_config(config: &Config, runtime: Arc<dyn ForeignRuntime>) -> Result<Self> {
        let folders = Arc::new(WorkingFolders::from_config(&config.bridge)?);
        let format: ModuleFormat = config.bridge.module_format.parse()?;
        let downloader = Arc::new(HttpRepositoryDownloader::new(&config.repositories)?);

        Ok(Self::new(
            folders,
            runtime,
            downloader,
            Arc::new(ZipPayloadConverter::new(format)),
            UnloadPolicy::from(&config.bridge),
            config.repositories.initial.clone(),
        ))
    }

    pub fn folders(&self) -> &Arc<WorkingFolders> {
        &self.folders
    }

    pub fn runtime(&self) -> &Arc<dyn ForeignRuntime> {
        &self.runtime
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Token cancelled when the bridge shuts down; pass it to source calls
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Load repositories, then modules, then reconvert stale artifacts and
    /// refresh the repositories. A second call is ignored.
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            info!("Bridge manager already initialized, ignoring");
            return Ok(());
        }

        info!(root = %self.folders.root().display(), "Initializing bridge manager");

        self.repositories.initialize().await?;
        self.modules.initialize().await?;
        self.add_initial_repositories().await?;

        let preferences: BridgePreferences = match read_json(&self.folders.bridge_preferences_file()).await {
            Ok(Some(preferences)) => preferences,
            Ok(None) => BridgePreferences::default(),
            Err(e) => {
                warn!(error = %e, "Bridge preferences unreadable, using defaults");
                BridgePreferences::default()
            }
        };
        self.apply_to_runtime(&preferences).await?;
        *self.preferences.lock().await = preferences;

        let entries = self.modules.all_entries().await?;
        let reconverted = self.modules.validate_and_recompile(&entries).await?;
        if reconverted > 0 {
            info!(count = reconverted, "Reconverted module artifacts");
        }

        let refreshed = self.repositories.refresh_all().await?;
        if let Err(e) = self.modules.compare_online_with_local_and_auto_update(&refreshed).await {
            error!(error = %e, "Failed to auto-update modules");
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!("Bridge manager initialized");
        Ok(())
    }

    async fn add_initial_repositories(&self) -> Result<()> {
        for url in &self.initial_repositories {
            match self.repositories.add_url(url).await {
                Ok(true) => info!(url = %url, "Added initial repository"),
                Ok(false) => debug!(url = %url, "Initial repository already present"),
                Err(e) => warn!(url = %url, error = %e, "Failed to add initial repository"),
            }
        }
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(BridgeError::NotInitialized("bridge manager is not initialized".to_string()));
        }
        Ok(())
    }

    pub fn modules(&self) -> Result<Arc<dyn ModuleRegistry>> {
        self.ensure_initialized()?;
        Ok(self.module_registry.clone())
    }

    pub fn repositories(&self) -> Result<Arc<dyn RepositoryRegistry>> {
        self.ensure_initialized()?;
        Ok(self.repository_registry.clone())
    }

    pub async fn get_preferences(&self) -> BridgePreferences {
        self.preferences.lock().await.clone()
    }

    /// Persist new host-wide overrides and push them into the runtime settings
    pub async fn set_preferences(&self, preferences: BridgePreferences) -> Result<()> {
        let mut current = self.preferences.lock().await;
        write_json(&self.folders.bridge_preferences_file(), &preferences).await?;
        self.apply_to_runtime(&preferences).await?;
        *current = preferences;
        info!("Bridge preferences updated");
        Ok(())
    }

    /// Write the overrides into the runtime settings, only when a field differs
    async fn apply_to_runtime(&self, preferences: &BridgePreferences) -> Result<()> {
        let mut settings = match self.runtime.read_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(runtime = %self.runtime.name(), error = %e, "Runtime settings unreadable, using defaults");
                RuntimeSettings::default()
            }
        };

        let mut changed = false;
        if settings.flare_solverr != preferences.flare_solverr {
            settings.flare_solverr = preferences.flare_solverr.clone();
            changed = true;
        }
        if settings.socks_proxy != preferences.socks_proxy {
            settings.socks_proxy = preferences.socks_proxy.clone();
            changed = true;
        }
        if settings.interceptors != preferences.interceptors {
            settings.interceptors = preferences.interceptors.clone();
            changed = true;
        }

        if changed {
            self.runtime.write_settings(&settings).await?;
            debug!(runtime = %self.runtime.name(), "Runtime settings written");
        }
        Ok(())
    }

    /// Cancel in-flight source calls and dispose every loaded module. Never fails.
    pub async fn shutdown(&self) {
        info!("Shutting down bridge manager");
        self.shutdown.cancel();
        self.modules.shutdown().await;
        self.initialized.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::package::tests::{build_package, manifest};
    use crate::bridge::testing::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, runtime: Arc<MockRuntime>, downloader: Arc<MockDownloader>, initial: Vec<String>) -> BridgeManager {
        let folders = Arc::new(WorkingFolders::new(dir.path(), Some(&dir.path().join("tmp"))).unwrap());
        BridgeManager::new(
            folders,
            runtime,
            downloader,
            Arc::new(ZipPayloadConverter::new(ModuleFormat::Archive)),
            UnloadPolicy { attempts: 3, interval: Duration::from_millis(1), drain_timeout: Duration::from_secs(1) },
            initial,
        )
    }

    #[tokio::test]
    async fn test_registries_require_initialize() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, MockRuntime::new(), MockDownloader::new(), Vec::new());
        assert!(matches!(manager.modules(), Err(BridgeError::NotInitialized(_))));
        assert!(matches!(manager.repositories(), Err(BridgeError::NotInitialized(_))));

        manager.initialize().await.unwrap();
        assert!(manager.modules().is_ok());
        assert!(manager.repositories().is_ok());
    }

    #[tokio::test]
    async fn test_second_initialize_is_ignored() {
        let dir = TempDir::new().unwrap();
        let downloader = MockDownloader::new();
        downloader.publish("https://repo.example", Vec::new());
        let manager = manager(&dir, MockRuntime::new(), downloader, vec!["https://repo.example".into()]);

        manager.initialize().await.unwrap();
        manager.initialize().await.unwrap();
        let repositories = manager.repositories().unwrap().list_repositories().await.unwrap();
        assert_eq!(repositories.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_initial_repository_does_not_fail_startup() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, MockRuntime::new(), MockDownloader::new(), vec!["https://down.example".into()]);
        manager.initialize().await.unwrap();
        assert!(manager.repositories().unwrap().list_repositories().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preferences_written_only_on_change() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        let manager = manager(&dir, runtime.clone(), MockDownloader::new(), Vec::new());
        manager.initialize().await.unwrap();
        assert_eq!(runtime.settings_writes.load(Ordering::SeqCst), 0);

        let mut preferences = manager.get_preferences().await;
        preferences.socks_proxy.enabled = true;
        preferences.socks_proxy.host = "127.0.0.1".into();
        preferences.socks_proxy.port = 1080;
        manager.set_preferences(preferences.clone()).await.unwrap();
        assert_eq!(runtime.settings_writes.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.settings().unwrap().socks_proxy.port, 1080);

        manager.set_preferences(preferences.clone()).await.unwrap();
        assert_eq!(runtime.settings_writes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_preferences().await, preferences);
    }

    #[tokio::test]
    async fn test_unreadable_runtime_settings_replaced_by_defaults() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        runtime.set_settings(None);
        let manager = manager(&dir, runtime.clone(), MockDownloader::new(), Vec::new());

        let mut preferences = BridgePreferences::default();
        preferences.flare_solverr.enabled = true;
        manager.set_preferences(preferences).await.unwrap();

        let settings = runtime.settings().unwrap();
        assert!(settings.flare_solverr.enabled);
        assert_eq!(settings.flare_solverr.session_name, "extension.bridge");
    }

    #[tokio::test]
    async fn test_preferences_persist_across_restarts() {
        let dir = TempDir::new().unwrap();
        {
            let manager = manager(&dir, MockRuntime::new(), MockDownloader::new(), Vec::new());
            let mut preferences = BridgePreferences::default();
            preferences.flare_solverr.timeout = 90;
            manager.set_preferences(preferences).await.unwrap();
        }

        let runtime = MockRuntime::new();
        let manager = manager(&dir, runtime.clone(), MockDownloader::new(), Vec::new());
        manager.initialize().await.unwrap();
        assert_eq!(manager.get_preferences().await.flare_solverr.timeout, 90);
        assert_eq!(runtime.settings().unwrap().flare_solverr.timeout, 90);
    }

    #[tokio::test]
    async fn test_shutdown_disposes_interops_and_cancels() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        runtime.register(
            "org.sourcebridge.extension.en.demo",
            MockModule::factory(
                "org.sourcebridge.extension.en.demo.DemoFactory",
                vec![SourceSpec::new(1, "Demo", "en")],
            ),
        );
        let manager = manager(&dir, runtime.clone(), MockDownloader::new(), Vec::new());
        manager.initialize().await.unwrap();

        let modules = manager.modules().unwrap();
        let group = modules
            .add_module_package(&build_package(&manifest("1.4.2", 2), true), false)
            .await
            .unwrap()
            .unwrap();
        let interop = modules.get_interop(&group).await.unwrap();
        let token = manager.cancellation_token();

        manager.shutdown().await;
        assert!(token.is_cancelled());
        assert!(interop.is_disposed());
        assert_eq!(runtime.live_contexts(), 0);
        assert!(manager.modules().is_err());
    }
}
