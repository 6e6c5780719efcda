//! Foreign runtime backed by native dynamic libraries
//!
//! Every execution context is one loaded library. Archive artifacts carry
//! the library as their payload and are extracted into a private folder
//! under the runtime directory before loading. The runtime's global
//! settings live in `<runtime>/settings.json`; libraries receive the path
//! on initialization and are notified whenever it is rewritten.

mod context;
mod library;

pub use context::{NativeContext, NativeFactory, NativeScreen, NativeSource};
pub use library::NativeLibrary;

use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

use super::runtime::{ContextRequest, ExecutionContext, ForeignError, ForeignRuntime, RuntimeSettings};
use crate::core::error::{BridgeError, ErrorContext, Result};
use crate::core::folders::WorkingFolders;

const SETTINGS_FILE: &str = "settings.json";
const CONTEXTS_DIR: &str = "contexts";

#[derive(Default)]
pub struct NativeRuntime {
    runtime_dir: Mutex<Option<PathBuf>>,
    contexts: Mutex<Vec<Weak<NativeContext>>>,
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn runtime_dir(&self) -> Option<PathBuf> {
        self.runtime_dir.lock().ok().and_then(|dir| dir.clone())
    }

    fn settings_path(&self) -> std::result::Result<PathBuf, ForeignError> {
        self.runtime_dir()
            .map(|dir| dir.join(SETTINGS_FILE))
            .ok_or_else(|| ForeignError::Other("native environment is not initialized".to_string()))
    }

    fn live_contexts(&self) -> Vec<Arc<NativeContext>> {
        match self.contexts.lock() {
            Ok(mut contexts) => {
                contexts.retain(|c| c.strong_count() > 0);
                contexts.iter().filter_map(Weak::upgrade).collect()
            }
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl ForeignRuntime for NativeRuntime {
    fn name(&self) -> &str {
        "native"
    }

    async fn initialize_environment(&self, folders: &WorkingFolders) -> std::result::Result<(), ForeignError> {
        let runtime_dir = folders.runtime_dir().to_path_buf();
        let contexts_dir = runtime_dir.join(CONTEXTS_DIR);

        // leftovers of a previous process
        if contexts_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&contexts_dir).await {
                warn!(path = %contexts_dir.display(), error = %e, "Failed to clear stale contexts");
            }
        }
        tokio::fs::create_dir_all(&contexts_dir)
            .await
            .map_err(|e| ForeignError::Io(format!("failed to create {}: {}", contexts_dir.display(), e)))?;

        {
            let mut dir = self
                .runtime_dir
                .lock()
                .map_err(|_| ForeignError::Other("runtime state poisoned".to_string()))?;
            *dir = Some(runtime_dir);
        }
        info!("Native environment initialized");
        Ok(())
    }

    async fn shutdown_environment(&self) -> std::result::Result<(), ForeignError> {
        let remaining = self.live_contexts().len();
        if remaining > 0 {
            warn!(count = remaining, "Native contexts still alive at shutdown");
        }
        if let Ok(mut dir) = self.runtime_dir.lock() {
            *dir = None;
        }
        info!("Native environment shut down");
        Ok(())
    }

    async fn read_settings(&self) -> std::result::Result<RuntimeSettings, ForeignError> {
        let path = self.settings_path()?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ForeignError::Io(format!("failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| ForeignError::Io(format!("failed to parse {}: {}", path.display(), e)))
    }

    async fn write_settings(&self, settings: &RuntimeSettings) -> std::result::Result<(), ForeignError> {
        let path = self.settings_path()?;
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| ForeignError::Other(format!("failed to serialize settings: {}", e)))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ForeignError::Io(format!("failed to write {}: {}", path.display(), e)))?;

        let contexts = self.live_contexts();
        if contexts.is_empty() {
            return Ok(());
        }
        let notified = tokio::task::spawn_blocking(move || {
            for context in contexts {
                if let Err(e) = context.invoke("settingsChanged", &json!({})) {
                    warn!(context = %context.name(), error = %e, "Module rejected settings change");
                }
            }
        })
        .await;
        if let Err(e) = notified {
            warn!(error = %e, "Settings notification task failed");
        }
        Ok(())
    }

    async fn create_context(&self, request: &ContextRequest) -> Result<Arc<dyn ExecutionContext>> {
        if !request.path.exists() {
            return Err(BridgeError::NotFound(format!(
                "module artifact not found: {}",
                request.path.display()
            )));
        }
        let runtime_dir = self
            .runtime_dir()
            .ok_or_else(|| BridgeError::NotInitialized("native environment is not initialized".to_string()))?;

        let owned = request.clone();
        let context = tokio::task::spawn_blocking(move || {
            NativeContext::open(&owned, &runtime_dir.join(CONTEXTS_DIR), &runtime_dir.join(SETTINGS_FILE))
        })
        .await
        .context("context load task failed")??;

        if let Ok(mut contexts) = self.contexts.lock() {
            contexts.push(Arc::downgrade(&context));
        }
        debug!(context = %request.name, format = ?request.format, "Native context created");
        Ok(context)
    }

    fn collect(&self) {
        let live = self.live_contexts().len();
        debug!(live, "Pruned released native contexts");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::types::ModuleFormat;
    use std::io::Write;
    use tempfile::TempDir;

    fn request(path: PathBuf, format: ModuleFormat) -> ContextRequest {
        ContextRequest {
            name: "sourcebridge-en.demo:1.4.2".into(),
            package: "org.sourcebridge.extension.en.demo".into(),
            path,
            format,
        }
    }

    async fn runtime(dir: &TempDir) -> NativeRuntime {
        let folders = WorkingFolders::new(dir.path(), Some(&dir.path().join("tmp"))).unwrap();
        let runtime = NativeRuntime::new();
        runtime.initialize_environment(&folders).await.unwrap();
        runtime
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;
        assert!(matches!(runtime.read_settings().await, Err(ForeignError::Io(_))));

        let mut settings = RuntimeSettings::default();
        settings.socks_proxy.enabled = true;
        settings.socks_proxy.port = 1080;
        runtime.write_settings(&settings).await.unwrap();
        assert_eq!(runtime.read_settings().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn test_requires_environment() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("libdemo.so");
        std::fs::write(&artifact, b"x").unwrap();

        let runtime = NativeRuntime::new();
        assert!(runtime.read_settings().await.is_err());
        let err = runtime.create_context(&request(artifact, ModuleFormat::Library)).await.err().unwrap();
        assert!(matches!(err, BridgeError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_missing_artifact_is_not_found() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;
        let err = runtime
            .create_context(&request(dir.path().join("missing.so"), ModuleFormat::Library))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unloadable_artifacts_are_invalid() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;

        let library = dir.path().join("libdemo.so");
        std::fs::write(&library, b"garbage").unwrap();
        let err = runtime.create_context(&request(library, ModuleFormat::Library)).await.err().unwrap();
        assert!(matches!(err, BridgeError::InvalidModule(_)));

        let archive = dir.path().join("demo.module");
        {
            let mut writer = zip::ZipWriter::new(std::fs::File::create(&archive).unwrap());
            writer.start_file("readme.txt", zip::write::SimpleFileOptions::default()).unwrap();
            writer.write_all(b"no manifest").unwrap();
            writer.finish().unwrap();
        }
        let err = runtime.create_context(&request(archive, ModuleFormat::Archive)).await.err().unwrap();
        assert!(matches!(err, BridgeError::InvalidModule(_)));
    }

    #[tokio::test]
    async fn test_shutdown_forgets_environment() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;
        runtime.collect();
        runtime.shutdown_environment().await.unwrap();
        assert!(runtime.read_settings().await.is_err());
    }
}
