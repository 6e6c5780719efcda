//! Shared loader machinery
//!
//! Both module formats load the same way once their sources are discovered:
//! one execution context per module version, one [`SourceInterop`] per
//! discovered source, one preference store per logical module, and an
//! advisory unload that polls the context's liveness a bounded number of times.
//! Unload first closes the module's call gate and waits for running source
//! calls, so the context is not torn down under them.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::archive::ArchiveExtensionInterop;
use super::extension::ExtensionInterop;
use super::gate::CallGate;
use super::preferences::{BaseKeyRule, PreferenceStore};
use super::runtime::{ContextRequest, ExecutionContext, ForeignRuntime, ForeignSource};
use super::source::SourceInterop;
use super::types::{ModuleFormat, ModuleVersionEntry, UniquePreference};
use crate::core::config::BridgeConfig;
use crate::core::error::{BridgeError, Result};

/// A loaded module version and the sources it exposes
#[async_trait]
pub trait ModuleInterop: Send + Sync {
    /// Id of the module version entry this interop was loaded from
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn format(&self) -> ModuleFormat;

    /// Snapshot of the wrapped sources; empty once disposed
    fn sources(&self) -> Vec<Arc<SourceInterop>>;

    async fn load_preferences(&self) -> Result<Vec<UniquePreference>>;

    async fn save_preferences(&self, preferences: &[UniquePreference]) -> Result<()>;

    /// Whether the execution context has not been reclaimed yet
    fn is_alive(&self) -> bool;

    fn is_disposed(&self) -> bool;

    /// Unload the module. Never fails; a second call is a no-op.
    async fn dispose(&self);
}

/// How hard to push for reclamation after an unload request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnloadPolicy {
    pub attempts: u32,
    pub interval: Duration,
    /// Longest wait for running source calls before the context is unloaded anyway
    pub drain_timeout: Duration,
}

impl Default for UnloadPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&BridgeConfig> for UnloadPolicy {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            attempts: config.unload_poll_attempts,
            interval: config.unload_poll_interval(),
            drain_timeout: config.unload_drain_timeout(),
        }
    }
}

/// Everything needed to load one module version
#[derive(Clone)]
pub struct LoadRequest {
    pub entry: ModuleVersionEntry,
    /// Logical module name, owner of the preference file
    pub module_name: String,
    pub artifact_path: PathBuf,
    pub preferences_path: PathBuf,
    pub runtime: Arc<dyn ForeignRuntime>,
    pub policy: UnloadPolicy,
}

/// Load `request` with the loader matching the entry's format
pub async fn load_interop(request: LoadRequest) -> Result<Arc<dyn ModuleInterop>> {
    let interop: Arc<dyn ModuleInterop> = match request.entry.format {
        ModuleFormat::Library => Arc::new(ExtensionInterop::load(request).await?),
        ModuleFormat::Archive => Arc::new(ArchiveExtensionInterop::load(request).await?),
    };
    Ok(interop)
}

/// Single owner of an execution context
pub(crate) struct ContextGuard {
    name: String,
    context: Mutex<Option<Arc<dyn ExecutionContext>>>,
    weak: Weak<dyn ExecutionContext>,
}

impl ContextGuard {
    pub(crate) fn new(context: Arc<dyn ExecutionContext>) -> Self {
        Self {
            name: context.name().to_string(),
            weak: Arc::downgrade(&context),
            context: Mutex::new(Some(context)),
        }
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn ExecutionContext>> {
        self.context.lock().ok().and_then(|c| c.clone())
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.weak.strong_count() > 0
    }

    /// Request unload and drop the owning reference. Returns false if already released.
    fn unload_and_drop(&self) -> bool {
        let context = match self.context.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(context) = context else {
            return false;
        };
        if let Err(e) = context.unload() {
            warn!(context = %self.name, error = %e, "Context unload request failed");
        }
        true
    }

    /// Unload, then poll liveness with collection passes in between
    pub(crate) async fn release(&self, runtime: &dyn ForeignRuntime, policy: UnloadPolicy) {
        if !self.unload_and_drop() {
            return;
        }

        for attempt in 0..policy.attempts {
            if !self.is_alive() {
                debug!(context = %self.name, attempt, "Context reclaimed");
                return;
            }
            runtime.collect();
            tokio::time::sleep(policy.interval).await;
        }

        if self.is_alive() {
            warn!(
                context = %self.name,
                attempts = policy.attempts,
                "Context still alive after unload, something still references it"
            );
        }
    }

    /// Synchronous best effort used when the owner is dropped without dispose
    pub(crate) fn release_now(&self) {
        self.unload_and_drop();
    }
}

/// Loaded module state shared by both loader variants
pub(crate) struct LoadedModule {
    entry: ModuleVersionEntry,
    runtime: Arc<dyn ForeignRuntime>,
    guard: ContextGuard,
    sources: RwLock<Vec<Arc<SourceInterop>>>,
    preferences: PreferenceStore,
    gate: Arc<CallGate>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
    policy: UnloadPolicy,
}

impl LoadedModule {
    /// Create the context, run `discover` in it and wrap what it finds
    pub(crate) async fn load<D>(request: LoadRequest, rule: BaseKeyRule, discover: D) -> Result<Self>
    where
        D: FnOnce(&dyn ExecutionContext, &ModuleVersionEntry) -> Result<Vec<Arc<dyn ForeignSource>>>,
    {
        let LoadRequest {
            entry,
            module_name,
            artifact_path,
            preferences_path,
            runtime,
            policy,
        } = request;

        if !artifact_path.exists() {
            return Err(BridgeError::NotFound(format!(
                "module artifact not found: {}",
                artifact_path.display()
            )));
        }

        let context = runtime
            .create_context(&ContextRequest {
                name: format!("{}:{}", module_name, entry.module.version),
                package: entry.module.package.clone(),
                path: artifact_path.clone(),
                format: entry.format,
            })
            .await?;
        let guard = ContextGuard::new(context.clone());

        let discovered = discover(context.as_ref(), &entry);
        // the guard must hold the only strong reference
        drop(context);

        // nothing usable: unload before reporting
        let found = match discovered {
            Ok(found) if !found.is_empty() => found,
            Ok(_) => {
                guard.release(runtime.as_ref(), policy).await;
                return Err(BridgeError::InvalidModule(format!(
                    "module {} exposes no sources",
                    entry.module.package
                )));
            }
            Err(e) => {
                guard.release(runtime.as_ref(), policy).await;
                return Err(e);
            }
        };

        // every source shares the module's shutdown token and call gate
        let shutdown = CancellationToken::new();
        let gate = CallGate::new();
        let sources: Vec<Arc<SourceInterop>> = found
            .into_iter()
            .map(|source| Arc::new(SourceInterop::gated(&module_name, source, shutdown.clone(), gate.clone())))
            .collect();

        info!(
            module = %module_name,
            version = %entry.module.version,
            format = ?entry.format,
            sources = sources.len(),
            "Module loaded"
        );

        Ok(Self {
            preferences: PreferenceStore::new(&module_name, preferences_path, rule),
            entry,
            runtime,
            guard,
            sources: RwLock::new(sources),
            gate,
            shutdown,
            disposed: AtomicBool::new(false),
            policy,
        })
    }

    pub(crate) fn entry(&self) -> &ModuleVersionEntry {
        &self.entry
    }

    pub(crate) fn sources(&self) -> Vec<Arc<SourceInterop>> {
        self.sources.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub(crate) async fn load_preferences(&self) -> Result<Vec<UniquePreference>> {
        self.ensure_live()?;
        self.preferences.load(&self.sources()).await
    }

    pub(crate) async fn save_preferences(&self, preferences: &[UniquePreference]) -> Result<()> {
        self.ensure_live()?;
        self.preferences.save(preferences, &self.sources()).await
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.guard.is_alive()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(BridgeError::Disposed(format!("module {}", self.entry.name)));
        }
        Ok(())
    }

    fn take_sources(&self) -> Vec<Arc<SourceInterop>> {
        match self.sources.write() {
            Ok(mut sources) => std::mem::take(&mut *sources),
            Err(_) => Vec::new(),
        }
    }

    pub(crate) async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        // stop admitting calls and let the running ones return
        if !self.gate.close_and_drain(self.policy.drain_timeout).await {
            warn!(
                module = %self.entry.name,
                in_flight = self.gate.in_flight(),
                "Source calls still running after drain timeout, unloading anyway"
            );
        }

        // abort stragglers, then release sources before the context
        self.shutdown.cancel();
        for source in self.take_sources() {
            source.dispose();
        }
        self.guard.release(self.runtime.as_ref(), self.policy).await;

        info!(module = %self.entry.name, version = %self.entry.module.version, "Module unloaded");
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.gate.close();
        self.shutdown.cancel();
        for source in self.take_sources() {
            source.dispose();
        }
        self.guard.release_now();
    }
}

/// Implements [`ModuleInterop`] for a loader wrapping a `LoadedModule` in `inner`
macro_rules! delegate_module_interop {
    ($loader:ty) => {
        #[async_trait::async_trait]
        impl $crate::bridge::loader::ModuleInterop for $loader {
            fn id(&self) -> &str {
                &self.inner.entry().id
            }

            fn name(&self) -> &str {
                &self.inner.entry().name
            }

            fn version(&self) -> &str {
                &self.inner.entry().module.version
            }

            fn format(&self) -> $crate::bridge::types::ModuleFormat {
                self.inner.entry().format
            }

            fn sources(&self) -> Vec<std::sync::Arc<$crate::bridge::source::SourceInterop>> {
                self.inner.sources()
            }

            async fn load_preferences(&self) -> $crate::core::error::Result<Vec<$crate::bridge::types::UniquePreference>> {
                self.inner.load_preferences().await
            }

            async fn save_preferences(
                &self,
                preferences: &[$crate::bridge::types::UniquePreference],
            ) -> $crate::core::error::Result<()> {
                self.inner.save_preferences(preferences).await
            }

            fn is_alive(&self) -> bool {
                self.inner.is_alive()
            }

            fn is_disposed(&self) -> bool {
                self.inner.is_disposed()
            }

            async fn dispose(&self) {
                self.inner.dispose().await
            }
        }
    };
}

pub(crate) use delegate_module_interop;
