//! Installed modules: groups of versions, install pipeline and interop cache

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::downloader::RepositoryDownloader;
use super::loader::{load_interop, LoadRequest, ModuleInterop, UnloadPolicy};
use super::package::{PackageConverter, WorkUnit};
use super::repositories::RepositoryManager;
use super::runtime::ForeignRuntime;
use super::types::{ModuleDescriptor, ModuleGroup, ModuleVersionEntry, Repository, SourceInfo};
use crate::core::error::{BridgeError, Result};
use crate::core::folders::{read_json, verify_file_blocking, write_json, FolderSwap, WorkingFolders};

/// Repository id recorded on modules installed from raw package bytes
pub const LOCAL_REPOSITORY_ID: &str = "local";

pub struct ModuleManager {
    folders: Arc<WorkingFolders>,
    repositories: Arc<RepositoryManager>,
    downloader: Arc<dyn RepositoryDownloader>,
    converter: Arc<dyn PackageConverter>,
    runtime: Arc<dyn ForeignRuntime>,
    policy: UnloadPolicy,
    groups: Mutex<Vec<ModuleGroup>>,
    interops: Mutex<HashMap<String, Arc<dyn ModuleInterop>>>,
    initialized: AtomicBool,
}

impl ModuleManager {
    pub fn new(
        folders: Arc<WorkingFolders>,
        repositories: Arc<RepositoryManager>,
        downloader: Arc<dyn RepositoryDownloader>,
        converter: Arc<dyn PackageConverter>,
        runtime: Arc<dyn ForeignRuntime>,
        policy: UnloadPolicy,
    ) -> Self {
        Self {
            folders,
            repositories,
            downloader,
            converter,
            runtime,
            policy,
            groups: Mutex::new(Vec::new()),
            interops: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BridgeError::NotInitialized("module manager is not initialized".to_string()));
        }
        Ok(())
    }

    pub async fn initialize(&self) -> Result<()> {
        let mut groups = self.groups.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let loaded: Vec<ModuleGroup> = read_json(&self.folders.local_modules_file()).await?.unwrap_or_default();
        info!(count = loaded.len(), "Loaded local modules");
        *groups = loaded;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ModuleGroup>> {
        self.ensure_initialized()?;
        Ok(self.groups.lock().await.clone())
    }

    pub async fn find(&self, name: &str) -> Result<Option<ModuleGroup>> {
        self.ensure_initialized()?;
        Ok(self.groups.lock().await.iter().find(|g| g.name == name).cloned())
    }

    /// Every installed version across all groups
    pub async fn all_entries(&self) -> Result<Vec<ModuleVersionEntry>> {
        self.ensure_initialized()?;
        Ok(self
            .groups
            .lock()
            .await
            .iter()
            .flat_map(|g| g.entries.iter().cloned())
            .collect())
    }

    fn version_folder(&self, entry: &ModuleVersionEntry) -> PathBuf {
        self.folders
            .version_folder(&entry.name, &entry.module.version, &entry.repository_id)
    }

    async fn persist(&self, groups: &[ModuleGroup]) -> Result<()> {
        write_json(&self.folders.local_modules_file(), groups).await
    }

    /// The group named after `module` and, if installed with intact files, its matching entry
    async fn find_installed(&self, module: &ModuleDescriptor) -> (Option<ModuleGroup>, Option<ModuleVersionEntry>) {
        let name = module.module_name();
        // snapshot under the lock, check files without it
        let (group, candidates) = {
            let groups = self.groups.lock().await;
            let group = groups.iter().find(|g| g.name == name).cloned();
            let candidates: Vec<ModuleVersionEntry> = groups
                .iter()
                .flat_map(|g| g.entries.iter())
                .filter(|e| e.module.package_file == module.package_file)
                .cloned()
                .collect();
            (group, candidates)
        };

        for entry in candidates {
            let folder = self.version_folder(&entry);
            let icon_ok = match &entry.icon {
                Some(icon) => tokio::fs::try_exists(folder.join(&icon.file_name)).await.unwrap_or(false),
                None => true,
            };
            let artifact_ok = tokio::fs::try_exists(folder.join(&entry.artifact.file_name))
                .await
                .unwrap_or(false);
            if icon_ok
                && artifact_ok
                && verify_file_blocking(folder.join(&entry.package.file_name), entry.package.sha256.clone()).await
            {
                debug!(package = %module.package_file, version = %entry.module.version, "Found installed module");
                return (group, Some(entry));
            }
        }
        (group, None)
    }

    /// Install a module listed by a known repository
    pub async fn add_module(&self, module: &ModuleDescriptor, force: bool) -> Result<Option<ModuleGroup>> {
        self.ensure_initialized()?;
        let (repository, module) = self
            .repositories
            .find_real_repository(module)
            .await?
            .ok_or_else(|| {
                BridgeError::NotFound(format!(
                    "module {} is not listed by any repository",
                    module.package_file
                ))
            })?;
        self.add_from_repository(&repository, &module, force).await
    }

    pub async fn add_from_repository(
        &self,
        repository: &Repository,
        module: &ModuleDescriptor,
        force: bool,
    ) -> Result<Option<ModuleGroup>> {
        self.ensure_initialized()?;
        let (group, installed) = self.find_installed(module).await;
        if installed.is_some() && !force {
            info!(package = %module.package_file, version = %module.version, "Module already installed, skipping");
            return Ok(group);
        }

        let entry = ModuleVersionEntry {
            name: module.module_name(),
            module: module.clone(),
            repository_id: repository.id.clone(),
            is_local: false,
            ..Default::default()
        };
        let mut unit = WorkUnit::new(self.folders.create_work_dir()?, entry);

        let result = async {
            self.downloader.download_module(repository, &mut unit).await?;
            // the package hash identifies the version across repositories
            unit.entry.id = unit.entry.package.sha256.clone();
            unit.apply_manifest()?;
            self.compile(&mut unit).await?;
            self.record(unit.entry.clone()).await
        }
        .await;

        result.map(Some).map_err(|e| {
            error!(package = %module.package_file, version = %module.version, error = %e, "Failed to add module");
            e
        })
    }

    /// Install a module from raw package bytes
    pub async fn add_package(&self, bytes: &[u8], force: bool) -> Result<Option<ModuleGroup>> {
        self.ensure_initialized()?;
        // the manifest is the only source of identity for raw bytes
        let mut unit = WorkUnit::from_bytes(self.folders.create_work_dir()?, bytes)?;
        unit.entry.id = unit.entry.package.sha256.clone();
        unit.entry.repository_id = LOCAL_REPOSITORY_ID.to_string();
        unit.apply_manifest()?;

        let (group, installed) = self.find_installed(&unit.entry.module).await;
        if installed.is_some() && !force {
            info!(package = %unit.entry.package.file_name, "Module already installed, skipping");
            return Ok(group);
        }

        self.compile(&mut unit).await?;
        self.record(unit.entry.clone()).await.map(Some)
    }

    /// Convert the package and settle metadata by loading the module once
    async fn compile(&self, unit: &mut WorkUnit) -> Result<()> {
        self.converter.convert(unit).await?;
        // load from the work folder so a broken module never reaches its version folder
        self.obtain_information(unit).await?;
        self.accept(unit)
    }

    /// Load the freshly converted module from the work folder, derive its
    /// language and reconcile the listed sources with the live ones.
    async fn obtain_information(&self, unit: &mut WorkUnit) -> Result<()> {
        let interop = load_interop(LoadRequest {
            entry: unit.entry.clone(),
            module_name: unit.entry.name.clone(),
            artifact_path: unit.artifact_path(),
            preferences_path: self.folders.source_preferences_file(&unit.entry.name),
            runtime: self.runtime.clone(),
            policy: self.policy,
        })
        .await?;

        let descriptors: Vec<_> = interop.sources().iter().map(|s| s.descriptor().clone()).collect();
        interop.dispose().await;

        let module = &mut unit.entry.module;
        module.language = match descriptors.first() {
            Some(first) if descriptors.iter().all(|d| d.language == first.language) => first.language.clone(),
            _ => "all".to_string(),
        };

        let mut listed = std::mem::take(&mut module.sources);
        for descriptor in &descriptors {
            let id = descriptor.id.to_string();
            let info = SourceInfo {
                id: id.clone(),
                name: descriptor.name.clone(),
                language: descriptor.language.clone(),
                base_url: descriptor.base_url.clone(),
                version_id: descriptor.version_id,
            };
            listed.retain(|s| s.id != id);
            module.sources.push(info);
        }
        for leftover in listed {
            warn!(
                source = %leftover.name,
                source_id = %leftover.id,
                package = %module.package_file,
                "Listed source not found in module, removing"
            );
        }
        Ok(())
    }

    /// Move the work unit into its version folder
    fn accept(&self, unit: &WorkUnit) -> Result<()> {
        let target = self.version_folder(&unit.entry);
        let swap = FolderSwap::install(unit.path(), &target)?;
        swap.commit()?;
        debug!(module = %unit.entry.name, folder = %target.display(), "Installed module version");
        Ok(())
    }

    /// Add `entry` to its group, creating the group when needed, and persist
    async fn record(&self, entry: ModuleVersionEntry) -> Result<ModuleGroup> {
        let mut groups = self.groups.lock().await;
        // find or create the group
        let position = match groups.iter().position(|g| g.name == entry.name) {
            Some(position) => position,
            None => {
                groups.push(ModuleGroup {
                    name: entry.name.clone(),
                    ..Default::default()
                });
                groups.len() - 1
            }
        };

        let group = &mut groups[position];
        // a reinstall replaces the entry with the same id
        let active_id = group.active().ok().map(|e| e.id.clone());
        group.entries.retain(|e| e.id != entry.id);
        info!(module = %entry.name, version = %entry.module.version, "Recorded module version");
        group.entries.push(entry);

        // auto update follows the latest version, otherwise keep the user's pick
        let active = if group.auto_update {
            group.latest_index()
        } else {
            active_id
                .and_then(|id| group.entries.iter().position(|e| e.id == id))
                .or_else(|| group.latest_index())
        };
        group.active_entry = active.unwrap_or(0);

        let snapshot = group.clone();
        self.persist(&groups).await?;
        Ok(snapshot)
    }

    /// Remove a whole group and unload its interop. Returns false when unknown.
    pub async fn remove_module(&self, group: &ModuleGroup) -> Result<bool> {
        self.ensure_initialized()?;
        {
            let mut groups = self.groups.lock().await;
            let before = groups.len();
            groups.retain(|g| g.name != group.name);
            if groups.len() == before {
                return Ok(false);
            }
            self.persist(&groups).await?;
        }

        if let Some(interop) = self.interops.lock().await.remove(&group.name) {
            interop.dispose().await;
        }
        info!(module = %group.name, "Removed module");
        Ok(true)
    }

    /// Remove one installed version. Returns the remaining group, `None` when it became empty.
    pub async fn remove_module_version(&self, entry: &ModuleVersionEntry) -> Result<Option<ModuleGroup>> {
        self.ensure_initialized()?;
        let (name, remaining) = {
            let mut groups = self.groups.lock().await;
            let position = groups
                .iter()
                .position(|g| g.entries.iter().any(|e| e.id == entry.id))
                .ok_or_else(|| {
                    BridgeError::InvalidOperation(format!(
                        "module version {} {} is not installed",
                        entry.name, entry.module.version
                    ))
                })?;

            let group = &mut groups[position];
            let name = group.name.clone();
            let active_id = group.active().ok().map(|e| e.id.clone()).filter(|id| *id != entry.id);
            group.entries.retain(|e| e.id != entry.id);

            let remaining = if group.entries.is_empty() {
                groups.remove(position);
                None
            } else {
                group.active_entry = active_id
                    .and_then(|id| group.entries.iter().position(|e| e.id == id))
                    .or_else(|| group.latest_index())
                    .unwrap_or(0);
                Some(group.clone())
            };
            self.persist(&groups).await?;
            (name, remaining)
        };

        let mut interops = self.interops.lock().await;
        let stale = match (&remaining, interops.get(&name)) {
            (None, Some(_)) => true,
            (Some(_), Some(interop)) => interop.id() == entry.id,
            _ => false,
        };
        if stale {
            if let Some(interop) = interops.remove(&name) {
                interop.dispose().await;
            }
        }

        info!(module = %name, version = %entry.module.version, "Removed module version");
        Ok(remaining)
    }

    /// Apply the active version (and auto update flag) of `group` to the installed group
    pub async fn set_active_module_version(&self, group: &ModuleGroup) -> Result<ModuleGroup> {
        self.ensure_initialized()?;
        let updated = {
            let mut groups = self.groups.lock().await;
            let stored = groups
                .iter_mut()
                .find(|g| g.name == group.name)
                .ok_or_else(|| BridgeError::NotFound(format!("module {} is not installed", group.name)))?;

            if group.active_entry >= stored.entries.len() {
                return Err(BridgeError::InvalidOperation(format!(
                    "active entry index {} is out of range for module {}",
                    group.active_entry, group.name
                )));
            }
            stored.active_entry = group.active_entry;
            stored.auto_update = group.auto_update;
            let updated = stored.clone();
            self.persist(&groups).await?;
            updated
        };

        let active_id = updated.active()?.id.clone();
        let mut interops = self.interops.lock().await;
        if interops.get(&updated.name).is_some_and(|i| i.id() != active_id) {
            if let Some(interop) = interops.remove(&updated.name) {
                interop.dispose().await;
            }
        }

        info!(module = %updated.name, version = %updated.active()?.module.version, "Active module version set");
        Ok(updated)
    }

    /// Interop for the active version of `group`, loading it on first use or after a version switch
    pub async fn get_interop(&self, group: &ModuleGroup) -> Result<Arc<dyn ModuleInterop>> {
        self.ensure_initialized()?;
        let active = {
            let groups = self.groups.lock().await;
            let stored = groups
                .iter()
                .find(|g| g.name == group.name)
                .ok_or_else(|| BridgeError::NotFound(format!("module {} is not installed", group.name)))?;
            stored.active()?.clone()
        };

        let mut interops = self.interops.lock().await;
        if let Some(interop) = interops.get(&group.name) {
            if interop.id() == active.id && !interop.is_disposed() {
                return Ok(interop.clone());
            }
        }
        if let Some(previous) = interops.remove(&group.name) {
            info!(module = %group.name, from = %previous.version(), to = %active.module.version, "Swapping module version");
            previous.dispose().await;
        }

        let folder = self.version_folder(&active);
        let interop = load_interop(LoadRequest {
            module_name: group.name.clone(),
            artifact_path: folder.join(&active.artifact.file_name),
            preferences_path: self.folders.source_preferences_file(&group.name),
            runtime: self.runtime.clone(),
            policy: self.policy,
            entry: active,
        })
        .await
        .map_err(|e| {
            error!(module = %group.name, error = %e, "Failed to load module");
            e
        })?;

        interops.insert(group.name.clone(), interop.clone());
        Ok(interop)
    }

    /// Reconvert entries whose artifact was produced by another converter
    /// version or format. Returns how many were reconverted.
    pub async fn validate_and_recompile(&self, entries: &[ModuleVersionEntry]) -> Result<usize> {
        self.ensure_initialized()?;
        let mut processed = Vec::new();

        for entry in entries {
            let folder = self.version_folder(entry);
            let package = folder.join(&entry.package.file_name);
            if !package.exists() || !folder.join(&entry.artifact.file_name).exists() {
                info!(module = %entry.name, folder = %folder.display(), "Skipping entry with missing artifacts");
                continue;
            }

            // up to date with this converter
            if entry.artifact.version.eq_ignore_ascii_case(self.converter.version())
                && entry.format == self.converter.format()
            {
                continue;
            }

            info!(
                module = %entry.name,
                artifact_version = %entry.artifact.version,
                converter_version = %self.converter.version(),
                "Converter mismatch, reconverting module"
            );

            // rebuild from the kept package in a fresh work folder
            let result = async {
                let unit_dir = self.folders.create_work_dir()?;
                tokio::fs::copy(&package, unit_dir.path().join(&entry.package.file_name)).await?;
                if let Some(icon) = &entry.icon {
                    let icon_path = folder.join(&icon.file_name);
                    if tokio::fs::try_exists(&icon_path).await.unwrap_or(false) {
                        tokio::fs::copy(&icon_path, unit_dir.path().join(&icon.file_name)).await?;
                    }
                }
                let mut unit = WorkUnit::new(unit_dir, entry.clone());
                self.compile(&mut unit).await?;
                Ok::<_, BridgeError>(unit.entry.clone())
            }
            .await;

            match result {
                Ok(updated) => processed.push(updated),
                Err(e) => error!(module = %entry.name, error = %e, "Failed to reconvert module"),
            }
        }

        // failures keep their old entry; only successes are written back
        if !processed.is_empty() {
            let mut groups = self.groups.lock().await;
            for updated in &processed {
                for group in groups.iter_mut() {
                    if let Some(slot) = group.entries.iter_mut().find(|e| e.id == updated.id) {
                        *slot = updated.clone();
                    }
                }
            }
            self.persist(&groups).await?;
        }
        Ok(processed.len())
    }

    /// Reinstall modules whose latest installed version differs from what a repository lists
    pub async fn compare_online_with_local_and_auto_update(&self, repositories: &[Repository]) -> Result<()> {
        self.ensure_initialized()?;
        let latest: HashMap<String, String> = self
            .groups
            .lock()
            .await
            .iter()
            .filter_map(|g| {
                g.latest_index()
                    .map(|i| (g.name.clone(), g.entries[i].module.version.clone()))
            })
            .collect();
        debug!(count = latest.len(), "Computed latest local module versions");

        for repository in repositories {
            for module in &repository.modules {
                let Some(local) = latest.get(&module.module_name()) else {
                    continue;
                };
                if *local == module.version {
                    continue;
                }

                info!(package = %module.package_file, from = %local, to = %module.version, "Auto-updating module");
                match self.add_from_repository(repository, module, false).await {
                    Ok(_) => info!(package = %module.package_file, version = %module.version, "Auto-updated module"),
                    Err(e) => error!(package = %module.package_file, error = %e, "Failed to auto-update module"),
                }
            }
        }
        Ok(())
    }

    /// Dispose every cached interop
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Arc<dyn ModuleInterop>)> = self.interops.lock().await.drain().collect();
        for (name, interop) in drained {
            interop.dispose().await;
            debug!(module = %name, "Disposed module interop");
        }
        info!("Module manager shut down");
    }
}
