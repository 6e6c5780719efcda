//! Public registries handed to external callers
//!
//! Every value returned here is an owned copy: mutating a returned group or
//! repository never reaches the managers' internal state. Changes go back
//! through the registry methods.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

use super::loader::ModuleInterop;
use super::modules::ModuleManager;
use super::repositories::RepositoryManager;
use super::types::{ModuleDescriptor, ModuleGroup, ModuleVersionEntry, Repository};
use crate::core::error::Result;

/// Module operations available to external callers
#[async_trait]
pub trait ModuleRegistry: Send + Sync {
    async fn add_module(&self, module: &ModuleDescriptor, force: bool) -> Result<Option<ModuleGroup>>;

    async fn add_module_package(&self, bytes: &[u8], force: bool) -> Result<Option<ModuleGroup>>;

    async fn list_modules(&self) -> Result<Vec<ModuleGroup>>;

    async fn find_module(&self, name: &str) -> Result<Option<ModuleGroup>>;

    async fn remove_module(&self, group: &ModuleGroup) -> Result<bool>;

    async fn remove_module_version(&self, entry: &ModuleVersionEntry) -> Result<Option<ModuleGroup>>;

    async fn set_active_module_version(&self, group: &ModuleGroup) -> Result<ModuleGroup>;

    async fn get_interop(&self, group: &ModuleGroup) -> Result<Arc<dyn ModuleInterop>>;
}

/// Repository operations available to external callers
#[async_trait]
pub trait RepositoryRegistry: Send + Sync {
    async fn add_repository(&self, repository: &Repository) -> Result<bool>;

    async fn list_repositories(&self) -> Result<Vec<Repository>>;

    async fn remove_repository(&self, repository: &Repository) -> Result<bool>;

    async fn refresh_all_repositories(&self) -> Result<Vec<Repository>>;
}

pub struct PublicModuleManager {
    modules: Arc<ModuleManager>,
}

impl PublicModuleManager {
    pub fn new(modules: Arc<ModuleManager>) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl ModuleRegistry for PublicModuleManager {
    async fn add_module(&self, module: &ModuleDescriptor, force: bool) -> Result<Option<ModuleGroup>> {
        self.modules.add_module(module, force).await
    }

    async fn add_module_package(&self, bytes: &[u8], force: bool) -> Result<Option<ModuleGroup>> {
        self.modules.add_package(bytes, force).await
    }

    async fn list_modules(&self) -> Result<Vec<ModuleGroup>> {
        self.modules.list().await
    }

    async fn find_module(&self, name: &str) -> Result<Option<ModuleGroup>> {
        self.modules.find(name).await
    }

    async fn remove_module(&self, group: &ModuleGroup) -> Result<bool> {
        self.modules.remove_module(group).await
    }

    async fn remove_module_version(&self, entry: &ModuleVersionEntry) -> Result<Option<ModuleGroup>> {
        self.modules.remove_module_version(entry).await
    }

    async fn set_active_module_version(&self, group: &ModuleGroup) -> Result<ModuleGroup> {
        self.modules.set_active_module_version(group).await
    }

    async fn get_interop(&self, group: &ModuleGroup) -> Result<Arc<dyn ModuleInterop>> {
        self.modules.get_interop(group).await
    }
}

pub struct PublicRepositoryManager {
    repositories: Arc<RepositoryManager>,
    modules: Arc<ModuleManager>,
}

impl PublicRepositoryManager {
    pub fn new(repositories: Arc<RepositoryManager>, modules: Arc<ModuleManager>) -> Self {
        Self { repositories, modules }
    }
}

#[async_trait]
impl RepositoryRegistry for PublicRepositoryManager {
    async fn add_repository(&self, repository: &Repository) -> Result<bool> {
        self.repositories.add(repository.clone()).await
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        self.repositories.list().await
    }

    async fn remove_repository(&self, repository: &Repository) -> Result<bool> {
        self.repositories.remove(repository).await
    }

    /// Refresh every repository, then auto-update installed modules from the new indexes
    async fn refresh_all_repositories(&self) -> Result<Vec<Repository>> {
        let refreshed = self.repositories.refresh_all().await?;
        if let Err(e) = self
            .modules
            .compare_online_with_local_and_auto_update(&refreshed)
            .await
        {
            error!(error = %e, "Failed to auto-update modules after refresh");
        }
        Ok(refreshed)
    }
}
