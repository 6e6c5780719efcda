//! Known online repositories and their persisted indexes

use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::downloader::{normalize_repository_url, RepositoryDownloader};
use super::types::{ModuleDescriptor, Repository};
use crate::core::error::{BridgeError, Result};
use crate::core::folders::{read_json, write_json, WorkingFolders};

/// Stable repository id: sha256 of the upper-cased normalized url
pub fn repository_id(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.to_uppercase().as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct RepositoryManager {
    folders: Arc<WorkingFolders>,
    downloader: Arc<dyn RepositoryDownloader>,
    repositories: Mutex<Vec<Repository>>,
    initialized: AtomicBool,
}

impl RepositoryManager {
    pub fn new(folders: Arc<WorkingFolders>, downloader: Arc<dyn RepositoryDownloader>) -> Self {
        Self {
            folders,
            downloader,
            repositories: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BridgeError::NotInitialized(
                "repository manager is not initialized".to_string(),
            ));
        }
        Ok(())
    }

    /// Load every persisted repository index. A second call is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        let mut repositories = self.repositories.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut loaded = Vec::new();
        for path in self.folders.repository_files()? {
            match read_json::<Repository>(&path).await {
                Ok(Some(repository)) => loaded.push(repository),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable repository file"),
            }
        }
        loaded.sort_by(|a, b| a.url.cmp(&b.url));

        info!(count = loaded.len(), "Loaded online repositories");
        *repositories = loaded;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Repository>> {
        self.ensure_initialized()?;
        Ok(self.repositories.lock().await.clone())
    }

    async fn contains_url(&self, url: &str) -> bool {
        self.repositories
            .lock()
            .await
            .iter()
            .any(|r| r.url.eq_ignore_ascii_case(url))
    }

    /// Add and populate a repository. Returns false when its url is already known.
    pub async fn add(&self, mut repository: Repository) -> Result<bool> {
        self.ensure_initialized()?;
        repository.url = normalize_repository_url(&repository.url);
        if repository.url.is_empty() {
            return Err(BridgeError::InvalidOperation("repository url cannot be empty".to_string()));
        }
        repository.id = repository_id(&repository.url);

        if self.contains_url(&repository.url).await {
            info!(url = %repository.url, "Repository already present");
            return Ok(false);
        }

        let repository = self.downloader.populate(repository).await.map_err(|e| {
            error!(error = %e, "Failed to populate repository");
            e
        })?;
        write_json(&self.folders.repository_file(&repository.id), &repository).await?;

        let mut repositories = self.repositories.lock().await;
        if repositories.iter().any(|r| r.url.eq_ignore_ascii_case(&repository.url)) {
            info!(url = %repository.url, "Repository already present");
            return Ok(false);
        }
        info!(url = %repository.url, modules = repository.modules.len(), "Added repository");
        repositories.push(repository);
        Ok(true)
    }

    pub async fn add_url(&self, url: &str) -> Result<bool> {
        self.add(Repository {
            url: url.to_string(),
            ..Default::default()
        })
        .await
    }

    /// Forget a repository and its persisted index. Returns false when it was unknown.
    pub async fn remove(&self, repository: &Repository) -> Result<bool> {
        self.ensure_initialized()?;
        let url = normalize_repository_url(&repository.url);

        let removed: Vec<Repository> = {
            let mut repositories = self.repositories.lock().await;
            let (removed, kept) = std::mem::take(&mut *repositories)
                .into_iter()
                .partition(|r| r.url.eq_ignore_ascii_case(&url));
            *repositories = kept;
            removed
        };

        if removed.is_empty() {
            info!(url = %url, "Repository not found");
            return Ok(false);
        }

        for repository in &removed {
            let path = self.folders.repository_file(&repository.id);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to delete repository file");
                }
            }
        }
        info!(url = %url, "Removed repository");
        Ok(true)
    }

    /// Re-populate every repository concurrently. Failures are logged per
    /// repository; the refreshed snapshot is returned.
    pub async fn refresh_all(&self) -> Result<Vec<Repository>> {
        self.ensure_initialized()?;
        let snapshot = self.repositories.lock().await.clone();

        let refreshes = snapshot.into_iter().map(|repository| async move {
            let url = repository.url.clone();
            debug!(url = %url, "Refreshing repository");
            match self.downloader.populate(repository.clone()).await {
                Ok(updated) => match write_json(&self.folders.repository_file(&updated.id), &updated).await {
                    Ok(()) => {
                        info!(url = %url, modules = updated.modules.len(), "Refreshed repository");
                        updated
                    }
                    Err(e) => {
                        error!(url = %url, error = %e, "Failed to persist refreshed repository");
                        updated
                    }
                },
                Err(e) => {
                    error!(url = %url, error = %e, "Failed to refresh repository");
                    repository
                }
            }
        });
        let refreshed = join_all(refreshes).await;

        let mut repositories = self.repositories.lock().await;
        for updated in &refreshed {
            if let Some(existing) = repositories.iter_mut().find(|r| r.id == updated.id) {
                *existing = updated.clone();
            }
        }
        Ok(refreshed)
    }

    /// Locate the repository listing a module with the same package file
    pub async fn find_real_repository(
        &self,
        module: &ModuleDescriptor,
    ) -> Result<Option<(Repository, ModuleDescriptor)>> {
        self.ensure_initialized()?;
        let repositories = self.repositories.lock().await;
        for repository in repositories.iter() {
            if let Some(found) = repository.modules.iter().find(|m| m.package_file == module.package_file) {
                debug!(url = %repository.url, package = %module.package_file, "Found repository for module");
                return Ok(Some((repository.clone(), found.clone())));
            }
        }
        Ok(None)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Repository>> {
        self.ensure_initialized()?;
        Ok(self.repositories.lock().await.iter().find(|r| r.id == id).cloned())
    }
}
