//! Repository index and package downloads over HTTP

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::package::WorkUnit;
use super::types::{FileHash, ModuleDescriptor, Repository};
use crate::core::config::RepositoryConfig;
use crate::core::error::{BridgeError, Result};
use crate::core::folders::sha256_file;

const META_FILE: &str = "repo.json";
const INDEX_FILES: [&str; 2] = ["index.min.json", "index.json"];

/// Fetches repository indexes and module packages
#[async_trait]
pub trait RepositoryDownloader: Send + Sync {
    /// Fill name, website, fingerprint and the module list of `repository`
    async fn populate(&self, repository: Repository) -> Result<Repository>;

    /// Download the package of `unit.entry.module` into the unit's folder
    async fn download_module(&self, repository: &Repository, unit: &mut WorkUnit) -> Result<()>;
}

/// Strip index file names and trailing slashes from a repository url
pub fn normalize_repository_url(url: &str) -> String {
    let mut url = url.trim();
    for index in ["index.min.json", "index.json"] {
        let start = url.len().saturating_sub(index.len());
        if url.len() >= index.len() && url.get(start..).is_some_and(|tail| tail.eq_ignore_ascii_case(index)) {
            url = &url[..start];
        }
    }
    url.strip_suffix('/').unwrap_or(url).to_string()
}

/// Join path segments onto a base url
pub fn combine_url(base: &str, segments: &[&str]) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for segment in segments {
        url.push('/');
        url.push_str(segment.trim_matches('/'));
    }
    url
}

pub fn package_url(repository: &Repository, module: &ModuleDescriptor) -> String {
    combine_url(&normalize_repository_url(&repository.url), &["apk", &module.package_file])
}

pub fn icon_url(repository: &Repository, module: &ModuleDescriptor) -> String {
    let icon = Path::new(&module.package_file).with_extension("png");
    combine_url(
        &normalize_repository_url(&repository.url),
        &["icon", &icon.to_string_lossy()],
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RepositoryMeta {
    meta: RepositoryMetaInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RepositoryMetaInfo {
    name: String,
    website: String,
    signing_key_fingerprint: String,
}

fn request_error(url: &str, err: reqwest::Error) -> BridgeError {
    match err.status() {
        Some(status) => BridgeError::request_with_status(status.as_u16(), format!("{}: {}", url, err)),
        None => BridgeError::request(format!("{}: {}", url, err)),
    }
}

/// [`RepositoryDownloader`] backed by `reqwest`
pub struct HttpRepositoryDownloader {
    client: reqwest::Client,
}

impl HttpRepositoryDownloader {
    pub fn new(config: &RepositoryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.request_timeout))
            .build()
            .map_err(|e| BridgeError::Initialization(format!("failed to build http client: {}", e)))?;
        Ok(Self { client })
    }

    async fn get_ok(&self, url: &str) -> Result<Option<reqwest::Response>> {
        let response = self.client.get(url).send().await.map_err(|e| request_error(url, e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().map_err(|e| request_error(url, e))?;
        Ok(Some(response))
    }

    async fn download_file(&self, url: &str, destination: &Path) -> Result<()> {
        debug!(url = %url, destination = %destination.display(), "Downloading file");
        let response = self
            .get_ok(url)
            .await?
            .ok_or_else(|| BridgeError::request_with_status(404, format!("{} not found", url)))?;

        let mut file = tokio::fs::File::create(destination).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| request_error(url, e))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl RepositoryDownloader for HttpRepositoryDownloader {
    async fn populate(&self, mut repository: Repository) -> Result<Repository> {
        let base = normalize_repository_url(&repository.url);
        info!(url = %base, "Fetching repository index");

        let meta_url = combine_url(&base, &[META_FILE]);
        match self.get_ok(&meta_url).await {
            Ok(Some(response)) => match response.json::<RepositoryMeta>().await {
                Ok(meta) => {
                    repository.name = meta.meta.name;
                    repository.website = meta.meta.website;
                    repository.fingerprint = meta.meta.signing_key_fingerprint;
                }
                Err(e) => warn!(url = %meta_url, error = %e, "Ignoring unreadable repository meta"),
            },
            Ok(None) => debug!(url = %meta_url, "Repository has no meta file"),
            Err(e) => debug!(url = %meta_url, error = %e, "Repository meta unavailable"),
        }

        for index in INDEX_FILES {
            let url = combine_url(&base, &[index]);
            let Some(response) = self.get_ok(&url).await? else {
                debug!(url = %url, "Index not found, trying next candidate");
                continue;
            };

            let modules: Vec<ModuleDescriptor> = response.json().await.map_err(|e| request_error(&url, e))?;
            info!(url = %url, modules = modules.len(), "Resolved repository index");
            repository.modules = modules;
            repository.last_updated = Some(Utc::now());
            return Ok(repository);
        }

        Err(BridgeError::request_with_status(
            404,
            format!("no index file found in repository {}", base),
        ))
    }

    async fn download_module(&self, repository: &Repository, unit: &mut WorkUnit) -> Result<()> {
        let module = unit.entry.module.clone();
        if module.package_file.trim().is_empty() || module.version.trim().is_empty() || module.package.trim().is_empty() {
            return Err(BridgeError::InvalidOperation(format!(
                "module descriptor {} is incomplete",
                module.name
            )));
        }

        let url = package_url(repository, &module);
        let destination = unit.path().join(&module.package_file);
        self.download_file(&url, &destination).await?;
        info!(package = %module.package_file, version = %module.version, "Downloaded module package");

        let icon_name = Path::new(&module.package_file).with_extension("png").to_string_lossy().into_owned();
        let icon_path = unit.path().join(&icon_name);
        match self.download_file(&icon_url(repository, &module), &icon_path).await {
            Ok(()) => {
                unit.entry.icon = Some(FileHash {
                    sha256: sha256_file(&icon_path)?,
                    file_name: icon_name,
                });
            }
            Err(e) => debug!(package = %module.package_file, error = %e, "Module icon unavailable"),
        }

        unit.entry.name = module.module_name();
        unit.entry.downloaded_at = Some(Utc::now());
        unit.entry.download_url = Some(url);
        unit.entry.package = FileHash {
            sha256: sha256_file(&destination)?,
            file_name: module.package_file,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_repository_url() {
        assert_eq!(
            normalize_repository_url("https://repo.example/modules/index.min.json"),
            "https://repo.example/modules"
        );
        assert_eq!(
            normalize_repository_url("https://repo.example/modules/INDEX.JSON"),
            "https://repo.example/modules"
        );
        assert_eq!(normalize_repository_url("https://repo.example/modules/"), "https://repo.example/modules");
        assert_eq!(normalize_repository_url("https://repo.example"), "https://repo.example");
    }

    #[test]
    fn test_artifact_urls() {
        let repository = Repository {
            url: "https://repo.example/modules/".into(),
            ..Default::default()
        };
        let module = ModuleDescriptor {
            package_file: "sourcebridge-en.demo-v1.4.2.zip".into(),
            ..Default::default()
        };
        assert_eq!(
            package_url(&repository, &module),
            "https://repo.example/modules/apk/sourcebridge-en.demo-v1.4.2.zip"
        );
        assert_eq!(
            icon_url(&repository, &module),
            "https://repo.example/modules/icon/sourcebridge-en.demo-v1.4.2.png"
        );
    }

    #[test]
    fn test_index_entries_deserialize() {
        let json = r#"[{
            "name": "Source Bridge: Demo",
            "pkg": "org.sourcebridge.extension.en.demo",
            "apk": "sourcebridge-en.demo-v1.4.2.zip",
            "lang": "en",
            "code": 2,
            "version": "1.4.2",
            "nsfw": 0,
            "sources": [{"name": "Demo", "lang": "en", "id": "42", "baseUrl": "https://demo.example"}]
        }]"#;
        let modules: Vec<ModuleDescriptor> = serde_json::from_str(json).unwrap();
        assert_eq!(modules[0].version_code, 2);
        assert_eq!(modules[0].sources[0].base_url, "https://demo.example");
        assert_eq!(modules[0].module_name(), "sourcebridge-en.demo");
    }

    #[test]
    fn test_client_builds_from_config() {
        let config = RepositoryConfig {
            user_agent: "source-bridge/test".into(),
            request_timeout: 5,
            initial: Vec::new(),
        };
        assert!(HttpRepositoryDownloader::new(&config).is_ok());
    }
}
