//! Working folder layout
//!
//! Everything the bridge persists lives under one working directory:
//!
//! ```text
//! <working>/
//!   local_modules.json          installed module groups
//!   onlinerepo_<id>.json        one file per remote repository
//!   preferences.json            host-wide bridge overrides
//!   modules/<name>/             one folder per logical module
//!     preferences.json          reconciled source preferences
//!     <version>_<repo id>/      one folder per installed version
//!   runtime/                    foreign runtime state
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, error, warn};

use crate::core::config::BridgeConfig;
use crate::core::error::{BridgeError, Result};

const LOCAL_MODULES_FILE: &str = "local_modules.json";
const BRIDGE_PREFERENCES_FILE: &str = "preferences.json";
const SOURCE_PREFERENCES_FILE: &str = "preferences.json";

#[derive(Debug, Clone)]
pub struct WorkingFolders {
    root: PathBuf,
    modules_dir: PathBuf,
    runtime_dir: PathBuf,
    temp_dir: PathBuf,
}

impl WorkingFolders {
    /// Create the layout under `root`, creating missing directories
    pub fn new(root: &Path, temp_dir: Option<&Path>) -> Result<Self> {
        let temp_dir = match temp_dir {
            Some(dir) => dir.to_path_buf(),
            None => std::env::temp_dir().join("source-bridge"),
        };

        let folders = Self {
            root: root.to_path_buf(),
            modules_dir: root.join("modules"),
            runtime_dir: root.join("runtime"),
            temp_dir,
        };

        for dir in [&folders.root, &folders.modules_dir, &folders.runtime_dir, &folders.temp_dir] {
            fs::create_dir_all(dir)?;
        }

        debug!(root = %folders.root.display(), temp = %folders.temp_dir.display(), "Working folders ready");
        Ok(folders)
    }

    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        Self::new(&config.working_dir, config.temp_dir.as_deref())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn modules_dir(&self) -> &Path {
        &self.modules_dir
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn local_modules_file(&self) -> PathBuf {
        self.root.join(LOCAL_MODULES_FILE)
    }

    pub fn bridge_preferences_file(&self) -> PathBuf {
        self.root.join(BRIDGE_PREFERENCES_FILE)
    }

    pub fn repository_file(&self, repository_id: &str) -> PathBuf {
        self.root.join(format!("onlinerepo_{}.json", repository_id))
    }

    pub fn module_folder(&self, module_name: &str) -> PathBuf {
        self.modules_dir.join(module_name)
    }

    pub fn version_folder(&self, module_name: &str, version: &str, repository_id: &str) -> PathBuf {
        self.module_folder(module_name)
            .join(format!("{}_{}", version, repository_id))
    }

    pub fn source_preferences_file(&self, module_name: &str) -> PathBuf {
        self.module_folder(module_name).join(SOURCE_PREFERENCES_FILE)
    }

    /// Fresh scratch directory, removed when the returned handle drops
    pub fn create_work_dir(&self) -> Result<TempDir> {
        let dir = tempfile::Builder::new()
            .prefix("work-")
            .tempdir_in(&self.temp_dir)?;
        Ok(dir)
    }

    /// Every `onlinerepo_*.json` file under the root
    pub fn repository_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let name = entry.file_name().to_string_lossy();
            if name.starts_with("onlinerepo_") && name.ends_with(".json") {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Read a JSON document, `None` when the file does not exist
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(data) => {
            let value = serde_json::from_slice(&data).map_err(|e| {
                BridgeError::Serialization(format!("{}: {}", path.display(), e))
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a JSON document through a sibling temp file and an atomic rename
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let data = fs::read(path)?;
    Ok(sha256_bytes(&data))
}

/// Check a file against a recorded hash; a missing file never verifies
pub fn verify_file(path: &Path, sha256: &str) -> bool {
    match sha256_file(path) {
        Ok(actual) => actual.eq_ignore_ascii_case(sha256),
        Err(_) => false,
    }
}

/// [`verify_file`] on the blocking pool; hashing a whole package stays off the executor
pub async fn verify_file_blocking(path: PathBuf, sha256: String) -> bool {
    tokio::task::spawn_blocking(move || verify_file(&path, &sha256))
        .await
        .unwrap_or(false)
}

/// Moves a prepared directory into its final location, restoring whatever
/// was there before unless committed.
pub struct FolderSwap {
    target_path: PathBuf,
    backup_path: Option<PathBuf>,
    committed: bool,
}

impl FolderSwap {
    pub fn install(source: &Path, target_path: &Path) -> Result<Self> {
        let backup_path = if target_path.exists() {
            let mut backup = target_path.as_os_str().to_owned();
            backup.push(".backup");
            let backup = PathBuf::from(backup);
            if backup.exists() {
                fs::remove_dir_all(&backup)?;
            }
            fs::rename(target_path, &backup)?;
            Some(backup)
        } else {
            None
        };

        let swap = Self {
            target_path: target_path.to_path_buf(),
            backup_path,
            committed: false,
        };

        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)?;
        }
        copy_directory(source, target_path)?;

        Ok(swap)
    }

    pub fn commit(mut self) -> Result<()> {
        self.committed = true;
        if let Some(backup) = &self.backup_path {
            fs::remove_dir_all(backup)?;
        }
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        warn!(target = %self.target_path.display(), "Rolling back folder install");
        if self.target_path.exists() {
            fs::remove_dir_all(&self.target_path)?;
        }
        if let Some(backup) = &self.backup_path {
            fs::rename(backup, &self.target_path)?;
        }
        Ok(())
    }
}

impl Drop for FolderSwap {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.rollback() {
                error!("Failed to roll back folder install: {}", e);
            }
        }
    }
}

pub fn copy_directory(source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target)?;
    for entry in walkdir::WalkDir::new(source).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| BridgeError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| BridgeError::InvalidOperation(e.to_string()))?;
        let target_path = target.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target_path)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        name: String,
    }

    #[test]
    fn test_layout() {
        let dir = TempDir::new().unwrap();
        let folders = WorkingFolders::new(dir.path(), Some(&dir.path().join("tmp"))).unwrap();

        assert!(folders.modules_dir().is_dir());
        assert!(folders.runtime_dir().is_dir());
        assert!(folders.temp_dir().is_dir());
        assert_eq!(
            folders.version_folder("en-demo", "1.4.2", "abc"),
            dir.path().join("modules").join("en-demo").join("1.4.2_abc")
        );
        assert_eq!(
            folders.source_preferences_file("en-demo"),
            dir.path().join("modules").join("en-demo").join("preferences.json")
        );
        assert_eq!(folders.repository_file("abc"), dir.path().join("onlinerepo_abc.json"));
    }

    #[tokio::test]
    async fn test_json_round_trip_and_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("doc.json");

        let missing: Option<Doc> = read_json(&path).await.unwrap();
        assert!(missing.is_none());

        write_json(&path, &Doc { name: "demo".into() }).await.unwrap();
        let doc: Option<Doc> = read_json(&path).await.unwrap();
        assert_eq!(doc, Some(Doc { name: "demo".into() }));
    }

    #[tokio::test]
    async fn test_corrupt_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, "{ nope").unwrap();

        let result: Result<Option<Doc>> = read_json(&path).await;
        assert!(matches!(result, Err(BridgeError::Serialization(_))));
    }

    #[test]
    fn test_hashing() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"abc").unwrap();
        assert!(verify_file(&path, "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD"));
        assert!(!verify_file(&dir.path().join("none"), "ba78"));
    }

    #[tokio::test]
    async fn test_verify_file_blocking() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"abc").unwrap();

        let good = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".to_string();
        assert!(verify_file_blocking(path.clone(), good).await);
        assert!(!verify_file_blocking(path, "00".to_string()).await);
    }

    #[test]
    fn test_repository_files() {
        let dir = TempDir::new().unwrap();
        let folders = WorkingFolders::new(dir.path(), Some(&dir.path().join("tmp"))).unwrap();
        std::fs::write(folders.repository_file("b"), "{}").unwrap();
        std::fs::write(folders.repository_file("a"), "{}").unwrap();
        std::fs::write(folders.local_modules_file(), "[]").unwrap();

        let files = folders.repository_files().unwrap();
        assert_eq!(files, vec![folders.repository_file("a"), folders.repository_file("b")]);
    }

    #[test]
    fn test_folder_swap_rollback_restores_previous() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("new.txt"), "new").unwrap();
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("old.txt"), "old").unwrap();

        {
            let _swap = FolderSwap::install(&source, &target).unwrap();
            assert!(target.join("new.txt").exists());
        }
        assert!(target.join("old.txt").exists());
        assert!(!target.join("new.txt").exists());

        let swap = FolderSwap::install(&source, &target).unwrap();
        swap.commit().unwrap();
        assert!(target.join("new.txt").exists());
        assert!(!target.with_extension("backup").exists());
    }
}
