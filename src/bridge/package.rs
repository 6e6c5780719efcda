//! Raw module packages and their conversion into loadable artifacts
//!
//! A raw package is a zip holding a `manifest.json`, the payload library
//! named by the manifest and an optional `icon.png`.

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::types::{FileHash, FileHashVersion, ModuleFormat, ModuleVersionEntry};
use crate::core::error::{BridgeError, ErrorContext, Result};
use crate::core::folders::sha256_file;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const ICON_FILE: &str = "icon.png";
pub const PACKAGE_EXTENSION: &str = "zip";

/// Supported range of the module library version
pub const LIB_VERSION_MIN: f32 = 1.3;
pub const LIB_VERSION_MAX: f32 = 1.5;

/// Manifest carried by every raw module package
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageManifest {
    pub name: String,
    pub package: String,
    pub version: String,
    pub version_code: i64,
    /// Library version the module was built against; derived from `version` when empty
    pub lib_version: String,
    pub class_name: String,
    pub nsfw: i32,
    /// Archive entry of the payload library
    pub payload: String,
}

impl PackageManifest {
    pub fn lib_version(&self) -> Result<f32> {
        let raw = if self.lib_version.trim().is_empty() {
            match self.version.rfind('.') {
                Some(idx) if idx > 0 => &self.version[..idx],
                _ => self.version.as_str(),
            }
        } else {
            self.lib_version.trim()
        };

        raw.parse::<f32>().map_err(|_| {
            BridgeError::InvalidModule(format!("library version {} is not a valid number", raw))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.package.trim().is_empty() {
            return Err(BridgeError::InvalidModule("manifest does not declare a package".to_string()));
        }
        if self.version.trim().is_empty() {
            return Err(BridgeError::InvalidModule("manifest does not declare a version".to_string()));
        }
        if self.payload.trim().is_empty() {
            return Err(BridgeError::InvalidModule("manifest does not declare a payload".to_string()));
        }

        let lib_version = self.lib_version()?;
        if !(LIB_VERSION_MIN..=LIB_VERSION_MAX).contains(&lib_version) {
            return Err(BridgeError::InvalidModule(format!(
                "library version {} is outside the supported range of {} to {}",
                lib_version, LIB_VERSION_MIN, LIB_VERSION_MAX
            )));
        }
        Ok(())
    }
}

fn package_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(.*?)\.extension\.(.*)").ok())
        .as_ref()
}

/// Canonical package file name for a package id and version.
///
/// `org.sourcebridge.extension.en.demo` at `1.4.2` becomes
/// `sourcebridge-en.demo-v1.4.2.zip`.
pub fn package_file_name(package: &str, version: &str) -> String {
    if let Some(captures) = package_pattern().and_then(|p| p.captures(package)) {
        let base = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let name = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
        let base = base.rsplit('.').next().unwrap_or(base);
        return format!("{}-{}-v{}.{}", base, name, version, PACKAGE_EXTENSION);
    }
    format!("{}-v{}.{}", package, version, PACKAGE_EXTENSION)
}

fn open_archive(path: &Path) -> Result<zip::ZipArchive<fs::File>> {
    let file = fs::File::open(path)?;
    zip::ZipArchive::new(file).map_err(|e| {
        BridgeError::InvalidModule(format!("failed to open package {}: {}", path.display(), e))
    })
}

/// Read and validate the manifest of a raw package
pub fn read_manifest(path: &Path) -> Result<PackageManifest> {
    let mut archive = open_archive(path)?;
    let mut content = String::new();
    archive
        .by_name(MANIFEST_FILE)
        .map_err(|_| BridgeError::InvalidModule(format!("{} not found in package", MANIFEST_FILE)))?
        .read_to_string(&mut content)?;

    let manifest: PackageManifest = serde_json::from_str(&content)
        .map_err(|e| BridgeError::InvalidModule(format!("invalid {}: {}", MANIFEST_FILE, e)))?;
    manifest.validate()?;
    Ok(manifest)
}

/// Copy one archive entry to `target`. Returns false when the entry does not exist.
pub fn extract_entry(package: &Path, entry_name: &str, target: &Path) -> Result<bool> {
    let mut archive = open_archive(package)?;
    let mut entry = match archive.by_name(entry_name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(false),
        Err(e) => {
            return Err(BridgeError::InvalidModule(format!(
                "failed to read {} from package: {}",
                entry_name, e
            )))
        }
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = fs::File::create(target)?;
    std::io::copy(&mut entry, &mut out)?;
    Ok(true)
}

/// A module version being assembled in a private work folder
pub struct WorkUnit {
    folder: TempDir,
    pub entry: ModuleVersionEntry,
}

impl WorkUnit {
    pub fn new(folder: TempDir, entry: ModuleVersionEntry) -> Self {
        Self { folder, entry }
    }

    pub fn path(&self) -> &Path {
        self.folder.path()
    }

    pub fn package_path(&self) -> PathBuf {
        self.path().join(&self.entry.package.file_name)
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.path().join(&self.entry.artifact.file_name)
    }

    pub fn icon_path(&self) -> Option<PathBuf> {
        self.entry.icon.as_ref().map(|icon| self.path().join(&icon.file_name))
    }

    /// Write raw package bytes into a fresh unit for a locally added module
    pub fn from_bytes(folder: TempDir, bytes: &[u8]) -> Result<Self> {
        let file_name = format!("module.{}", PACKAGE_EXTENSION);
        let path = folder.path().join(&file_name);
        fs::write(&path, bytes)?;

        let entry = ModuleVersionEntry {
            is_local: true,
            package: FileHash {
                file_name,
                sha256: sha256_file(&path)?,
            },
            ..Default::default()
        };
        Ok(Self::new(folder, entry))
    }

    /// Fill the entry from the package manifest, rename the package to its
    /// canonical name and pull out the icon.
    pub fn apply_manifest(&mut self) -> Result<PackageManifest> {
        let manifest = read_manifest(&self.package_path())?;

        // an empty manifest name keeps the repository listing's name
        let module = &mut self.entry.module;
        if !manifest.name.is_empty() {
            module.name = manifest.name.clone();
        }
        module.package = manifest.package.clone();
        module.version = manifest.version.clone();
        module.version_code = manifest.version_code;
        module.nsfw = manifest.nsfw;
        self.entry.class_name = manifest.class_name.clone();
        self.entry.downloaded_at = Some(Utc::now());

        // the version folder keys on the canonical name, not the download name
        let canonical = package_file_name(&manifest.package, &manifest.version);
        if !canonical.eq_ignore_ascii_case(&self.entry.package.file_name) {
            let renamed = self.path().join(&canonical);
            fs::rename(self.package_path(), &renamed)?;
            debug!(from = %self.entry.package.file_name, to = %canonical, "Renamed module package");
            self.entry.package.file_name = canonical.clone();
        }
        self.entry.module.package_file = canonical;
        self.entry.name = self.entry.module.module_name();

        // the icon is optional
        let icon_name = Path::new(&self.entry.package.file_name)
            .with_extension("png")
            .to_string_lossy()
            .into_owned();
        let icon_path = self.path().join(&icon_name);
        if extract_entry(&self.package_path(), ICON_FILE, &icon_path)? {
            self.entry.icon = Some(FileHash {
                file_name: icon_name,
                sha256: sha256_file(&icon_path)?,
            });
        }

        Ok(manifest)
    }
}

/// Turns a raw package inside a work unit into a loadable artifact
#[async_trait]
pub trait PackageConverter: Send + Sync {
    /// Stamped on every produced artifact; a mismatch triggers reconversion
    fn version(&self) -> &str;

    fn format(&self) -> ModuleFormat;

    /// Produce the artifact next to the package and record it on the entry
    async fn convert(&self, unit: &mut WorkUnit) -> Result<()>;
}

/// Converter for zip packages: extracts the payload library, or repacks the
/// archive without its icon, depending on the target format.
pub struct ZipPayloadConverter {
    format: ModuleFormat,
}

impl ZipPayloadConverter {
    pub const VERSION: &'static str = "1.0.0";

    pub fn new(format: ModuleFormat) -> Self {
        Self { format }
    }
}

fn conversion_lock() -> &'static tokio::sync::Mutex<()> {
    static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
}

fn repack_without_icon(source: &Path, target: &Path) -> Result<()> {
    let mut archive = open_archive(source)?;
    let out = fs::File::create(target)?;
    let mut writer = zip::ZipWriter::new(out);

    for i in 0..archive.len() {
        let entry = archive
            .by_index_raw(i)
            .map_err(|e| BridgeError::InvalidModule(format!("failed to read package entry: {}", e)))?;
        if entry.name() == ICON_FILE {
            continue;
        }
        writer
            .raw_copy_file(entry)
            .map_err(|e| BridgeError::InvalidModule(format!("failed to repack package: {}", e)))?;
    }

    writer
        .finish()
        .map_err(|e| BridgeError::InvalidModule(format!("failed to finish archive: {}", e)))?;
    Ok(())
}

fn convert_blocking(format: ModuleFormat, package: PathBuf, stem: String) -> Result<PathBuf> {
    let manifest = read_manifest(&package)?;
    let folder = package
        .parent()
        .ok_or_else(|| BridgeError::InvalidOperation("package has no parent folder".to_string()))?;

    match format {
        ModuleFormat::Library => {
            let extension = Path::new(&manifest.payload)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or(std::env::consts::DLL_EXTENSION);
            let target = folder.join(format!("{}.{}", stem, extension));
            if !extract_entry(&package, &manifest.payload, &target)? {
                return Err(BridgeError::InvalidModule(format!(
                    "payload {} not found in package",
                    manifest.payload
                )));
            }
            Ok(target)
        }
        ModuleFormat::Archive => {
            let target = folder.join(format!("{}.module", stem));
            repack_without_icon(&package, &target)?;
            Ok(target)
        }
    }
}

#[async_trait]
impl PackageConverter for ZipPayloadConverter {
    fn version(&self) -> &str {
        Self::VERSION
    }

    fn format(&self) -> ModuleFormat {
        self.format
    }

    async fn convert(&self, unit: &mut WorkUnit) -> Result<()> {
        let package = unit.package_path();
        if !package.exists() {
            return Err(BridgeError::NotFound(format!(
                "module package not found: {}",
                package.display()
            )));
        }

        let stem = Path::new(&unit.entry.package.file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module")
            .to_string();

        info!(package = %unit.entry.package.file_name, format = ?self.format, "Converting module package");

        // one conversion at a time, off the executor
        let _guard = conversion_lock().lock().await;
        let format = self.format;
        let artifact = tokio::task::spawn_blocking(move || convert_blocking(format, package, stem))
            .await
            .context("conversion task failed")?
            .map_err(|e| {
                warn!(package = %unit.entry.package.file_name, error = %e, "Module conversion failed");
                e
            })?;

        let file_name = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| BridgeError::InvalidOperation("artifact path has no file name".to_string()))?;

        // stamp the converter version for later revalidation
        unit.entry.artifact = FileHashVersion {
            file_name,
            sha256: sha256_file(&artifact)?,
            version: Self::VERSION.to_string(),
        };
        unit.entry.format = self.format;
        Ok(())
    }
}
