//! Bridge data model
//!
//! Canonical, runtime-agnostic records shared by the loaders, the managers
//! and external callers. Everything here is plain data: cloning a value
//! yields an independent deep copy, which is what the public proxies hand out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::error::{BridgeError, Result};

/// Capability flags of one wrapped source, probed once at construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCapabilities {
    /// Source performs its own HTTP requests (details, chapters, pages, images)
    pub http: bool,
    /// HTTP source whose responses are parsed from HTML
    pub parsed_html: bool,
    /// Source can list popular titles and search
    pub catalogue: bool,
    /// Source exposes a preference screen
    pub configurable: bool,
    /// Catalogue source that also lists latest updates
    pub supports_latest: bool,
}

/// Identity of one source object exposed by a loaded module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    pub id: i64,
    pub name: String,
    pub language: String,
    pub base_url: String,
    pub version_id: i32,
    pub capabilities: SourceCapabilities,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MangaStatus {
    #[default]
    Unknown,
    Ongoing,
    Completed,
    Licensed,
    PublishingFinished,
    Cancelled,
    OnHiatus,
}

impl MangaStatus {
    /// Map the integer status code used by source modules
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => MangaStatus::Ongoing,
            2 => MangaStatus::Completed,
            3 => MangaStatus::Licensed,
            4 => MangaStatus::PublishingFinished,
            5 => MangaStatus::Cancelled,
            6 => MangaStatus::OnHiatus,
            _ => MangaStatus::Unknown,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            MangaStatus::Unknown => 0,
            MangaStatus::Ongoing => 1,
            MangaStatus::Completed => 2,
            MangaStatus::Licensed => 3,
            MangaStatus::PublishingFinished => 4,
            MangaStatus::Cancelled => 5,
            MangaStatus::OnHiatus => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStrategy {
    #[default]
    AlwaysUpdate,
    OnlyFetchOnce,
}

/// A title as returned by a source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Manga {
    /// Source-relative url, the identity the source understands
    pub url: String,
    pub title: String,
    pub artist: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub genre: Vec<String>,
    pub status: MangaStatus,
    pub thumbnail_url: Option<String>,
    pub update_strategy: UpdateStrategy,
    pub initialized: bool,
    /// Absolute url resolved by the source, when it can provide one
    pub real_url: Option<String>,
}

/// One page of catalogue results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MangaList {
    pub mangas: Vec<Manga>,
    pub has_next_page: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Chapter {
    pub url: String,
    pub name: String,
    /// Upload time in milliseconds since the Unix epoch, 0 when unknown
    pub date_upload: i64,
    /// Number as reported by the source
    pub chapter_number: f32,
    pub scanlator: Option<String>,
    /// Ordinal position, 1 for the oldest chapter
    pub index: u32,
    pub real_url: Option<String>,
    /// Name without the manga title prefix
    pub parsed_name: String,
    /// Reported number, or the one recognized from the name; -1 when unknown
    pub parsed_number: f32,
}

impl Chapter {
    pub fn uploaded_at(&self) -> Option<DateTime<Utc>> {
        if self.date_upload <= 0 {
            return None;
        }
        DateTime::<Utc>::from_timestamp_millis(self.date_upload)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Page {
    pub index: u32,
    pub url: String,
    pub image_url: Option<String>,
}

/// Raw content fetched through a source's own client
#[derive(Debug, Clone, PartialEq)]
pub struct ContentStream {
    pub content_type: Option<String>,
    pub data: bytes::Bytes,
}

/// Catalogue search filters exposed by a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Filter {
    Header { name: String },
    Separator { name: String },
    Text { name: String, state: String },
    CheckBox { name: String, state: bool },
    TriState { name: String, state: i32 },
    Select { name: String, values: Vec<String>, state: usize },
    Sort { name: String, values: Vec<String>, index: Option<usize>, ascending: bool },
    Group { name: String, filters: Vec<Filter> },
}

/// One configurable setting of one concrete source and language
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyPreference {
    pub key: String,
    /// Position inside the source's preference screen, used for write-back
    pub index: usize,
    /// Preference widget kind (ListPreference, SwitchPreferenceCompat, ...)
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub summary: Option<String>,
    pub default_value: Option<String>,
    /// Declared value type: `String`, `Boolean` or `Set<String>`
    pub default_value_type: String,
    pub current_value: Option<String>,
    pub entries: Vec<String>,
    pub entry_values: Vec<String>,
    pub visible: bool,
    pub dialog_title: Option<String>,
    pub dialog_message: Option<String>,
    pub text: Option<String>,
}

/// Persisted preference list of one source and language
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourcePreference {
    pub source_id: i64,
    pub language: String,
    pub preferences: Vec<KeyPreference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLanguage {
    pub key: String,
    pub language: String,
}

/// A preference merged across its per-language variants under one base key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniquePreference {
    /// Never empty: every original key folded into this preference
    pub languages: Vec<KeyLanguage>,
    pub preference: KeyPreference,
}

/// A decoded preference value ready to be written into a live source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreferenceValue {
    String(String),
    Bool(bool),
    StringSet(Vec<String>),
}

impl PreferenceValue {
    /// Decode a wire value according to the preference's declared type
    pub fn decode(value_type: &str, raw: &str) -> Result<Self> {
        match value_type {
            "String" => Ok(PreferenceValue::String(raw.to_string())),
            "Boolean" => Ok(PreferenceValue::Bool(raw.eq_ignore_ascii_case("true"))),
            "Set<String>" => {
                let values: Option<Vec<String>> = serde_json::from_str(raw).map_err(|e| {
                    BridgeError::InvalidPreference(format!("invalid string set {}: {}", raw, e))
                })?;
                Ok(PreferenceValue::StringSet(values.unwrap_or_default()))
            }
            other => Err(BridgeError::InvalidPreference(format!(
                "unsupported preference value type: {}",
                other
            ))),
        }
    }
}

/// One source as listed by a repository index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "lang")]
    pub language: String,
    pub base_url: String,
    pub version_id: i32,
}

/// A module as listed by a repository index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleDescriptor {
    pub name: String,
    #[serde(rename = "pkg")]
    pub package: String,
    /// Package file name inside the repository
    #[serde(rename = "apk")]
    pub package_file: String,
    #[serde(rename = "lang")]
    pub language: String,
    #[serde(rename = "code")]
    pub version_code: i64,
    pub version: String,
    pub nsfw: i32,
    pub sources: Vec<SourceInfo>,
}

impl ModuleDescriptor {
    /// Logical module name: the package file name without its version suffix
    pub fn module_name(&self) -> String {
        let stem = std::path::Path::new(&self.package_file)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.package_file);

        let expected_suffix = format!("-v{}", self.version);
        if let Some(name) = stem.strip_suffix(expected_suffix.as_str()) {
            if !name.is_empty() {
                return name.to_string();
            }
        }

        match stem.rfind("-v") {
            Some(idx) if idx > 0 => stem[..idx].to_string(),
            _ => stem.to_string(),
        }
    }
}

/// A remote repository of module packages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub website: String,
    pub fingerprint: String,
    pub url: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub modules: Vec<ModuleDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileHash {
    pub file_name: String,
    pub sha256: String,
}

/// A generated artifact together with the converter version that produced it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileHashVersion {
    pub file_name: String,
    pub sha256: String,
    pub version: String,
}

/// On-disk format of a loadable module artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleFormat {
    /// Archive bundling the module library and its manifest, loaded by explicit class name
    #[default]
    Archive,
    /// Bare runtime-native library, loaded by namespace discovery
    Library,
}

impl std::str::FromStr for ModuleFormat {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "archive" => Ok(ModuleFormat::Archive),
            "library" => Ok(ModuleFormat::Library),
            other => Err(BridgeError::Config(format!("unknown module format: {}", other))),
        }
    }
}

/// One installed, on-disk version of a module
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModuleVersionEntry {
    /// SHA-256 of the raw package
    pub id: String,
    pub repository_id: String,
    pub is_local: bool,
    pub name: String,
    pub class_name: String,
    pub module: ModuleDescriptor,
    pub download_url: Option<String>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub package: FileHash,
    pub artifact: FileHashVersion,
    pub icon: Option<FileHash>,
    pub format: ModuleFormat,
}

/// A logical module: every installed version of one provider, one of them active
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModuleGroup {
    pub name: String,
    pub active_entry: usize,
    pub auto_update: bool,
    pub entries: Vec<ModuleVersionEntry>,
}

impl Default for ModuleGroup {
    fn default() -> Self {
        Self {
            name: String::new(),
            active_entry: 0,
            auto_update: true,
            entries: Vec::new(),
        }
    }
}

impl ModuleGroup {
    pub fn active(&self) -> Result<&ModuleVersionEntry> {
        self.entries.get(self.active_entry).ok_or_else(|| {
            BridgeError::InvalidOperation(format!(
                "active entry index {} is out of range for module {}",
                self.active_entry, self.name
            ))
        })
    }

    /// Index of the entry with the highest version code
    pub fn latest_index(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| e.module.version_code)
            .map(|(i, _)| i)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlareSolverrSettings {
    pub enabled: bool,
    pub url: String,
    pub timeout: u32,
    pub session_name: String,
    pub session_ttl: u32,
    pub as_response_fallback: bool,
}

impl Default for FlareSolverrSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:8191".to_string(),
            timeout: 60,
            session_name: "extension.bridge".to_string(),
            session_ttl: 15,
            as_response_fallback: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocksProxySettings {
    pub enabled: bool,
    pub version: u8,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for SocksProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            version: 5,
            host: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Host-wide network overrides pushed into the foreign runtime's settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgePreferences {
    pub flare_solverr: FlareSolverrSettings,
    pub socks_proxy: SocksProxySettings,
    /// Interceptor name -> option name -> value
    pub interceptors: BTreeMap<String, BTreeMap<String, String>>,
}

/// Lifecycle state of the bridge process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeState {
    NotStarted,
    EnvironmentInitializing,
    ManagerInitializing,
    Ready,
    ShuttingDown,
    Stopped,
}
