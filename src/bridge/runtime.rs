//! Foreign runtime abstraction
//!
//! Modules are compiled for a managed runtime the host does not speak
//! natively. Everything the bridge needs from that runtime is expressed by
//! the traits in this file: an environment with process-wide settings, the
//! isolated execution contexts modules are loaded into, and the source
//! objects those contexts expose together with their optional capabilities.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::suspend::{Continuation, Suspend};
use super::types::{Filter, FlareSolverrSettings, ModuleFormat, PreferenceValue, SocksProxySettings};
use crate::core::error::{BridgeError, Result};
use crate::core::folders::WorkingFolders;

/// Failure reported by code running inside the foreign runtime
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ForeignError {
    /// Transport level failure without an HTTP status
    #[error("{0}")]
    Io(String),

    #[error("HTTP error {code}: {message}")]
    Http { code: u16, message: String },

    #[error("{0}")]
    Other(String),
}

impl From<ForeignError> for BridgeError {
    fn from(err: ForeignError) -> Self {
        match err {
            ForeignError::Io(message) => BridgeError::request(message),
            ForeignError::Http { code, message } => BridgeError::request_with_status(code, message),
            ForeignError::Other(message) => BridgeError::ForeignCall(message),
        }
    }
}

/// Process-wide settings object owned by the foreign runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeSettings {
    pub flare_solverr: FlareSolverrSettings,
    pub socks_proxy: SocksProxySettings,
    pub interceptors: BTreeMap<String, BTreeMap<String, String>>,
    /// Settings the bridge does not manage, preserved on rewrite
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// What a loader asks the runtime to load
#[derive(Debug, Clone, PartialEq)]
pub struct ContextRequest {
    /// Context name, unique per loaded module version
    pub name: String,
    /// Declared package namespace of the module
    pub package: String,
    pub path: PathBuf,
    pub format: ModuleFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportedKind {
    SourceFactory,
    Source,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedType {
    pub name: String,
    pub kind: ExportedKind,
}

pub enum ForeignInstance {
    Factory(Arc<dyn ForeignSourceFactory>),
    Source(Arc<dyn ForeignSource>),
    /// Something that is neither, carrying its type name
    Other(String),
}

#[async_trait]
pub trait ForeignRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the environment up. Called once per process.
    async fn initialize_environment(&self, folders: &WorkingFolders) -> std::result::Result<(), ForeignError>;

    async fn shutdown_environment(&self) -> std::result::Result<(), ForeignError>;

    async fn read_settings(&self) -> std::result::Result<RuntimeSettings, ForeignError>;

    async fn write_settings(&self, settings: &RuntimeSettings) -> std::result::Result<(), ForeignError>;

    /// Load a module artifact into a fresh, independently unloadable context.
    ///
    /// Fails with `NotFound` when the artifact is missing and with
    /// `InvalidModule` when the runtime cannot make sense of it.
    async fn create_context(&self, request: &ContextRequest) -> Result<Arc<dyn ExecutionContext>>;

    /// Encourage reclamation of unloaded contexts
    fn collect(&self);
}

/// One isolated, unloadable unit a module is loaded into
pub trait ExecutionContext: Send + Sync {
    fn name(&self) -> &str;

    fn exported_types(&self) -> std::result::Result<Vec<ExportedType>, ForeignError>;

    fn instantiate(&self, type_name: &str) -> std::result::Result<ForeignInstance, ForeignError>;

    /// Request the context be unloaded. Advisory: references still held
    /// elsewhere keep it alive.
    fn unload(&self) -> std::result::Result<(), ForeignError>;
}

pub trait ForeignSourceFactory: Send + Sync {
    fn create_sources(&self) -> std::result::Result<Vec<Arc<dyn ForeignSource>>, ForeignError>;
}

/// Manga record in the module's own shape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawManga {
    pub url: String,
    pub title: String,
    pub artist: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    /// Comma separated
    pub genre: Option<String>,
    pub status: i32,
    pub thumbnail_url: Option<String>,
    pub update_strategy: i32,
    pub initialized: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawMangasPage {
    pub mangas: Vec<RawManga>,
    pub has_next_page: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawChapter {
    pub url: String,
    pub name: String,
    pub date_upload: i64,
    pub chapter_number: f32,
    pub scanlator: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawPage {
    pub index: u32,
    pub url: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl ForeignResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A source object exposed by a module.
///
/// Capabilities are optional facets; a source that lacks one returns `None`.
pub trait ForeignSource: Send + Sync {
    fn id(&self) -> i64;

    fn name(&self) -> String;

    fn lang(&self) -> String;

    fn as_http(&self) -> Option<&dyn HttpCapability> {
        None
    }

    fn as_catalogue(&self) -> Option<&dyn CatalogueCapability> {
        None
    }

    fn as_configurable(&self) -> Option<&dyn ConfigurableCapability> {
        None
    }

    /// HTTP source whose responses are parsed from HTML
    fn is_parsed_html(&self) -> bool {
        false
    }
}

pub trait CatalogueCapability: Send + Sync {
    fn supports_latest(&self) -> bool;

    fn filter_list(&self) -> std::result::Result<Vec<Filter>, ForeignError>;

    fn fetch_popular(&self, page: u32, cont: Continuation<RawMangasPage>) -> Suspend<RawMangasPage>;

    fn fetch_latest(&self, page: u32, cont: Continuation<RawMangasPage>) -> Suspend<RawMangasPage>;

    fn fetch_search(
        &self,
        page: u32,
        query: &str,
        filters: &[Filter],
        cont: Continuation<RawMangasPage>,
    ) -> Suspend<RawMangasPage>;
}

pub trait HttpCapability: Send + Sync {
    fn base_url(&self) -> String;

    fn version_id(&self) -> i32;

    /// Absolute url of a manga, when the source can resolve one
    fn manga_url(&self, manga: &RawManga) -> Option<String>;

    fn chapter_url(&self, chapter: &RawChapter) -> Option<String>;

    fn fetch_details(&self, manga: &RawManga, cont: Continuation<RawManga>) -> Suspend<RawManga>;

    fn fetch_chapters(&self, manga: &RawManga, cont: Continuation<Vec<RawChapter>>) -> Suspend<Vec<RawChapter>>;

    fn fetch_pages(&self, chapter: &RawChapter, cont: Continuation<Vec<RawPage>>) -> Suspend<Vec<RawPage>>;

    fn fetch_image_url(&self, page: &RawPage, cont: Continuation<Option<String>>) -> Suspend<Option<String>>;

    /// Fetch image bytes; `None` when the runtime produced no response at all
    fn get_image(&self, page: &RawPage, cont: Continuation<Option<ForeignResponse>>) -> Suspend<Option<ForeignResponse>>;

    /// Plain GET through the source's own client
    fn get(&self, url: &str, cont: Continuation<Option<ForeignResponse>>) -> Suspend<Option<ForeignResponse>>;
}

pub trait ConfigurableCapability: Send + Sync {
    fn setup_preference_screen(&self) -> std::result::Result<Arc<dyn PreferenceScreen>, ForeignError>;
}

/// Live preference screen of one source
pub trait PreferenceScreen: Send + Sync {
    fn is_enabled(&self) -> bool;

    fn preferences(&self) -> Vec<super::types::KeyPreference>;

    /// Write a value into the preference at `index`
    fn save_value(&self, index: usize, value: PreferenceValue) -> std::result::Result<(), ForeignError>;

    fn call_change_listener(&self, index: usize, value: &PreferenceValue) -> std::result::Result<(), ForeignError>;
}
