//! Execution contexts, factories and sources backed by a native library

use base64::Engine;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tempfile::TempDir;
use tracing::{debug, warn};

use super::library::NativeLibrary;
use crate::bridge::package::{extract_entry, read_manifest};
use crate::bridge::runtime::{
    CatalogueCapability, ConfigurableCapability, ContextRequest, ExecutionContext, ExportedKind, ExportedType,
    ForeignError, ForeignInstance, ForeignResponse, ForeignSource, ForeignSourceFactory, HttpCapability,
    PreferenceScreen, RawChapter, RawManga, RawMangasPage, RawPage,
};
use crate::bridge::suspend::{Continuation, Suspend};
use crate::bridge::types::{Filter, KeyPreference, ModuleFormat, PreferenceValue};
use crate::core::error::{BridgeError, Result};

type ForeignResult<T> = std::result::Result<T, ForeignError>;

fn parse<T: DeserializeOwned>(value: Value) -> ForeignResult<T> {
    serde_json::from_value(value).map_err(|e| ForeignError::Other(format!("unexpected module response: {}", e)))
}

pub(crate) fn preference_value_json(value: &PreferenceValue) -> Value {
    match value {
        PreferenceValue::String(s) => Value::String(s.clone()),
        PreferenceValue::Bool(b) => Value::Bool(*b),
        PreferenceValue::StringSet(set) => json!(set),
    }
}

#[derive(Debug, Deserialize)]
struct ExportEntry {
    name: String,
    #[serde(default)]
    kind: String,
}

pub(crate) fn exported_kind(kind: &str) -> ExportedKind {
    match kind {
        "factory" | "sourceFactory" => ExportedKind::SourceFactory,
        "source" => ExportedKind::Source,
        _ => ExportedKind::Other,
    }
}

/// Identity and capability flags of a source living inside a library
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct SourceHeader {
    pub handle: u64,
    pub id: i64,
    pub name: String,
    pub lang: String,
    pub base_url: String,
    pub version_id: i32,
    pub http: bool,
    pub parsed_html: bool,
    pub catalogue: bool,
    pub configurable: bool,
    pub supports_latest: bool,
}

#[derive(Debug, Deserialize)]
struct InstanceEntry {
    kind: String,
    #[serde(default)]
    handle: u64,
    #[serde(default)]
    source: Option<SourceHeader>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseEntry {
    status: u16,
    #[serde(default)]
    content_type: Option<String>,
    /// Base64 encoded body
    #[serde(default)]
    body: String,
}

impl TryFrom<ResponseEntry> for ForeignResponse {
    type Error = ForeignError;

    fn try_from(entry: ResponseEntry) -> ForeignResult<Self> {
        let body = base64::engine::general_purpose::STANDARD
            .decode(entry.body.as_bytes())
            .map_err(|e| ForeignError::Other(format!("invalid response body: {}", e)))?;
        Ok(ForeignResponse {
            status: entry.status,
            content_type: entry.content_type,
            body: Bytes::from(body),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScreenEntry {
    enabled: bool,
    preferences: Vec<KeyPreference>,
}

/// One loaded library. Sources keep it alive; it is released with the last of them.
pub struct NativeContext {
    name: String,
    me: Weak<NativeContext>,
    unloaded: AtomicBool,
    library: NativeLibrary,
    // dropped after the library
    _extracted: Option<TempDir>,
}

impl NativeContext {
    /// Load the library behind `request`, extracting it from an archive artifact first
    pub fn open(request: &ContextRequest, contexts_dir: &Path, settings_path: &Path) -> Result<Arc<Self>> {
        let (library_path, extracted) = match request.format {
            ModuleFormat::Library => (request.path.clone(), None),
            ModuleFormat::Archive => {
                let manifest = read_manifest(&request.path)?;
                std::fs::create_dir_all(contexts_dir)?;
                let folder = tempfile::Builder::new().prefix("context-").tempdir_in(contexts_dir)?;
                let file_name = Path::new(&manifest.payload)
                    .file_name()
                    .ok_or_else(|| BridgeError::InvalidModule(format!("invalid payload name {}", manifest.payload)))?;
                let target = folder.path().join(file_name);
                if !extract_entry(&request.path, &manifest.payload, &target)? {
                    return Err(BridgeError::InvalidModule(format!(
                        "payload {} not found in {}",
                        manifest.payload,
                        request.path.display()
                    )));
                }
                (target, Some(folder))
            }
        };

        let library = NativeLibrary::open(&request.name, &library_path)?;
        library
            .invoke(
                "initialize",
                &json!({
                    "context": request.name,
                    "package": request.package,
                    "settingsPath": settings_path.to_string_lossy(),
                }),
            )
            .map_err(|e| BridgeError::InvalidModule(format!("module {} failed to initialize: {}", request.name, e)))?;

        Ok(Arc::new_cyclic(|me| NativeContext {
            name: request.name.clone(),
            me: me.clone(),
            unloaded: AtomicBool::new(false),
            library,
            _extracted: extracted,
        }))
    }

    pub fn invoke(&self, method: &str, params: &Value) -> ForeignResult<Value> {
        if self.unloaded.load(Ordering::SeqCst) {
            return Err(ForeignError::Other(format!("context {} is unloaded", self.name)));
        }
        self.library.invoke(method, params)
    }

    fn this(&self) -> ForeignResult<Arc<NativeContext>> {
        self.me
            .upgrade()
            .ok_or_else(|| ForeignError::Other(format!("context {} was released", self.name)))
    }
}

impl Drop for NativeContext {
    fn drop(&mut self) {
        debug!(context = %self.name, path = %self.library.path().display(), "Releasing native library");
    }
}

impl ExecutionContext for NativeContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn exported_types(&self) -> ForeignResult<Vec<ExportedType>> {
        let entries: Vec<ExportEntry> = parse(self.invoke("exports", &json!({}))?)?;
        Ok(entries
            .into_iter()
            .map(|e| ExportedType { kind: exported_kind(&e.kind), name: e.name })
            .collect())
    }

    fn instantiate(&self, type_name: &str) -> ForeignResult<ForeignInstance> {
        let entry: InstanceEntry = parse(self.invoke("instantiate", &json!({ "type": type_name }))?)?;
        let context = self.this()?;
        match exported_kind(&entry.kind) {
            ExportedKind::SourceFactory => Ok(ForeignInstance::Factory(Arc::new(NativeFactory {
                context,
                handle: entry.handle,
            }))),
            ExportedKind::Source => {
                let header = entry
                    .source
                    .ok_or_else(|| ForeignError::Other(format!("{} did not describe its source", type_name)))?;
                Ok(ForeignInstance::Source(Arc::new(NativeSource { context, header })))
            }
            ExportedKind::Other => Ok(ForeignInstance::Other(type_name.to_string())),
        }
    }

    fn unload(&self) -> ForeignResult<()> {
        if self.unloaded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.library.invoke("unload", &json!({})).map(|_| ())
    }
}

pub struct NativeFactory {
    context: Arc<NativeContext>,
    handle: u64,
}

impl ForeignSourceFactory for NativeFactory {
    fn create_sources(&self) -> ForeignResult<Vec<Arc<dyn ForeignSource>>> {
        let headers: Vec<SourceHeader> = parse(self.context.invoke("createSources", &json!({ "handle": self.handle }))?)?;
        Ok(headers
            .into_iter()
            .map(|header| {
                Arc::new(NativeSource {
                    context: self.context.clone(),
                    header,
                }) as Arc<dyn ForeignSource>
            })
            .collect())
    }
}

pub struct NativeSource {
    context: Arc<NativeContext>,
    header: SourceHeader,
}

impl NativeSource {
    /// Run `method` on a blocking thread and resume `cont` from there. Without
    /// a tokio runtime the call completes inline.
    fn suspend<T, F>(&self, method: &'static str, params: Value, cont: Continuation<T>, map: F) -> Suspend<T>
    where
        T: Send + 'static,
        F: FnOnce(Value) -> ForeignResult<T> + Send + 'static,
    {
        let context = self.context.clone();
        let job = move || context.invoke(method, &params).and_then(map);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let _ = handle.spawn_blocking(move || {
                    if !cont.is_abandoned() {
                        cont.resume(job());
                    }
                });
                Suspend::Suspended
            }
            Err(_) => Suspend::Ready(job()),
        }
    }

    fn params(&self, extra: Value) -> Value {
        let mut params = json!({ "handle": self.header.handle });
        if let (Some(map), Value::Object(extra)) = (params.as_object_mut(), extra) {
            map.extend(extra);
        }
        params
    }

    fn optional_string(&self, method: &str, extra: Value) -> Option<String> {
        match self.context.invoke(method, &self.params(extra)) {
            Ok(value) => value.as_str().map(str::to_string),
            Err(e) => {
                debug!(source = %self.header.name, method, error = %e, "Module could not resolve url");
                None
            }
        }
    }
}

impl ForeignSource for NativeSource {
    fn id(&self) -> i64 {
        self.header.id
    }

    fn name(&self) -> String {
        self.header.name.clone()
    }

    fn lang(&self) -> String {
        self.header.lang.clone()
    }

    fn as_http(&self) -> Option<&dyn HttpCapability> {
        self.header.http.then_some(self as &dyn HttpCapability)
    }

    fn as_catalogue(&self) -> Option<&dyn CatalogueCapability> {
        self.header.catalogue.then_some(self as &dyn CatalogueCapability)
    }

    fn as_configurable(&self) -> Option<&dyn ConfigurableCapability> {
        self.header.configurable.then_some(self as &dyn ConfigurableCapability)
    }

    fn is_parsed_html(&self) -> bool {
        self.header.parsed_html
    }
}

impl CatalogueCapability for NativeSource {
    fn supports_latest(&self) -> bool {
        self.header.supports_latest
    }

    fn filter_list(&self) -> ForeignResult<Vec<Filter>> {
        parse(self.context.invoke("filterList", &self.params(json!({})))?)
    }

    fn fetch_popular(&self, page: u32, cont: Continuation<RawMangasPage>) -> Suspend<RawMangasPage> {
        self.suspend("fetchPopular", self.params(json!({ "page": page })), cont, parse)
    }

    fn fetch_latest(&self, page: u32, cont: Continuation<RawMangasPage>) -> Suspend<RawMangasPage> {
        self.suspend("fetchLatest", self.params(json!({ "page": page })), cont, parse)
    }

    fn fetch_search(
        &self,
        page: u32,
        query: &str,
        filters: &[Filter],
        cont: Continuation<RawMangasPage>,
    ) -> Suspend<RawMangasPage> {
        let params = self.params(json!({ "page": page, "query": query, "filters": filters }));
        self.suspend("fetchSearch", params, cont, parse)
    }
}

impl HttpCapability for NativeSource {
    fn base_url(&self) -> String {
        self.header.base_url.clone()
    }

    fn version_id(&self) -> i32 {
        self.header.version_id
    }

    fn manga_url(&self, manga: &RawManga) -> Option<String> {
        self.optional_string("mangaUrl", json!({ "manga": manga }))
    }

    fn chapter_url(&self, chapter: &RawChapter) -> Option<String> {
        self.optional_string("chapterUrl", json!({ "chapter": chapter }))
    }

    fn fetch_details(&self, manga: &RawManga, cont: Continuation<RawManga>) -> Suspend<RawManga> {
        self.suspend("fetchDetails", self.params(json!({ "manga": manga })), cont, parse)
    }

    fn fetch_chapters(&self, manga: &RawManga, cont: Continuation<Vec<RawChapter>>) -> Suspend<Vec<RawChapter>> {
        self.suspend("fetchChapters", self.params(json!({ "manga": manga })), cont, parse)
    }

    fn fetch_pages(&self, chapter: &RawChapter, cont: Continuation<Vec<RawPage>>) -> Suspend<Vec<RawPage>> {
        self.suspend("fetchPages", self.params(json!({ "chapter": chapter })), cont, parse)
    }

    fn fetch_image_url(&self, page: &RawPage, cont: Continuation<Option<String>>) -> Suspend<Option<String>> {
        self.suspend("fetchImageUrl", self.params(json!({ "page": page })), cont, parse)
    }

    fn get_image(&self, page: &RawPage, cont: Continuation<Option<ForeignResponse>>) -> Suspend<Option<ForeignResponse>> {
        self.suspend("getImage", self.params(json!({ "page": page })), cont, parse_response)
    }

    fn get(&self, url: &str, cont: Continuation<Option<ForeignResponse>>) -> Suspend<Option<ForeignResponse>> {
        self.suspend("get", self.params(json!({ "url": url })), cont, parse_response)
    }
}

fn parse_response(value: Value) -> ForeignResult<Option<ForeignResponse>> {
    let entry: Option<ResponseEntry> = parse(value)?;
    entry.map(ForeignResponse::try_from).transpose()
}

impl ConfigurableCapability for NativeSource {
    fn setup_preference_screen(&self) -> ForeignResult<Arc<dyn PreferenceScreen>> {
        let entry: ScreenEntry = parse(self.context.invoke("preferenceScreen", &self.params(json!({})))?)?;
        Ok(Arc::new(NativeScreen {
            context: self.context.clone(),
            handle: self.header.handle,
            enabled: entry.enabled,
            preferences: entry.preferences,
        }))
    }
}

/// Preference screen snapshot taken when the screen was set up
pub struct NativeScreen {
    context: Arc<NativeContext>,
    handle: u64,
    enabled: bool,
    preferences: Vec<KeyPreference>,
}

impl PreferenceScreen for NativeScreen {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn preferences(&self) -> Vec<KeyPreference> {
        self.preferences.clone()
    }

    fn save_value(&self, index: usize, value: PreferenceValue) -> ForeignResult<()> {
        self.context
            .invoke(
                "savePreference",
                &json!({ "handle": self.handle, "index": index, "value": preference_value_json(&value) }),
            )
            .map(|_| ())
    }

    fn call_change_listener(&self, index: usize, value: &PreferenceValue) -> ForeignResult<()> {
        self.context
            .invoke(
                "preferenceChanged",
                &json!({ "handle": self.handle, "index": index, "value": preference_value_json(value) }),
            )
            .map(|_| ())
            .map_err(|e| {
                warn!(index, error = %e, "Preference change listener failed");
                e
            })
    }
}
