//! Scripted in-memory foreign runtime for tests

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::downloader::{normalize_repository_url, RepositoryDownloader};
use super::loader::{LoadRequest, UnloadPolicy};
use super::package::{package_file_name, WorkUnit};
use super::runtime::*;
use super::suspend::{Continuation, Suspend};
use super::types::{
    FileHash, Filter, KeyPreference, ModuleDescriptor, ModuleFormat, ModuleVersionEntry, PreferenceValue, Repository,
};
use crate::core::error::{BridgeError, Result};
use crate::core::folders::{sha256_file, WorkingFolders};

/// Behaviour of one scripted source
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub id: i64,
    pub name: String,
    pub lang: String,
    pub http: bool,
    pub parsed_html: bool,
    pub catalogue: bool,
    pub latest: bool,
    pub configurable: bool,
    pub screen_enabled: bool,
    pub preferences: Vec<KeyPreference>,
    /// `None` makes image fetches produce no response
    pub image_status: Option<u16>,
    /// Resume continuations from a separate thread instead of answering inline
    pub deferred: bool,
    /// Extra latency before a deferred continuation resumes
    pub delay: Duration,
    /// Shared across clones, counts filter list builds
    pub filter_builds: Arc<AtomicUsize>,
}

impl SourceSpec {
    pub fn new(id: i64, name: &str, lang: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            lang: lang.to_string(),
            http: true,
            parsed_html: false,
            catalogue: true,
            latest: true,
            configurable: false,
            screen_enabled: true,
            preferences: Vec::new(),
            image_status: Some(200),
            deferred: false,
            delay: Duration::ZERO,
            filter_builds: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn plain(mut self) -> Self {
        self.http = false;
        self.catalogue = false;
        self.latest = false;
        self
    }

    pub fn with_preferences(mut self, preferences: Vec<KeyPreference>) -> Self {
        self.configurable = true;
        self.preferences = preferences;
        self
    }
}

pub fn string_pref(key: &str, index: usize, value: &str) -> KeyPreference {
    KeyPreference {
        key: key.to_string(),
        index,
        kind: "ListPreference".to_string(),
        title: key.to_string(),
        default_value: Some(value.to_string()),
        default_value_type: "String".to_string(),
        current_value: Some(value.to_string()),
        visible: true,
        ..Default::default()
    }
}

pub fn bool_pref(key: &str, index: usize, value: bool) -> KeyPreference {
    KeyPreference {
        key: key.to_string(),
        index,
        kind: "SwitchPreferenceCompat".to_string(),
        title: key.to_string(),
        default_value: Some(value.to_string()),
        default_value_type: "Boolean".to_string(),
        current_value: Some(value.to_string()),
        visible: true,
        ..Default::default()
    }
}

/// Load request for package `org.demo` backed by a dummy artifact in `dir`
pub fn load_request(dir: &Path, runtime: Arc<MockRuntime>, format: ModuleFormat, class_name: &str) -> LoadRequest {
    let artifact_path = dir.join("module.bin");
    std::fs::write(&artifact_path, b"module").unwrap();
    LoadRequest {
        entry: ModuleVersionEntry {
            id: "entry-1".into(),
            name: "en-demo".into(),
            class_name: class_name.into(),
            format,
            module: ModuleDescriptor {
                package: "org.demo".into(),
                version: "1.4.2".into(),
                version_code: 2,
                ..Default::default()
            },
            ..Default::default()
        },
        module_name: "en-demo".into(),
        artifact_path,
        preferences_path: dir.join("preferences.json"),
        runtime,
        policy: UnloadPolicy { attempts: 3, interval: Duration::from_millis(1), drain_timeout: Duration::from_secs(1) },
    }
}

#[derive(Debug, Clone)]
pub enum MockExport {
    Factory(Vec<SourceSpec>),
    Source(SourceSpec),
    Other,
}

#[derive(Debug, Clone, Default)]
pub struct MockModule {
    pub exports: Vec<(String, MockExport)>,
    pub unload_fails: bool,
}

impl MockModule {
    pub fn factory(type_name: &str, sources: Vec<SourceSpec>) -> Self {
        Self {
            exports: vec![(type_name.to_string(), MockExport::Factory(sources))],
            unload_fails: false,
        }
    }

    pub fn sources(package: &str, sources: Vec<SourceSpec>) -> Self {
        Self {
            exports: sources
                .into_iter()
                .enumerate()
                .map(|(i, s)| (format!("{}.Source{}", package, i), MockExport::Source(s)))
                .collect(),
            unload_fails: false,
        }
    }

    pub fn with(mut self, type_name: &str, export: MockExport) -> Self {
        self.exports.push((type_name.to_string(), export));
        self
    }
}

#[derive(Default)]
pub struct MockRuntime {
    modules: Mutex<HashMap<String, MockModule>>,
    /// `None` makes settings unreadable
    settings: Mutex<Option<RuntimeSettings>>,
    pub settings_writes: AtomicUsize,
    pub collects: AtomicUsize,
    pub environment_inits: AtomicUsize,
    pub environment_shutdowns: AtomicUsize,
    pub fail_environment: AtomicBool,
    contexts: Mutex<Vec<Weak<MockContext>>>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        let runtime = Self::default();
        if let Ok(mut settings) = runtime.settings.lock() {
            *settings = Some(RuntimeSettings::default());
        }
        Arc::new(runtime)
    }

    pub fn register(&self, package: &str, module: MockModule) {
        self.modules.lock().unwrap().insert(package.to_string(), module);
    }

    pub fn set_settings(&self, settings: Option<RuntimeSettings>) {
        *self.settings.lock().unwrap() = settings;
    }

    pub fn settings(&self) -> Option<RuntimeSettings> {
        self.settings.lock().unwrap().clone()
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }
}

#[async_trait::async_trait]
impl ForeignRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn initialize_environment(&self, _folders: &WorkingFolders) -> std::result::Result<(), ForeignError> {
        self.environment_inits.fetch_add(1, Ordering::SeqCst);
        if self.fail_environment.load(Ordering::SeqCst) {
            return Err(ForeignError::Other("environment unavailable".into()));
        }
        Ok(())
    }

    async fn shutdown_environment(&self) -> std::result::Result<(), ForeignError> {
        self.environment_shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_settings(&self) -> std::result::Result<RuntimeSettings, ForeignError> {
        self.settings
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ForeignError::Io("settings unreadable".into()))
    }

    async fn write_settings(&self, settings: &RuntimeSettings) -> std::result::Result<(), ForeignError> {
        self.settings_writes.fetch_add(1, Ordering::SeqCst);
        *self.settings.lock().unwrap() = Some(settings.clone());
        Ok(())
    }

    async fn create_context(&self, request: &ContextRequest) -> Result<Arc<dyn ExecutionContext>> {
        if !request.path.exists() {
            return Err(BridgeError::NotFound(request.path.display().to_string()));
        }
        let module = self
            .modules
            .lock()
            .unwrap()
            .get(&request.package)
            .cloned()
            .ok_or_else(|| BridgeError::InvalidModule(format!("unknown package {}", request.package)))?;

        let context = Arc::new_cyclic(|me| MockContext {
            name: request.name.clone(),
            module,
            me: me.clone(),
            unloaded: AtomicBool::new(false),
        });
        self.contexts.lock().unwrap().push(Arc::downgrade(&context));
        Ok(context)
    }

    fn collect(&self) {
        self.collects.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockContext {
    name: String,
    module: MockModule,
    me: Weak<MockContext>,
    unloaded: AtomicBool,
}

impl MockContext {
    fn make_source(&self, spec: &SourceSpec) -> std::result::Result<Arc<dyn ForeignSource>, ForeignError> {
        let context = self
            .me
            .upgrade()
            .ok_or_else(|| ForeignError::Other("context gone".into()))?;
        Ok(Arc::new(MockSource::new(spec.clone(), context)))
    }
}

impl ExecutionContext for MockContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn exported_types(&self) -> std::result::Result<Vec<ExportedType>, ForeignError> {
        Ok(self
            .module
            .exports
            .iter()
            .map(|(name, export)| ExportedType {
                name: name.clone(),
                kind: match export {
                    MockExport::Factory(_) => ExportedKind::SourceFactory,
                    MockExport::Source(_) => ExportedKind::Source,
                    MockExport::Other => ExportedKind::Other,
                },
            })
            .collect())
    }

    fn instantiate(&self, type_name: &str) -> std::result::Result<ForeignInstance, ForeignError> {
        if self.unloaded.load(Ordering::SeqCst) {
            return Err(ForeignError::Other("context unloaded".into()));
        }
        let export = self
            .module
            .exports
            .iter()
            .find(|(name, _)| name == type_name)
            .map(|(_, export)| export.clone())
            .ok_or_else(|| ForeignError::Other(format!("ClassNotFoundException: {}", type_name)))?;

        match export {
            MockExport::Factory(specs) => {
                let context = self
                    .me
                    .upgrade()
                    .ok_or_else(|| ForeignError::Other("context gone".into()))?;
                Ok(ForeignInstance::Factory(Arc::new(MockFactory { specs, context })))
            }
            MockExport::Source(spec) => Ok(ForeignInstance::Source(self.make_source(&spec)?)),
            MockExport::Other => Ok(ForeignInstance::Other(type_name.to_string())),
        }
    }

    fn unload(&self) -> std::result::Result<(), ForeignError> {
        self.unloaded.store(true, Ordering::SeqCst);
        if self.module.unload_fails {
            return Err(ForeignError::Other("unload refused".into()));
        }
        Ok(())
    }
}

struct MockFactory {
    specs: Vec<SourceSpec>,
    context: Arc<MockContext>,
}

impl ForeignSourceFactory for MockFactory {
    fn create_sources(&self) -> std::result::Result<Vec<Arc<dyn ForeignSource>>, ForeignError> {
        self.specs.iter().map(|s| self.context.make_source(s)).collect()
    }
}

pub struct MockScreen {
    enabled: bool,
    preferences: Mutex<Vec<KeyPreference>>,
    pub changes: Mutex<Vec<(usize, PreferenceValue)>>,
}

impl PreferenceScreen for MockScreen {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn preferences(&self) -> Vec<KeyPreference> {
        self.preferences.lock().unwrap().clone()
    }

    fn save_value(&self, index: usize, value: PreferenceValue) -> std::result::Result<(), ForeignError> {
        let mut preferences = self.preferences.lock().unwrap();
        let preference = preferences
            .get_mut(index)
            .ok_or_else(|| ForeignError::Other(format!("IndexOutOfBoundsException: {}", index)))?;
        preference.current_value = Some(match value {
            PreferenceValue::String(s) => s,
            PreferenceValue::Bool(b) => b.to_string(),
            PreferenceValue::StringSet(set) => serde_json::to_string(&set).unwrap_or_default(),
        });
        Ok(())
    }

    fn call_change_listener(&self, index: usize, value: &PreferenceValue) -> std::result::Result<(), ForeignError> {
        self.changes.lock().unwrap().push((index, value.clone()));
        Ok(())
    }
}

pub struct MockSource {
    spec: SourceSpec,
    screen: Arc<MockScreen>,
    pub screen_builds: AtomicUsize,
    _context: Arc<MockContext>,
}

impl MockSource {
    fn new(spec: SourceSpec, context: Arc<MockContext>) -> Self {
        let screen = Arc::new(MockScreen {
            enabled: spec.screen_enabled,
            preferences: Mutex::new(spec.preferences.clone()),
            changes: Mutex::new(Vec::new()),
        });
        Self {
            spec,
            screen,
            screen_builds: AtomicUsize::new(0),
            _context: context,
        }
    }

    fn answer<T: Send + 'static>(&self, cont: Continuation<T>, result: std::result::Result<T, ForeignError>) -> Suspend<T> {
        if self.spec.deferred {
            let delay = self.spec.delay;
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                cont.resume(result);
            });
            Suspend::Suspended
        } else {
            Suspend::Ready(result)
        }
    }

    fn page(&self, label: &str, page: u32) -> RawMangasPage {
        RawMangasPage {
            mangas: vec![RawManga {
                url: format!("/manga/{}-{}", label, page),
                title: format!("{} {} {}", self.spec.name, label, page),
                genre: Some("Action, Comedy".to_string()),
                status: 1,
                ..Default::default()
            }],
            has_next_page: page < 3,
        }
    }
}

impl ForeignSource for MockSource {
    fn id(&self) -> i64 {
        self.spec.id
    }

    fn name(&self) -> String {
        self.spec.name.clone()
    }

    fn lang(&self) -> String {
        self.spec.lang.clone()
    }

    fn as_http(&self) -> Option<&dyn HttpCapability> {
        if self.spec.http {
            Some(self)
        } else {
            None
        }
    }

    fn as_catalogue(&self) -> Option<&dyn CatalogueCapability> {
        if self.spec.catalogue {
            Some(self)
        } else {
            None
        }
    }

    fn as_configurable(&self) -> Option<&dyn ConfigurableCapability> {
        if self.spec.configurable {
            Some(self)
        } else {
            None
        }
    }

    fn is_parsed_html(&self) -> bool {
        self.spec.parsed_html
    }
}

impl CatalogueCapability for MockSource {
    fn supports_latest(&self) -> bool {
        self.spec.latest
    }

    fn filter_list(&self) -> std::result::Result<Vec<Filter>, ForeignError> {
        self.spec.filter_builds.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            Filter::Header { name: "Filters".into() },
            Filter::CheckBox { name: "Completed".into(), state: false },
        ])
    }

    fn fetch_popular(&self, page: u32, cont: Continuation<RawMangasPage>) -> Suspend<RawMangasPage> {
        let result = Ok(self.page("popular", page));
        self.answer(cont, result)
    }

    fn fetch_latest(&self, page: u32, cont: Continuation<RawMangasPage>) -> Suspend<RawMangasPage> {
        let result = Ok(self.page("latest", page));
        self.answer(cont, result)
    }

    fn fetch_search(
        &self,
        page: u32,
        query: &str,
        filters: &[Filter],
        cont: Continuation<RawMangasPage>,
    ) -> Suspend<RawMangasPage> {
        let mut result = self.page(query, page);
        result.mangas[0].description = Some(format!("filters={}", filters.len()));
        self.answer(cont, Ok(result))
    }
}

impl HttpCapability for MockSource {
    fn base_url(&self) -> String {
        format!("https://{}.example", self.spec.name.to_lowercase())
    }

    fn version_id(&self) -> i32 {
        1
    }

    fn manga_url(&self, manga: &RawManga) -> Option<String> {
        Some(format!("{}{}", self.base_url(), manga.url))
    }

    fn chapter_url(&self, chapter: &RawChapter) -> Option<String> {
        Some(format!("{}{}", self.base_url(), chapter.url))
    }

    fn fetch_details(&self, manga: &RawManga, cont: Continuation<RawManga>) -> Suspend<RawManga> {
        let details = RawManga {
            url: String::new(),
            title: String::new(),
            description: Some(format!("details of {}", manga.url)),
            author: Some("Author".into()),
            status: 2,
            initialized: true,
            ..Default::default()
        };
        self.answer(cont, Ok(details))
    }

    fn fetch_chapters(&self, manga: &RawManga, cont: Continuation<Vec<RawChapter>>) -> Suspend<Vec<RawChapter>> {
        let chapters = (1..=3)
            .rev()
            .map(|n| RawChapter {
                url: format!("{}/chapter-{}", manga.url, n),
                name: format!("{} - Chapter {}", manga.title, n),
                date_upload: 1_700_000_000_000 + n as i64,
                chapter_number: -1.0,
                scanlator: None,
            })
            .collect();
        self.answer(cont, Ok(chapters))
    }

    fn fetch_pages(&self, chapter: &RawChapter, cont: Continuation<Vec<RawPage>>) -> Suspend<Vec<RawPage>> {
        let pages = vec![
            RawPage { index: 0, url: format!("{}/p0", chapter.url), image_url: None },
            RawPage {
                index: 1,
                url: format!("{}/p1", chapter.url),
                image_url: Some(format!("https://img.example{}/1.png", chapter.url)),
            },
        ];
        self.answer(cont, Ok(pages))
    }

    fn fetch_image_url(&self, page: &RawPage, cont: Continuation<Option<String>>) -> Suspend<Option<String>> {
        let url = Some(format!("https://img.example{}.png", page.url));
        self.answer(cont, Ok(url))
    }

    fn get_image(&self, _page: &RawPage, cont: Continuation<Option<ForeignResponse>>) -> Suspend<Option<ForeignResponse>> {
        let response = self.spec.image_status.map(|status| ForeignResponse {
            status,
            content_type: Some("image/png".to_string()),
            body: Bytes::from_static(b"png-bytes"),
        });
        self.answer(cont, Ok(response))
    }

    fn get(&self, url: &str, cont: Continuation<Option<ForeignResponse>>) -> Suspend<Option<ForeignResponse>> {
        let response = if url.contains("missing") {
            Err(ForeignError::Http { code: 404, message: format!("not found: {}", url) })
        } else {
            Ok(Some(ForeignResponse {
                status: 200,
                content_type: Some("application/octet-stream".to_string()),
                body: Bytes::from(url.to_string()),
            }))
        };
        self.answer(cont, response)
    }
}

impl ConfigurableCapability for MockSource {
    fn setup_preference_screen(&self) -> std::result::Result<Arc<dyn PreferenceScreen>, ForeignError> {
        self.screen_builds.fetch_add(1, Ordering::SeqCst);
        Ok(self.screen.clone())
    }
}

/// In-memory repositories keyed by normalized url, with package bytes keyed by file name
#[derive(Default)]
pub struct MockDownloader {
    published: Mutex<HashMap<String, Vec<ModuleDescriptor>>>,
    packages: Mutex<HashMap<String, Vec<u8>>>,
    pub downloads: AtomicUsize,
}

impl MockDownloader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn module(name: &str, version: &str, code: i64) -> ModuleDescriptor {
        let package = format!("org.sourcebridge.extension.en.{}", name);
        ModuleDescriptor {
            name: format!("Source Bridge: {}", name),
            package_file: package_file_name(&package, version),
            package,
            language: "en".into(),
            version_code: code,
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn publish(&self, url: &str, modules: Vec<ModuleDescriptor>) {
        self.published
            .lock()
            .unwrap()
            .insert(normalize_repository_url(url).to_lowercase(), modules);
    }

    pub fn unpublish(&self, url: &str) {
        self.published
            .lock()
            .unwrap()
            .remove(&normalize_repository_url(url).to_lowercase());
    }

    pub fn publish_package(&self, package_file: &str, bytes: Vec<u8>) {
        self.packages.lock().unwrap().insert(package_file.to_string(), bytes);
    }
}

#[async_trait::async_trait]
impl RepositoryDownloader for MockDownloader {
    async fn populate(&self, mut repository: Repository) -> Result<Repository> {
        let key = normalize_repository_url(&repository.url).to_lowercase();
        let modules = self
            .published
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| BridgeError::request_with_status(404, format!("{} not found", repository.url)))?;
        repository.name = format!("Repository {}", key);
        repository.modules = modules;
        repository.last_updated = Some(chrono::Utc::now());
        Ok(repository)
    }

    async fn download_module(&self, _repository: &Repository, unit: &mut WorkUnit) -> Result<()> {
        let file_name = unit.entry.module.package_file.clone();
        let bytes = self
            .packages
            .lock()
            .unwrap()
            .get(&file_name)
            .cloned()
            .ok_or_else(|| BridgeError::request_with_status(404, format!("{} not found", file_name)))?;
        self.downloads.fetch_add(1, Ordering::SeqCst);

        let path = unit.path().join(&file_name);
        std::fs::write(&path, bytes)?;
        unit.entry.name = unit.entry.module.module_name();
        unit.entry.download_url = Some(format!("mock://{}", file_name));
        unit.entry.package = FileHash {
            sha256: sha256_file(&path)?,
            file_name,
        };
        Ok(())
    }
}
