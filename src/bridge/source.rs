//! Uniform capability surface over one module-exposed source
//!
//! A [`SourceInterop`] wraps a foreign source whose capability set varies and
//! presents the same asynchronous operations for all of them. Capabilities are
//! probed once; an operation whose capability is missing fails with
//! `UnsupportedCapability` before anything crosses into the foreign runtime.
//!
//! The interop is owned by the loader that created it. Once that loader is
//! disposed the wrapped source is released and every operation fails with
//! `Disposed`.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::chapters::{parse_chapter_number, sanitize_chapter_name};
use super::gate::{CallGate, CallPermit};
use super::runtime::{
    CatalogueCapability, ForeignResponse, ForeignSource, HttpCapability, PreferenceScreen, RawChapter, RawManga,
    RawMangasPage, RawPage,
};
use super::suspend::{call_suspend, Continuation, Suspend};
use super::types::{
    Chapter, ContentStream, Filter, KeyPreference, Manga, MangaList, MangaStatus, Page, PreferenceValue,
    SourceCapabilities, SourceDescriptor, UpdateStrategy,
};
use crate::core::error::{BridgeError, Result};

pub struct SourceInterop {
    descriptor: SourceDescriptor,
    module: String,
    source: Mutex<Option<Arc<dyn ForeignSource>>>,
    filters: Mutex<Option<Vec<Filter>>>,
    screen: Mutex<Option<Arc<dyn PreferenceScreen>>>,
    shutdown: CancellationToken,
    gate: Arc<CallGate>,
}

impl SourceInterop {
    /// Wrap `source`, probing its capabilities once.
    ///
    /// `shutdown` is the owning loader's token; once cancelled, pending and
    /// future calls fail with `Disposed`.
    pub fn new(module: &str, source: Arc<dyn ForeignSource>, shutdown: CancellationToken) -> Self {
        Self::gated(module, source, shutdown, CallGate::new())
    }

    /// Like [`SourceInterop::new`], admitting calls through the owner's `gate`
    pub(crate) fn gated(
        module: &str,
        source: Arc<dyn ForeignSource>,
        shutdown: CancellationToken,
        gate: Arc<CallGate>,
    ) -> Self {
        let http = source.as_http();
        let catalogue = source.as_catalogue();

        let capabilities = SourceCapabilities {
            http: http.is_some(),
            parsed_html: http.is_some() && source.is_parsed_html(),
            catalogue: catalogue.is_some(),
            configurable: source.as_configurable().is_some(),
            supports_latest: catalogue.map(|c| c.supports_latest()).unwrap_or(false),
        };

        let descriptor = SourceDescriptor {
            id: source.id(),
            name: source.name(),
            language: source.lang(),
            base_url: http.map(|h| h.base_url()).unwrap_or_default(),
            version_id: http.map(|h| h.version_id()).unwrap_or(0),
            capabilities,
        };

        Self {
            descriptor,
            module: module.to_string(),
            source: Mutex::new(Some(source)),
            filters: Mutex::new(None),
            screen: Mutex::new(None),
            shutdown,
            gate,
        }
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> i64 {
        self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn language(&self) -> &str {
        &self.descriptor.language
    }

    pub fn capabilities(&self) -> SourceCapabilities {
        self.descriptor.capabilities
    }

    pub fn is_disposed(&self) -> bool {
        self.shutdown.is_cancelled()
            || lock(&self.source).map(|s| s.is_none()).unwrap_or(true)
    }

    /// Release the wrapped source. Idempotent.
    pub(crate) fn dispose(&self) {
        if let Ok(mut source) = lock(&self.source) {
            source.take();
        }
        if let Ok(mut screen) = lock(&self.screen) {
            screen.take();
        }
        if let Ok(mut filters) = lock(&self.filters) {
            filters.take();
        }
    }

    /// Admit one call; the permit must live as long as the call
    fn enter(&self) -> Result<CallPermit> {
        if self.shutdown.is_cancelled() {
            return Err(self.disposed());
        }
        self.gate.enter().ok_or_else(|| self.disposed())
    }

    fn handle(&self) -> Result<(Arc<dyn ForeignSource>, CallPermit)> {
        let permit = self.enter()?;
        let source = lock(&self.source)?.clone().ok_or_else(|| self.disposed())?;
        Ok((source, permit))
    }

    fn disposed(&self) -> BridgeError {
        BridgeError::Disposed(format!("source {} of module {}", self.descriptor.id, self.module))
    }

    fn unsupported(&self, what: &str) -> BridgeError {
        BridgeError::UnsupportedCapability(format!(
            "source {} ({}) does not support {}",
            self.descriptor.name, self.descriptor.id, what
        ))
    }

    fn http<'a>(&self, source: &'a Arc<dyn ForeignSource>) -> Result<&'a dyn HttpCapability> {
        source.as_http().ok_or_else(|| self.unsupported("http operations"))
    }

    fn catalogue<'a>(&self, source: &'a Arc<dyn ForeignSource>) -> Result<&'a dyn CatalogueCapability> {
        source.as_catalogue().ok_or_else(|| self.unsupported("catalogue operations"))
    }

    /// Run a suspend-style call, racing the caller's token and the owner's shutdown
    async fn bridge<T, F>(&self, call: F, cancel: &CancellationToken) -> Result<T>
    where
        F: FnOnce(Continuation<T>) -> Suspend<T>,
    {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(self.disposed()),
            result = call_suspend(call, cancel) => result,
        }
    }

    pub async fn get_popular(&self, page: u32, cancel: &CancellationToken) -> Result<MangaList> {
        let (source, _call) = self.handle()?;
        let catalogue = self.catalogue(&source)?;
        let raw = self.bridge(|cont| catalogue.fetch_popular(page, cont), cancel).await?;
        Ok(to_manga_list(raw, source.as_http()))
    }

    pub async fn get_latest(&self, page: u32, cancel: &CancellationToken) -> Result<MangaList> {
        let (source, _call) = self.handle()?;
        let catalogue = self.catalogue(&source)?;
        if !catalogue.supports_latest() {
            return Err(self.unsupported("latest updates"));
        }
        let raw = self.bridge(|cont| catalogue.fetch_latest(page, cont), cancel).await?;
        Ok(to_manga_list(raw, source.as_http()))
    }

    /// Search with the source's cached filter list
    pub async fn search(&self, page: u32, query: &str, cancel: &CancellationToken) -> Result<MangaList> {
        let (source, _call) = self.handle()?;
        let catalogue = self.catalogue(&source)?;
        let filters = self.cached_filters(catalogue)?;
        let raw = self
            .bridge(|cont| catalogue.fetch_search(page, query, &filters, cont), cancel)
            .await?;
        Ok(to_manga_list(raw, source.as_http()))
    }

    /// The catalogue filter list, built on first use
    pub fn get_filters(&self) -> Result<Vec<Filter>> {
        let (source, _call) = self.handle()?;
        let catalogue = self.catalogue(&source)?;
        self.cached_filters(catalogue)
    }

    fn cached_filters(&self, catalogue: &dyn CatalogueCapability) -> Result<Vec<Filter>> {
        let mut cached = lock(&self.filters)?;
        if let Some(filters) = cached.as_ref() {
            return Ok(filters.clone());
        }
        let filters = catalogue.filter_list()?;
        debug!(source_id = self.descriptor.id, count = filters.len(), "Cached filter list");
        *cached = Some(filters.clone());
        Ok(filters)
    }

    pub async fn get_details(&self, manga: &Manga, cancel: &CancellationToken) -> Result<Manga> {
        let (source, _call) = self.handle()?;
        let http = self.http(&source)?;
        let raw = from_manga(manga);
        let details = self.bridge(|cont| http.fetch_details(&raw, cont), cancel).await?;

        let mut result = to_manga(details, None);
        if result.title.is_empty() {
            result.title = manga.title.clone();
        }
        if result.url.is_empty() {
            result.url = manga.url.clone();
        }
        result.real_url = http.manga_url(&from_manga(&result));
        Ok(result)
    }

    pub async fn get_chapters(&self, manga: &Manga, cancel: &CancellationToken) -> Result<Vec<Chapter>> {
        let (source, _call) = self.handle()?;
        let http = self.http(&source)?;
        let raw = from_manga(manga);
        let chapters = self.bridge(|cont| http.fetch_chapters(&raw, cont), cancel).await?;

        let total = chapters.len() as u32;
        Ok(chapters
            .into_iter()
            .enumerate()
            .map(|(position, chapter)| {
                let real_url = http.chapter_url(&chapter);
                let parsed_number = parse_chapter_number(&manga.title, &chapter.name, Some(chapter.chapter_number));
                let parsed_name = sanitize_chapter_name(&chapter.name, &manga.title);
                Chapter {
                    url: chapter.url,
                    name: chapter.name,
                    parsed_name,
                    parsed_number,
                    date_upload: chapter.date_upload,
                    chapter_number: chapter.chapter_number,
                    scanlator: chapter.scanlator.filter(|s| !s.is_empty()),
                    // sources list newest first
                    index: total - position as u32,
                    real_url,
                }
            })
            .collect())
    }

    pub async fn get_pages(&self, chapter: &Chapter, cancel: &CancellationToken) -> Result<Vec<Page>> {
        let (source, _call) = self.handle()?;
        let http = self.http(&source)?;
        let raw = from_chapter(chapter);
        let pages = self.bridge(|cont| http.fetch_pages(&raw, cont), cancel).await?;

        Ok(pages
            .into_iter()
            .map(|p| Page {
                index: p.index,
                url: p.url,
                image_url: p.image_url.filter(|u| !u.is_empty()),
            })
            .collect())
    }

    /// Fetch the image of one page, resolving its image url first when missing
    pub async fn get_page_image(&self, page: &Page, cancel: &CancellationToken) -> Result<ContentStream> {
        let (source, _call) = self.handle()?;
        let http = self.http(&source)?;

        let mut raw = RawPage {
            index: page.index,
            url: page.url.clone(),
            image_url: page.image_url.clone().filter(|u| !u.is_empty()),
        };

        if raw.image_url.is_none() {
            let resolved = self.bridge(|cont| http.fetch_image_url(&raw, cont), cancel).await?;
            raw.image_url = resolved.filter(|u| !u.is_empty());
        }

        if raw.image_url.is_none() {
            return Err(BridgeError::InvalidOperation(format!(
                "page {} has no image url",
                page.index
            )));
        }

        let response = self.bridge(|cont| http.get_image(&raw, cont), cancel).await?;
        into_content(response, "Image response was null")
    }

    /// Download an arbitrary url through the source's own client
    pub async fn download_url(&self, url: &str, cancel: &CancellationToken) -> Result<ContentStream> {
        let (source, _call) = self.handle()?;
        let http = self.http(&source)?;
        if url.is_empty() {
            return Err(BridgeError::InvalidOperation("download url is empty".to_string()));
        }

        let response = self.bridge(|cont| http.get(url, cont), cancel).await?;
        into_content(response, "Download response was null")
    }

    /// Live preferences of this source, empty when it is not configurable
    pub fn get_preferences(&self) -> Result<Vec<KeyPreference>> {
        if !self.descriptor.capabilities.configurable {
            return Ok(Vec::new());
        }
        let _call = self.enter()?;
        let screen = self.screen()?;
        Ok(screen
            .preferences()
            .into_iter()
            .enumerate()
            .map(|(index, mut p)| {
                p.index = index;
                p
            })
            .collect())
    }

    pub fn set_preference(&self, preference: &KeyPreference) -> Result<()> {
        self.set_preference_value(preference.index, preference.current_value.as_deref().unwrap_or_default())
    }

    pub fn set_preferences(&self, preferences: &[KeyPreference]) -> Result<()> {
        let _call = self.enter()?;
        let screen = self.screen()?;
        if !screen.is_enabled() {
            return Ok(());
        }
        for preference in preferences {
            self.write_value(&screen, preference.index, preference.current_value.as_deref().unwrap_or_default())?;
        }
        Ok(())
    }

    /// Decode `value` by the declared type of the preference at `index` and write it back
    pub fn set_preference_value(&self, index: usize, value: &str) -> Result<()> {
        let _call = self.enter()?;
        let screen = self.screen()?;
        if !screen.is_enabled() {
            return Ok(());
        }
        self.write_value(&screen, index, value)
    }

    fn write_value(&self, screen: &Arc<dyn PreferenceScreen>, index: usize, value: &str) -> Result<()> {
        let preferences = screen.preferences();
        let target = preferences.get(index).ok_or_else(|| {
            BridgeError::InvalidPreference(format!(
                "source {} has no preference at index {}",
                self.descriptor.id, index
            ))
        })?;

        let decoded = PreferenceValue::decode(&target.default_value_type, value)?;
        screen.save_value(index, decoded.clone())?;
        if let Err(e) = screen.call_change_listener(index, &decoded) {
            warn!(source_id = self.descriptor.id, key = %target.key, error = %e, "Preference change listener failed");
        }
        Ok(())
    }

    fn screen(&self) -> Result<Arc<dyn PreferenceScreen>> {
        let (source, _call) = self.handle()?;
        let configurable = source
            .as_configurable()
            .ok_or_else(|| self.unsupported("preferences"))?;

        let mut cached = lock(&self.screen)?;
        if let Some(screen) = cached.as_ref() {
            return Ok(screen.clone());
        }
        let screen = configurable.setup_preference_screen()?;
        *cached = Some(screen.clone());
        Ok(screen)
    }
}

impl std::fmt::Debug for SourceInterop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceInterop")
            .field("descriptor", &self.descriptor)
            .field("module", &self.module)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| BridgeError::InvalidOperation("source state lock poisoned".to_string()))
}

fn into_content(response: Option<ForeignResponse>, null_message: &str) -> Result<ContentStream> {
    let response = response.ok_or_else(|| BridgeError::request(null_message))?;
    if !response.is_success() {
        return Err(BridgeError::request_with_status(
            response.status,
            format!("Request error! {}", response.status),
        ));
    }
    Ok(ContentStream {
        content_type: response.content_type,
        data: response.body,
    })
}

fn to_manga_list(page: RawMangasPage, http: Option<&dyn HttpCapability>) -> MangaList {
    MangaList {
        mangas: page.mangas.into_iter().map(|m| to_manga(m, http)).collect(),
        has_next_page: page.has_next_page,
    }
}

fn to_manga(raw: RawManga, http: Option<&dyn HttpCapability>) -> Manga {
    let real_url = http.and_then(|h| h.manga_url(&raw));
    Manga {
        genre: raw
            .genre
            .as_deref()
            .map(|g| {
                g.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        status: MangaStatus::from_code(raw.status),
        update_strategy: if raw.update_strategy == 1 {
            UpdateStrategy::OnlyFetchOnce
        } else {
            UpdateStrategy::AlwaysUpdate
        },
        url: raw.url,
        title: raw.title,
        artist: raw.artist,
        author: raw.author,
        description: raw.description,
        thumbnail_url: raw.thumbnail_url,
        initialized: raw.initialized,
        real_url,
    }
}

fn from_manga(manga: &Manga) -> RawManga {
    RawManga {
        url: manga.url.clone(),
        title: manga.title.clone(),
        artist: manga.artist.clone(),
        author: manga.author.clone(),
        description: manga.description.clone(),
        genre: if manga.genre.is_empty() {
            None
        } else {
            Some(manga.genre.join(", "))
        },
        status: manga.status.code(),
        thumbnail_url: manga.thumbnail_url.clone(),
        update_strategy: match manga.update_strategy {
            UpdateStrategy::AlwaysUpdate => 0,
            UpdateStrategy::OnlyFetchOnce => 1,
        },
        initialized: manga.initialized,
    }
}

fn from_chapter(chapter: &Chapter) -> RawChapter {
    RawChapter {
        url: chapter.url.clone(),
        name: chapter.name.clone(),
        date_upload: chapter.date_upload,
        chapter_number: chapter.chapter_number,
        scanlator: chapter.scanlator.clone(),
    }
}
