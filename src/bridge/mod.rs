//! Module bridge
//!
//! This module provides the bridge between the host and third-party source modules:
//! - Foreign runtime abstraction and the native library runtime
//! - Source adapters with a uniform capability surface
//! - Per-language preference reconciliation
//! - Loaders for library and archive module formats
//! - Repository, package and module version management
//! - Bridge manager, lifecycle host and the public registries

pub mod archive;
pub mod chapters;
pub mod downloader;
pub mod extension;
pub mod gate;
pub mod host;
pub mod loader;
pub mod manager;
pub mod modules;
pub mod native;
pub mod package;
pub mod preferences;
pub mod proxy;
pub mod repositories;
pub mod runtime;
pub mod source;
pub mod suspend;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use archive::ArchiveExtensionInterop;
pub use downloader::{HttpRepositoryDownloader, RepositoryDownloader};
pub use extension::ExtensionInterop;
pub use gate::{CallGate, CallPermit};
pub use host::BridgeHost;
pub use loader::{load_interop, LoadRequest, ModuleInterop, UnloadPolicy};
pub use manager::BridgeManager;
pub use modules::ModuleManager;
pub use native::NativeRuntime;
pub use package::{PackageConverter, PackageManifest, WorkUnit, ZipPayloadConverter};
pub use preferences::{BaseKeyRule, PreferenceStore};
pub use proxy::{ModuleRegistry, PublicModuleManager, PublicRepositoryManager, RepositoryRegistry};
pub use repositories::RepositoryManager;
pub use runtime::{ExecutionContext, ForeignError, ForeignRuntime, ForeignSource, RuntimeSettings};
pub use source::SourceInterop;
pub use suspend::{call_suspend, Continuation, Suspend};
pub use types::{
    BridgePreferences, BridgeState, Chapter, ContentStream, Filter, Manga, MangaList, ModuleDescriptor, ModuleFormat,
    ModuleGroup, ModuleVersionEntry, Page, Repository, SourceCapabilities, SourceDescriptor, UniquePreference,
};
