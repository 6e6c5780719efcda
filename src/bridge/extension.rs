//! Loader for compiled library modules
//!
//! Sources are discovered by scanning the module's exported types: the
//! first source factory inside the module's package wins, otherwise the
//! first plain source type is instantiated.

use std::sync::Arc;
use tracing::debug;

use super::loader::{delegate_module_interop, LoadRequest, LoadedModule};
use super::preferences::BaseKeyRule;
use super::runtime::{ExecutionContext, ExportedKind, ForeignInstance, ForeignSource};
use super::types::ModuleVersionEntry;
use crate::core::error::{BridgeError, Result};

pub struct ExtensionInterop {
    inner: LoadedModule,
}

impl ExtensionInterop {
    pub async fn load(request: LoadRequest) -> Result<Self> {
        let inner = LoadedModule::load(request, BaseKeyRule::LanguageSuffix, discover_sources).await?;
        Ok(Self { inner })
    }
}

delegate_module_interop!(ExtensionInterop);

fn discover_sources(
    context: &dyn ExecutionContext,
    entry: &ModuleVersionEntry,
) -> Result<Vec<Arc<dyn ForeignSource>>> {
    let package = &entry.module.package;
    let types = context.exported_types()?;

    if let Some(factory) = types
        .iter()
        .find(|t| t.kind == ExportedKind::SourceFactory && t.name.starts_with(package.as_str()))
    {
        debug!(module = %entry.name, factory = %factory.name, "Using source factory");
        let sources = match context.instantiate(&factory.name)? {
            ForeignInstance::Factory(factory) => factory.create_sources()?,
            _ => {
                return Err(BridgeError::InvalidModule(format!(
                    "{} is not a source factory",
                    factory.name
                )))
            }
        };
        if sources.is_empty() {
            return Err(BridgeError::InvalidModule(format!(
                "source factory {} produced no sources",
                factory.name
            )));
        }
        return Ok(sources);
    }

    let source_type = types
        .iter()
        .find(|t| t.kind == ExportedKind::Source && t.name.starts_with(package.as_str()))
        .ok_or_else(|| {
            BridgeError::InvalidModule(format!("no source or source factory found in {}", package))
        })?;

    debug!(module = %entry.name, source = %source_type.name, "Using source type");
    match context.instantiate(&source_type.name)? {
        ForeignInstance::Source(source) => Ok(vec![source]),
        _ => Err(BridgeError::InvalidModule(format!("{} is not a source", source_type.name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::loader::ModuleInterop;
    use crate::bridge::testing::*;
    use crate::bridge::types::ModuleFormat;
    use tempfile::TempDir;

    async fn load(runtime: Arc<MockRuntime>, dir: &TempDir) -> Result<ExtensionInterop> {
        ExtensionInterop::load(load_request(dir.path(), runtime, ModuleFormat::Library, "")).await
    }

    #[tokio::test]
    async fn test_factory_sources_are_wrapped() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        runtime.register(
            "org.demo",
            MockModule::factory(
                "org.demo.DemoFactory",
                vec![SourceSpec::new(1, "Demo", "en"), SourceSpec::new(2, "Demo", "es")],
            ),
        );

        let interop = load(runtime, &dir).await.unwrap();
        let langs: Vec<String> = interop.sources().iter().map(|s| s.language().to_string()).collect();
        assert_eq!(langs, vec!["en", "es"]);
        assert_eq!(interop.name(), "en-demo");
        interop.dispose().await;
    }

    #[tokio::test]
    async fn test_factory_outside_package_is_ignored() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        let module = MockModule::factory("com.other.Factory", vec![SourceSpec::new(9, "Other", "en")])
            .with("org.demo.Single", MockExport::Source(SourceSpec::new(3, "Single", "fr")));
        runtime.register("org.demo", module);

        let interop = load(runtime, &dir).await.unwrap();
        let sources = interop.sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].id(), 3);
        interop.dispose().await;
    }

    #[tokio::test]
    async fn test_source_outside_package_is_ignored() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        let module = MockModule::default()
            .with("com.other.Foreign", MockExport::Source(SourceSpec::new(99, "Foreign", "en")))
            .with("org.demo.Real", MockExport::Source(SourceSpec::new(3, "Real", "en")));
        runtime.register("org.demo", module);

        let interop = load(runtime, &dir).await.unwrap();
        let ids: Vec<i64> = interop.sources().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![3]);
        interop.dispose().await;
    }

    #[tokio::test]
    async fn test_only_foreign_sources_is_invalid() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        let module =
            MockModule::default().with("com.other.Foreign", MockExport::Source(SourceSpec::new(99, "Foreign", "en")));
        runtime.register("org.demo", module);

        let err = load(runtime.clone(), &dir).await.err().unwrap();
        assert!(matches!(err, BridgeError::InvalidModule(_)));
        assert_eq!(runtime.live_contexts(), 0);
    }

    #[tokio::test]
    async fn test_empty_factory_is_invalid() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        runtime.register("org.demo", MockModule::factory("org.demo.Empty", Vec::new()));

        let err = load(runtime.clone(), &dir).await.err().unwrap();
        assert!(matches!(err, BridgeError::InvalidModule(_)));
        assert_eq!(runtime.live_contexts(), 0);
    }

    #[tokio::test]
    async fn test_no_source_types_is_invalid() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        runtime.register("org.demo", MockModule::default().with("org.demo.Helper", MockExport::Other));

        let err = load(runtime.clone(), &dir).await.err().unwrap();
        assert!(matches!(err, BridgeError::InvalidModule(_)));
        assert_eq!(runtime.live_contexts(), 0);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_not_found() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        let mut request = load_request(dir.path(), runtime, ModuleFormat::Library, "");
        request.artifact_path = dir.path().join("absent.bin");

        let err = ExtensionInterop::load(request).await.err().unwrap();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_disposed_sources_refuse_calls() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        runtime.register(
            "org.demo",
            MockModule::sources("org.demo", vec![SourceSpec::new(1, "Demo", "en")]),
        );

        let interop = load(runtime.clone(), &dir).await.unwrap();
        let source = interop.sources().remove(0);
        interop.dispose().await;

        let cancel = tokio_util::sync::CancellationToken::new();
        let err = source.get_popular(1, &cancel).await.unwrap_err();
        assert!(matches!(err, BridgeError::Disposed(_)));
        assert!(!interop.is_alive());
        assert_eq!(runtime.live_contexts(), 0);
    }
}
