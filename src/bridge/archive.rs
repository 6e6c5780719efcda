//! Loader for packaged archive modules
//!
//! Archive modules name their entry class in the module entry; the class is
//! resolved against the module package and must be a source or a factory.

use std::sync::Arc;
use tracing::debug;

use super::loader::{delegate_module_interop, LoadRequest, LoadedModule};
use super::preferences::BaseKeyRule;
use super::runtime::{ExecutionContext, ForeignInstance, ForeignSource};
use super::types::ModuleVersionEntry;
use crate::core::error::{BridgeError, Result};

pub struct ArchiveExtensionInterop {
    inner: LoadedModule,
}

impl ArchiveExtensionInterop {
    pub async fn load(request: LoadRequest) -> Result<Self> {
        let inner =
            LoadedModule::load(request, BaseKeyRule::LastUnderscoreFallback, discover_sources).await?;
        Ok(Self { inner })
    }
}

delegate_module_interop!(ArchiveExtensionInterop);

/// Fully qualified entry class for `class_name` inside `package`
pub fn resolve_class_name(package: &str, class_name: &str) -> String {
    if class_name.starts_with('.') {
        format!("{}{}", package, class_name)
    } else if class_name.contains('.') {
        class_name.to_string()
    } else {
        format!("{}.{}", package, class_name)
    }
}

fn discover_sources(
    context: &dyn ExecutionContext,
    entry: &ModuleVersionEntry,
) -> Result<Vec<Arc<dyn ForeignSource>>> {
    if entry.class_name.trim().is_empty() {
        return Err(BridgeError::InvalidModule(format!(
            "module {} does not declare an entry class",
            entry.name
        )));
    }

    let class_name = resolve_class_name(&entry.module.package, entry.class_name.trim());
    debug!(module = %entry.name, class = %class_name, "Instantiating entry class");

    match context.instantiate(&class_name)? {
        ForeignInstance::Factory(factory) => Ok(factory.create_sources()?),
        ForeignInstance::Source(source) => Ok(vec![source]),
        ForeignInstance::Other(name) => Err(BridgeError::InvalidModule(format!(
            "{} is neither a source nor a source factory",
            name
        ))),
    }
}
