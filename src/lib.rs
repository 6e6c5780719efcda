//! Source Bridge Library
//!
//! This library hosts third-party content source modules compiled for a
//! foreign runtime and exposes them through a uniform, strongly typed
//! source interface, together with module repositories, versioning and
//! per-source preferences.

pub mod bridge;
pub mod core;

// Re-export commonly used types
pub use bridge::{BridgeHost, BridgeManager, ModuleInterop, NativeRuntime, SourceInterop};
pub use crate::core::{BridgeError, Config, Logger};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias for the library
pub type Result<T> = anyhow::Result<T>;
