//! Core infrastructure module
//!
//! This module provides the ambient layer the bridge runs on:
//! - Configuration management
//! - Structured logging system
//! - Error handling and type system
//! - Working folder layout and persistence helpers

pub mod config;
pub mod error;
pub mod folders;
pub mod logging;

pub use config::Config;
pub use error::{BridgeError, ErrorContext, Result};
pub use folders::WorkingFolders;
pub use logging::Logger;
