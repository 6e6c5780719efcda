//! Error type system for the source bridge
//!
//! This module provides the bridge error taxonomy with:
//! - Load-time failures (missing package, unusable module)
//! - Capability and request failures raised by source adapters
//! - Lifecycle failures (not initialized, disposed, cancelled)
//! - Error context support for foreign error values

use std::fmt;

/// Main error type for the source bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    // Load-time errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid module: {0}")]
    InvalidModule(String),

    // Source adapter errors
    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    #[error("Request failed{}: {message}", StatusSuffix(.status))]
    RequestFailed {
        status: Option<u16>,
        message: String,
    },

    #[error("Foreign call failed: {0}")]
    ForeignCall(String),

    #[error("Invalid preference: {0}")]
    InvalidPreference(String),

    // Lifecycle errors
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Already disposed: {0}")]
    Disposed(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

struct StatusSuffix<'a>(&'a Option<u16>);

impl fmt::Display for StatusSuffix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, " ({})", code),
            None => Ok(()),
        }
    }
}

impl BridgeError {
    /// Shorthand for a request failure without a status code
    pub fn request(message: impl Into<String>) -> Self {
        BridgeError::RequestFailed {
            status: None,
            message: message.into(),
        }
    }

    /// Shorthand for a request failure that carries an HTTP status code
    pub fn request_with_status(status: u16, message: impl Into<String>) -> Self {
        BridgeError::RequestFailed {
            status: Some(status),
            message: message.into(),
        }
    }

    /// HTTP-style status code attached to a request failure, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            BridgeError::RequestFailed { status, .. } => *status,
            _ => None,
        }
    }

    /// Get the error type name for logs and proxies
    pub fn error_type(&self) -> &'static str {
        match self {
            BridgeError::NotFound(_) => "NotFound",
            BridgeError::InvalidModule(_) => "InvalidModule",
            BridgeError::UnsupportedCapability(_) => "UnsupportedCapability",
            BridgeError::RequestFailed { .. } => "RequestFailed",
            BridgeError::ForeignCall(_) => "ForeignCall",
            BridgeError::InvalidPreference(_) => "InvalidPreference",
            BridgeError::Cancelled => "Cancelled",
            BridgeError::Disposed(_) => "Disposed",
            BridgeError::NotInitialized(_) => "NotInitialized",
            BridgeError::InvalidOperation(_) => "InvalidOperation",
            BridgeError::Initialization(_) => "Initialization",
            BridgeError::Config(_) => "Config",
            BridgeError::Io(_) => "Io",
            BridgeError::Serialization(_) => "Serialization",
        }
    }

    /// Check if this error is retryable by the caller's own policy.
    ///
    /// The bridge itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::RequestFailed { .. })
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

/// Result type alias for operations that can fail with BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Context extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let context_str = context.into();
            BridgeError::Initialization(format!("{}: {}", context_str, e))
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let context_str = f();
            BridgeError::Initialization(format!("{}: {}", context_str, e))
        })
    }
}
