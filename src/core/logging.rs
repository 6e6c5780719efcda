//! Structured logging system
//!
//! This module provides structured logging with:
//! - JSON and text format support
//! - A separate level for lines forwarded from loaded modules
//! - Time-based file rotation with a bounded number of kept files

use crate::core::config::LoggingConfig;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Tracing target used for log lines that originate inside a loaded module
pub const MODULE_LOG_TARGET: &str = "source_bridge::module";

/// Logger instance that manages the logging system
pub struct Logger {
    _guard: Option<WorkerGuard>,
}

impl Logger {
    /// Initialize the logging system based on configuration
    ///
    /// This sets up the global tracing subscriber with the specified format,
    /// levels, and output destination. `RUST_LOG` replaces the configured
    /// filter entirely when set.
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(filter_directives(config)?)
                .context("Invalid log filter")?,
        };

        let (writer, guard) = match config.output.as_str() {
            "stdout" => tracing_appender::non_blocking(std::io::stdout()),
            "file" => {
                let log_file = config.log_file.as_ref()
                    .context("log_file must be specified when output is 'file'")?;
                let appender = rolling_appender(log_file, &config.rotation, config.max_backups)?;
                tracing_appender::non_blocking(appender)
            }
            _ => {
                anyhow::bail!("Invalid output configuration: {}", config.output);
            }
        };

        let fmt_layer = match config.format.as_str() {
            "json" => {
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_thread_names(true)
                    .with_target(true)
                    .boxed()
            }
            "text" => {
                fmt::layer()
                    .with_writer(writer)
                    .with_thread_names(true)
                    .with_target(true)
                    .boxed()
            }
            _ => {
                anyhow::bail!("Invalid format configuration: {}", config.format);
            }
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .context("Failed to initialize tracing subscriber")?;

        tracing::info!(
            level = %config.level,
            module_level = config.module_level.as_deref().unwrap_or(&config.level),
            format = %config.format,
            output = %config.output,
            "Logging system initialized"
        );

        Ok(Logger { _guard: Some(guard) })
    }
}

/// Re-emit a log line produced by a loaded module.
///
/// Modules report their level as a free-form string; anything unknown is logged at info.
pub fn forward_module_log(module: &str, level: &str, message: &str) {
    match level.to_ascii_lowercase().as_str() {
        "trace" | "verbose" => tracing::trace!(target: MODULE_LOG_TARGET, module, "{}", message),
        "debug" => tracing::debug!(target: MODULE_LOG_TARGET, module, "{}", message),
        "warn" | "warning" => tracing::warn!(target: MODULE_LOG_TARGET, module, "{}", message),
        "error" | "assert" => tracing::error!(target: MODULE_LOG_TARGET, module, "{}", message),
        _ => tracing::info!(target: MODULE_LOG_TARGET, module, "{}", message),
    }
}

/// Filter directives for the host level plus the module target override
fn filter_directives(config: &LoggingConfig) -> Result<String> {
    let level = parse_log_level(&config.level)?;
    let module_level = match &config.module_level {
        Some(module_level) => parse_log_level(module_level)?,
        None => level,
    };
    Ok(format!(
        "{},{}={}",
        level.as_str().to_lowercase(),
        MODULE_LOG_TARGET,
        module_level.as_str().to_lowercase()
    ))
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!("Invalid log level: {}", level),
    }
}

fn parse_rotation(rotation: &str) -> Result<Rotation> {
    match rotation.to_lowercase().as_str() {
        "minutely" => Ok(Rotation::MINUTELY),
        "hourly" => Ok(Rotation::HOURLY),
        "daily" => Ok(Rotation::DAILY),
        "never" => Ok(Rotation::NEVER),
        _ => anyhow::bail!("Invalid log rotation: {}", rotation),
    }
}

/// File appender writing `<log_file>.<period>` and keeping at most `max_backups` files
fn rolling_appender(log_file: &Path, rotation: &str, max_backups: usize) -> Result<RollingFileAppender> {
    let directory = log_file.parent()
        .context("Log file must have a parent directory")?;
    let filename = log_file.file_name()
        .context("Log file must have a filename")?
        .to_str()
        .context("Log filename must be valid UTF-8")?;

    std::fs::create_dir_all(directory)
        .context("Failed to create log directory")?;

    RollingFileAppender::builder()
        .rotation(parse_rotation(rotation)?)
        .filename_prefix(filename)
        .max_log_files(max_backups.max(1))
        .build(directory)
        .context("Failed to create log file appender")
}
