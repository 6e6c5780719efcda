//! Configuration management

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use config::{Config as ConfigBuilder, ConfigBuilder as Builder, ConfigError as BuilderError, Environment, File};
use config::builder::DefaultState;
use clap::Parser;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid bridge configuration: {0}")]
    InvalidBridge(String),

    #[error("Invalid repository configuration: {0}")]
    InvalidRepositories(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

impl From<ConfigError> for crate::core::error::BridgeError {
    fn from(err: ConfigError) -> Self {
        crate::core::error::BridgeError::Config(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub repositories: RepositoryConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(CliArgs::parse())
    }

    /// Load configuration using already parsed command-line arguments
    pub fn load_from(cli_args: CliArgs) -> Result<Self, ConfigError> {
        // 1. Start with defaults (lowest priority)
        let mut builder = with_defaults(ConfigBuilder::builder())?;

        // 2. Load from config file if specified (medium priority)
        if let Some(config_path) = &cli_args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(
                    config_path.display().to_string()
                ));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // 3. Override with environment variables (higher priority)
        // Example: BRIDGE_BRIDGE__MODULE_FORMAT=library
        builder = builder.add_source(
            Environment::with_prefix("BRIDGE")
                .separator("__")
                .try_parsing(true)
        );

        // 4. Override with CLI arguments (highest priority)
        if let Some(working_dir) = &cli_args.working_dir {
            builder = builder.set_override("bridge.working_dir", working_dir.display().to_string())?;
        }
        if let Some(temp_dir) = &cli_args.temp_dir {
            builder = builder.set_override("bridge.temp_dir", temp_dir.display().to_string())?;
        }
        if let Some(format) = &cli_args.module_format {
            builder = builder.set_override("bridge.module_format", format.clone())?;
        }
        if let Some(log_level) = &cli_args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file path, on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = with_defaults(ConfigBuilder::builder())?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Configuration made of defaults only, rooted at the given working directory
    pub fn with_working_dir(working_dir: &Path) -> Result<Self, ConfigError> {
        let config: Config = with_defaults(ConfigBuilder::builder())?
            .set_override("bridge.working_dir", working_dir.display().to_string())?
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bridge.validate()?;
        self.repositories.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Per-user data directory, falling back to `./bridge`
fn default_working_dir() -> String {
    dirs::data_local_dir()
        .map(|dir| dir.join("source-bridge"))
        .unwrap_or_else(|| PathBuf::from("./bridge"))
        .display()
        .to_string()
}

fn with_defaults(builder: Builder<DefaultState>) -> Result<Builder<DefaultState>, ConfigError> {
    Ok(builder
        .set_default("bridge.working_dir", default_working_dir())?
        .set_default("bridge.module_format", "archive")?
        .set_default("bridge.unload_poll_attempts", 10)?
        .set_default("bridge.unload_poll_interval_ms", 50)?
        .set_default("bridge.unload_drain_timeout_ms", 5000)?
        .set_default("bridge.idle_interval_ms", 100)?
        .set_default("repositories.user_agent", concat!("SourceBridge/", env!("CARGO_PKG_VERSION")))?
        .set_default("repositories.request_timeout", 300)?
        .set_default("repositories.initial", Vec::<String>::new())?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stdout")?
        .set_default("logging.rotation", "daily")?
        .set_default("logging.max_backups", 5)?)
}

/// Command-line arguments for configuration override
#[derive(Debug, Default, Parser)]
#[command(name = "source-bridge")]
#[command(about = "Content source module bridge host", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Bridge working directory
    #[arg(short, long, value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Temporary directory for package work units
    #[arg(long, value_name = "DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Module artifact format (archive, library)
    #[arg(short, long, value_name = "FORMAT")]
    pub module_format: Option<String>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub working_dir: PathBuf,
    pub temp_dir: Option<PathBuf>,
    pub module_format: String,
    pub unload_poll_attempts: u32,
    pub unload_poll_interval_ms: u64,
    pub unload_drain_timeout_ms: u64,
    pub idle_interval_ms: u64,
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.working_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidBridge("working_dir cannot be empty".to_string()));
        }

        let valid_formats = ["archive", "library"];
        if !valid_formats.contains(&self.module_format.as_str()) {
            return Err(ConfigError::InvalidBridge(
                format!("module_format must be one of: {:?}", valid_formats)
            ));
        }

        if self.unload_poll_attempts == 0 {
            return Err(ConfigError::InvalidBridge("unload_poll_attempts must be greater than 0".to_string()));
        }

        if self.idle_interval_ms == 0 {
            return Err(ConfigError::InvalidBridge("idle_interval_ms must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn unload_poll_interval(&self) -> Duration {
        Duration::from_millis(self.unload_poll_interval_ms)
    }

    pub fn unload_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.unload_drain_timeout_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    pub user_agent: String,
    pub request_timeout: u64, // seconds
    pub initial: Vec<String>,
}

impl RepositoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::InvalidRepositories("user_agent cannot be empty".to_string()));
        }

        if self.request_timeout == 0 {
            return Err(ConfigError::InvalidRepositories("request_timeout must be greater than 0".to_string()));
        }

        for repo in &self.initial {
            url::Url::parse(repo).map_err(|e| {
                ConfigError::InvalidRepositories(format!("invalid repository url {}: {}", repo, e))
            })?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// Level for lines forwarded from loaded modules; `level` when unset
    pub module_level: Option<String>,
    pub format: String,
    pub output: String,
    pub log_file: Option<PathBuf>,
    /// File rotation period: minutely, hourly, daily or never
    pub rotation: String,
    pub max_backups: usize,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("level must be one of: {:?}", valid_levels)
            ));
        }

        if let Some(module_level) = &self.module_level {
            if !valid_levels.contains(&module_level.as_str()) {
                return Err(ConfigError::InvalidLogging(
                    format!("module_level must be one of: {:?}", valid_levels)
                ));
            }
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("format must be one of: {:?}", valid_formats)
            ));
        }

        let valid_outputs = ["stdout", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("output must be one of: {:?}", valid_outputs)
            ));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string()
            ));
        }

        let valid_rotations = ["minutely", "hourly", "daily", "never"];
        if !valid_rotations.contains(&self.rotation.as_str()) {
            return Err(ConfigError::InvalidLogging(
                format!("rotation must be one of: {:?}", valid_rotations)
            ));
        }

        if self.max_backups == 0 {
            return Err(ConfigError::InvalidLogging("max_backups must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::load_from(CliArgs::default()).unwrap();
        assert_eq!(config.bridge.module_format, "archive");
        assert_eq!(config.bridge.unload_poll_attempts, 10);
        assert_eq!(config.bridge.unload_drain_timeout(), Duration::from_secs(5));
        assert_eq!(config.bridge.idle_interval(), Duration::from_millis(100));
        assert_eq!(config.repositories.request_timeout, 300);
        assert!(config.repositories.initial.is_empty());
    }

    #[test]
    fn test_cli_overrides() {
        let args = CliArgs {
            working_dir: Some(PathBuf::from("/tmp/bridge-test")),
            module_format: Some("library".to_string()),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        let config = Config::load_from(args).unwrap();
        assert_eq!(config.bridge.working_dir, PathBuf::from("/tmp/bridge-test"));
        assert_eq!(config.bridge.module_format, "library");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_module_format_rejected() {
        let args = CliArgs {
            module_format: Some("apk".to_string()),
            ..Default::default()
        };
        assert!(matches!(Config::load_from(args), Err(ConfigError::InvalidBridge(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(
            &path,
            r#"
[bridge]
working_dir = "/srv/bridge"
idle_interval_ms = 250

[repositories]
initial = ["https://example.org/repo/index.min.json"]
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.bridge.working_dir, PathBuf::from("/srv/bridge"));
        assert_eq!(config.bridge.idle_interval_ms, 250);
        assert_eq!(config.repositories.initial.len(), 1);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_logging_module_level_and_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(
            &path,
            r#"
[logging]
module_level = "warn"
rotation = "hourly"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.logging.module_level.as_deref(), Some("warn"));
        assert_eq!(config.logging.rotation, "hourly");
        assert_eq!(config.logging.max_backups, 5);

        let mut logging = config.logging.clone();
        logging.rotation = "weekly".to_string();
        assert!(matches!(logging.validate(), Err(ConfigError::InvalidLogging(_))));
        logging.rotation = "never".to_string();
        logging.module_level = Some("loud".to_string());
        assert!(matches!(logging.validate(), Err(ConfigError::InvalidLogging(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file(Path::new("/definitely/not/here.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_invalid_initial_repository() {
        let repositories = RepositoryConfig {
            user_agent: "ua".to_string(),
            request_timeout: 10,
            initial: vec!["not a url".to_string()],
        };
        assert!(repositories.validate().is_err());
    }
}
