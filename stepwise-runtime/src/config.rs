//! Engine configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via STEPWISE_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use stepwise_core::EngineSettings;

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Execution engine configuration.
    pub engine: EngineConfig,
    /// Status notification configuration.
    pub notifications: NotificationsConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("STEPWISE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.engine.apply_env_overrides();
        self.notifications.apply_env_overrides();
        self.logging.apply_env_overrides();
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.notifications.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Execution engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Region used in generated ARNs.
    pub region: String,
    /// Account id used in generated ARNs.
    pub account_id: String,
    /// Upper bound on concurrent Map iterations (0 = unlimited).
    pub max_concurrency: usize,
    /// Timeout for Tasks that declare none, in seconds (0 = none).
    pub default_task_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            account_id: "123456789012".to_string(),
            max_concurrency: 0,
            default_task_timeout_secs: 0,
        }
    }
}

impl EngineConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(region) = std::env::var("STEPWISE_REGION") {
            self.region = region;
        }

        if let Ok(account) = std::env::var("STEPWISE_ACCOUNT_ID") {
            self.account_id = account;
        }

        if let Ok(max) = std::env::var("STEPWISE_MAX_CONCURRENCY") {
            if let Ok(n) = max.parse() {
                self.max_concurrency = n;
            }
        }

        if let Ok(timeout) = std::env::var("STEPWISE_DEFAULT_TASK_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.default_task_timeout_secs = secs;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.region.is_empty() || self.region.contains(':') {
            return Err(ConfigError::ValidationError(format!(
                "engine.region '{}' is not a valid region",
                self.region
            )));
        }
        if self.account_id.len() != 12 || !self.account_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::ValidationError(format!(
                "engine.account_id '{}' must be 12 digits",
                self.account_id
            )));
        }
        Ok(())
    }

    /// Settings handed to the execution core.
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            max_concurrency: (self.max_concurrency > 0).then_some(self.max_concurrency),
            default_task_timeout: (self.default_task_timeout_secs > 0)
                .then(|| Duration::from_secs(self.default_task_timeout_secs)),
        }
    }
}

/// Status notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Publish status changes to subscribers.
    pub enabled: bool,
    /// Buffered records per channel before slow subscribers lag.
    pub capacity: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1024,
        }
    }
}

impl NotificationsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("STEPWISE_NOTIFY_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }

        if let Ok(capacity) = std::env::var("STEPWISE_NOTIFY_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.capacity = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "notifications.capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("STEPWISE_LOG_LEVEL") {
            self.level = level;
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
