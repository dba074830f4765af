//! Configuration loading using Figment.
//!
//! Configuration is layered, highest precedence last:
//! 1. Built-in defaults
//! 2. `config/sweep.toml` (or the file passed to [`SweepConfig::load_from`])
//! 3. Environment variables prefixed with `RUST_SWEEP_`, with `__` separating
//!    nested keys
//!
//! ```text
//! RUST_SWEEP_APPLICATION__LOG_LEVEL=debug
//! RUST_SWEEP_ENGINE__SETTLE_DELAY=250ms
//! RUST_SWEEP_STORAGE__DATABASE_PATH=/data/results.db
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::{EngineConfig, StorageFailurePolicy};

/// Config file read by [`SweepConfig::load`].
pub const DEFAULT_CONFIG_PATH: &str = "config/sweep.toml";
/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "RUST_SWEEP_";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not read or merge a source.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// A value was read but is not usable.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SweepConfig {
    /// Process-wide settings such as logging.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Run engine tuning.
    #[serde(default)]
    pub engine: EngineSettings,
    /// Result database.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Plugin discovery.
    #[serde(default)]
    pub plugins: PluginConfig,
}

/// Application identity and logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Name reported in logs.
    pub name: String,
    /// trace, debug, info, warn or error. `RUST_LOG` takes precedence when set.
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub log_json: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "rust_sweep".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// File form of [`EngineConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Wait between setting parameters and measuring, e.g. `"500ms"`.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
    /// What to do when the store rejects a point.
    #[serde(default)]
    pub storage_failure: StorageFailurePolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            settle_delay: engine.settle_delay,
            event_capacity: engine.event_capacity,
            storage_failure: engine.storage_failure,
        }
    }
}

/// Result database location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite file; parent directories are created on open.
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/measurements.db"),
        }
    }
}

/// Where plugins and their saved settings live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Directory scanned for plugin manifests.
    pub directory: PathBuf,
    /// Directory holding saved per-plugin settings.
    pub settings_dir: PathBuf,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("plugins"),
            settings_dir: PathBuf::from("config/plugins"),
        }
    }
}

impl SweepConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment. A missing file leaves
    /// the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        config.validate()?;
        Ok(config)
    }

    /// Check values figment cannot type-check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.engine.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "engine.event_capacity must be at least 1".to_string(),
            ));
        }

        if self.storage.database_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.database_path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// The engine's slice of the settings.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            settle_delay: self.engine.settle_delay,
            event_capacity: self.engine.event_capacity,
            storage_failure: self.engine.storage_failure,
        }
    }
}
