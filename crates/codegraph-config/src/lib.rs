//! Configuration for the codegraph services.
//!
//! Configuration is read from a TOML file (by default in the platform config
//! directory), then overridden from `CODEGRAPH_*` environment variables.
//! Every field has a default, so an empty or missing file is valid.
//!
//! ```toml
//! [rollback]
//! retention_window_secs = 3600
//! max_memory_bytes = 268435456
//! default_ttl_secs = 86400
//! cleanup_interval_ms = 60000
//! default_strategy = "abort"
//!
//! [logging]
//! filter = "info,codegraph_rollback=debug"
//! ```

pub mod logging;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use logging::LoggingConfig;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "CODEGRAPH_";

/// Error types for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

/// Conflict strategy applied when a restore does not request one explicitly.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategySetting {
    #[default]
    Abort,
    Force,
    Merge,
}

/// What happens to a rollback point after it has been restored successfully.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsumePolicySetting {
    /// Keep the point, marked as consumed
    #[default]
    Retain,
    /// Delete the point and its snapshots
    Remove,
}

/// The `[rollback]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RollbackConfig {
    /// How long terminal operations are kept for audit (in seconds)
    pub retention_window_secs: u64,
    /// Global ceiling for snapshot payload bytes
    pub max_memory_bytes: u64,
    /// Ceiling for the snapshot bytes held by a single rollback point
    pub max_point_bytes: u64,
    /// TTL applied to rollback points created without an explicit expiry
    pub default_ttl_secs: Option<u64>,
    /// Period of the background expiry/cleanup sweep (in milliseconds)
    pub cleanup_interval_ms: u64,
    pub default_strategy: StrategySetting,
    pub consume_policy: ConsumePolicySetting,
    /// Buffered lifecycle events per subscriber
    pub event_capacity: usize,
    /// Directory for the JSON persistence adapter; in-memory only when unset
    pub persistence_dir: Option<PathBuf>,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            retention_window_secs: 3600,        // Keep finished operations for an hour
            max_memory_bytes: 256 * 1024 * 1024, // 256 MiB of snapshot payloads
            max_point_bytes: 64 * 1024 * 1024,  // 64 MiB per rollback point
            default_ttl_secs: Some(24 * 3600),  // Points live for a day
            cleanup_interval_ms: 60_000,        // Sweep every minute
            default_strategy: StrategySetting::Abort,
            consume_policy: ConsumePolicySetting::Retain,
            event_capacity: 256,
            persistence_dir: None,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub rollback: RollbackConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: AppConfig = toml::from_str(&contents)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when no file exists.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                let mut config = AppConfig::default();
                config.apply_env_overrides(|key| std::env::var(key).ok())?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Platform config file location, e.g. `~/.config/codegraph/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "codegraph", "codegraph")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Override fields from `CODEGRAPH_*` variables resolved through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let rollback = &mut self.rollback;

        if let Some(value) = var("ROLLBACK_RETENTION_WINDOW_SECS") {
            rollback.retention_window_secs = parse_number("ROLLBACK_RETENTION_WINDOW_SECS", &value)?;
        }
        if let Some(value) = var("ROLLBACK_MAX_MEMORY_BYTES") {
            rollback.max_memory_bytes = parse_number("ROLLBACK_MAX_MEMORY_BYTES", &value)?;
        }
        if let Some(value) = var("ROLLBACK_MAX_POINT_BYTES") {
            rollback.max_point_bytes = parse_number("ROLLBACK_MAX_POINT_BYTES", &value)?;
        }
        if let Some(value) = var("ROLLBACK_DEFAULT_TTL_SECS") {
            // 0 disables the default TTL
            let ttl = parse_number("ROLLBACK_DEFAULT_TTL_SECS", &value)?;
            rollback.default_ttl_secs = (ttl > 0).then_some(ttl);
        }
        if let Some(value) = var("ROLLBACK_CLEANUP_INTERVAL_MS") {
            rollback.cleanup_interval_ms = parse_number("ROLLBACK_CLEANUP_INTERVAL_MS", &value)?;
        }
        if let Some(value) = var("ROLLBACK_DEFAULT_STRATEGY") {
            rollback.default_strategy = match value.trim().to_ascii_lowercase().as_str() {
                "abort" => StrategySetting::Abort,
                "force" => StrategySetting::Force,
                "merge" => StrategySetting::Merge,
                other => {
                    return Err(ConfigError::Invalid {
                        key: format!("{ENV_PREFIX}ROLLBACK_DEFAULT_STRATEGY"),
                        reason: format!("unknown strategy '{other}'"),
                    })
                }
            };
        }
        if let Some(value) = var("ROLLBACK_PERSISTENCE_DIR") {
            rollback.persistence_dir = (!value.trim().is_empty()).then(|| PathBuf::from(value));
        }
        if let Some(value) = var("LOG") {
            self.logging.filter = value;
        }

        Ok(())
    }

    /// Reject combinations the rollback store cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rollback = &self.rollback;
        if rollback.cleanup_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "rollback.cleanup_interval_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if rollback.max_point_bytes > rollback.max_memory_bytes {
            return Err(ConfigError::Invalid {
                key: "rollback.max_point_bytes".to_string(),
                reason: format!(
                    "{} exceeds max_memory_bytes {}",
                    rollback.max_point_bytes, rollback.max_memory_bytes
                ),
            });
        }
        if rollback.event_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "rollback.event_capacity".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|e| ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{name}"),
        reason: format!("'{value}' is not a number: {e}"),
    })
}
