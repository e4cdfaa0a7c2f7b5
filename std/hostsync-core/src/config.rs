//!
//! Runtime Configuration
//!
//! Process-wide defaults for the primitives. Configuration can be built in
//! code, parsed from TOML, or read from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HOSTSYNC_POOL_TIMEOUT_MS` | Checkout timeout for pools created without one | 1000 |
//! | `HOSTSYNC_MAP_SHARDS` | Shard count for new maps (power of two) | 16 |
//! | `HOSTSYNC_LOG` | `tracing` filter directive for the runtime logger | warn |
//!
//! # Example hostsync.toml
//!
//! ```toml
//! pool_timeout_ms = 250
//! map_shards = 64
//! log_filter = "hostsync=debug"
//! ```
//!

use std::env;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub const DEFAULT_POOL_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_MAP_SHARDS: usize = 16;
pub const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    pub pool_timeout_ms: u64,
    pub map_shards: usize,
    pub log_filter: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pool_timeout_ms: DEFAULT_POOL_TIMEOUT_MS,
            map_shards: DEFAULT_MAP_SHARDS,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, SyncError> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, SyncError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Defaults overridden by `HOSTSYNC_*` variables. A value that does not
    /// parse, or fails validation, is ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("HOSTSYNC_POOL_TIMEOUT_MS") {
            config.pool_timeout_ms = ms;
        }
        if let Some(shards) = env_parse::<usize>("HOSTSYNC_MAP_SHARDS") {
            if valid_shard_count(shards) {
                config.map_shards = shards;
            } else {
                tracing::warn!(shards, "ignoring HOSTSYNC_MAP_SHARDS: not a power of two");
            }
        }
        if let Ok(filter) = env::var("HOSTSYNC_LOG") {
            if !filter.trim().is_empty() {
                config.log_filter = filter;
            }
        }

        config
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if !valid_shard_count(self.map_shards) {
            return Err(SyncError::InvalidConfig(format!(
                "map_shards must be a power of two, got {}",
                self.map_shards
            )));
        }
        Ok(())
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    pub fn to_toml_string(&self) -> String {
        // A struct of plain scalars always serializes.
        toml::to_string(self).unwrap_or_default()
    }
}

fn valid_shard_count(shards: usize) -> bool {
    shards.is_power_of_two()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}

static GLOBAL_CONFIG: OnceLock<SyncConfig> = OnceLock::new();

/// Install the process-wide configuration. Only the first call wins; later
/// calls return `false` and leave the installed config alone.
pub fn install(config: SyncConfig) -> bool {
    GLOBAL_CONFIG.set(config).is_ok()
}

/// The installed configuration, or the defaults if none was installed.
pub fn global() -> &'static SyncConfig {
    GLOBAL_CONFIG.get_or_init(SyncConfig::default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.pool_timeout_ms, 1000);
        assert_eq!(config.map_shards, 16);
        assert_eq!(config.log_filter, "warn");
        assert_eq!(config.pool_timeout(), Duration::from_millis(1000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml_str("map_shards = 64\n").unwrap();
        assert_eq!(config.map_shards, 64);
        assert_eq!(config.pool_timeout_ms, DEFAULT_POOL_TIMEOUT_MS);
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_invalid_shards_rejected() {
        let err = SyncConfig::from_toml_str("map_shards = 12\n").unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
        assert!(err.to_string().contains("power of two"));

        let err = SyncConfig::from_toml_str("map_shards = \"many\"\n").unwrap_err();
        assert!(matches!(err, SyncError::Toml(_)));
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let config = SyncConfig {
            pool_timeout_ms: 250,
            map_shards: 8,
            log_filter: "hostsync=debug".to_string(),
        };

        let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(config.to_toml_string().as_bytes()).unwrap();

        let loaded = SyncConfig::from_path(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::TempDir::new().expect("Failed to create temp directory");
        let err = SyncConfig::from_path(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, SyncError::Io(_)));
    }

    #[test]
    fn test_global_falls_back_to_defaults() {
        // Tests in this crate never install a config.
        assert_eq!(global().map_shards, DEFAULT_MAP_SHARDS);
    }
}
