//! Configuration for the exchange core
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (exchange.toml)
//! - Environment variables (EXCHANGE__*)
//!
//! ## Example config file (exchange.toml):
//! ```toml
//! [registry]
//! backend = "filesystem"
//! path = "./schemas"
//! compatibility = "full"
//! reject_breaking = true
//!
//! [registry.cache]
//! max_entries = 500
//! ttl_secs = 60
//!
//! [codec]
//! require_checksum = true
//!
//! [codec.compression]
//! algorithm = "gzip"
//! threshold = 2048
//!
//! [codec.json]
//! date_format = "epoch_millis"
//!
//! [logging]
//! level = "debug"
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::codec::compression::CompressionSettings;
use crate::codec::json::DateFormat;
use crate::codec::DEFAULT_MAX_SIZE;
use crate::compatibility::CompatibilityLevel;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub codec: CodecConfig,

    #[serde(default)]
    pub migration: MigrationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where registrations are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Filesystem,
    /// Supplied by the caller through `SchemaRegistry::new`
    Remote,
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Root directory of the filesystem backend
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,

    /// File extension of persisted schema sources
    #[serde(default = "default_extension")]
    pub extension: String,

    #[serde(default)]
    pub compatibility: CompatibilityLevel,

    /// Check new versions against the preceding one
    #[serde(default = "default_true")]
    pub check_compatibility: bool,

    /// Reject breaking versions; when false they are accepted and flagged
    #[serde(default = "default_true")]
    pub reject_breaking: bool,

    /// Upper bound on a single backend persist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_timeout_ms: Option<u64>,

    #[serde(default)]
    pub cache: CacheConfig,
}

/// Compiled-schema cache bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,

    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

/// Settings shared by every codec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Upper bound on encoded and decoded sizes
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Reject payloads that carry no checksum
    #[serde(default)]
    pub require_checksum: bool,

    #[serde(default)]
    pub compression: CompressionSettings,

    #[serde(default)]
    pub json: JsonConfig,
}

/// Text codec settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JsonConfig {
    #[serde(default)]
    pub pretty: bool,

    #[serde(default)]
    pub date_format: DateFormat,
}

/// Version transformer settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationConfig {
    /// Validate migrated data against the compiled target schema
    #[serde(default)]
    pub validate_result: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_registry_path() -> PathBuf {
    PathBuf::from("./schemas")
}

fn default_extension() -> String {
    "avsc".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cache_entries() -> usize {
    10_000
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_max_size() -> usize {
    DEFAULT_MAX_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            path: default_registry_path(),
            extension: default_extension(),
            compatibility: CompatibilityLevel::Backward,
            check_compatibility: true,
            reject_breaking: true,
            persist_timeout_ms: None,
            cache: CacheConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            require_checksum: false,
            compression: CompressionSettings::default(),
            json: JsonConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ExchangeConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, adding a specific file on top of the default locations
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = ["exchange.toml", ".exchange.toml", "config/exchange.toml"];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "familiar", "exchange") {
            let xdg_config = config_dir.config_dir().join("exchange.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // EXCHANGE__REGISTRY__PATH=... style overrides
        builder = builder.add_source(
            Environment::with_prefix("EXCHANGE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get the registry path (resolves relative paths)
    pub fn registry_path(&self) -> PathBuf {
        if self.registry.path.is_absolute() {
            self.registry.path.clone()
        } else {
            std::env::current_dir().unwrap_or_default().join(&self.registry.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::compression::CompressionAlgorithm;

    #[test]
    fn test_default_config() {
        let config = ExchangeConfig::default();
        assert_eq!(config.registry.compatibility, CompatibilityLevel::Backward);
        assert_eq!(config.registry.cache.max_entries, 10_000);
        assert_eq!(config.registry.cache.ttl_secs, 300);
        assert_eq!(config.codec.max_size, 10 * 1024 * 1024);
        assert_eq!(config.codec.compression.threshold, 1024);
        assert!(!config.codec.require_checksum);
    }

    #[test]
    fn test_serialize_config() {
        let config = ExchangeConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[registry]"));
        assert!(toml_str.contains("[codec.compression]"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[registry]
backend = "filesystem"
compatibility = "full"
reject_breaking = false

[registry.cache]
ttl_secs = 5

[codec.compression]
algorithm = "brotli"

[codec.json]
date_format = "epoch_millis"
"#,
        )
        .unwrap();

        let config = ExchangeConfig::load_from(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.registry.backend, BackendKind::Filesystem);
        assert_eq!(config.registry.compatibility, CompatibilityLevel::Full);
        assert!(!config.registry.reject_breaking);
        assert_eq!(config.registry.cache.ttl_secs, 5);
        assert_eq!(config.registry.cache.max_entries, 10_000);
        assert_eq!(config.codec.compression.algorithm, CompressionAlgorithm::Brotli);
        assert_eq!(config.codec.json.date_format, DateFormat::EpochMillis);
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = ExchangeConfig::default();
        config.migration.validate_result = true;
        config.save(path.to_str().unwrap()).unwrap();

        let loaded = ExchangeConfig::load_from(Some(path.to_str().unwrap())).unwrap();
        assert!(loaded.migration.validate_result);
    }
}
