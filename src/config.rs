//! Engine configuration loading.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors. These are fatal at startup; nothing in the engine
/// attempts to run with a partial configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Backing store selection.
    pub storage: StorageConfig,
    /// Cache tuning.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match &self.storage {
            StorageConfig::Sqlite { path } if path.is_empty() => {
                return Err(ConfigError::Invalid("storage.path must not be empty".into()));
            }
            StorageConfig::File { directory } if directory.as_os_str().is_empty() => {
                return Err(ConfigError::Invalid(
                    "storage.directory must not be empty".into(),
                ));
            }
            _ => {}
        }
        if self.cache.lookup_capacity == 0 {
            return Err(ConfigError::Invalid(
                "cache.lookup_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Backing store selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// SQLite database file. Use `":memory:"` for an in-process database.
    Sqlite { path: String },
    /// One JSON document per channel under the given directory.
    File { directory: PathBuf },
    /// Volatile in-memory store, for tests and throwaway deployments.
    Memory,
}

/// Cache tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Capacity of each identity lookup cache (default: 1000 entries).
    #[serde(default = "default_lookup_capacity")]
    pub lookup_capacity: usize,
    /// Seconds a file-backend channel document may sit unread before it is
    /// dropped from the document cache (default: 300).
    #[serde(default = "default_document_idle_secs")]
    pub document_idle_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lookup_capacity: default_lookup_capacity(),
            document_idle_secs: default_document_idle_secs(),
        }
    }
}

fn default_lookup_capacity() -> usize {
    1000
}

fn default_document_idle_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sqlite_backend_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            backend = "sqlite"
            path = "channels.db"
            "#,
        )
        .unwrap();
        assert!(matches!(config.storage, StorageConfig::Sqlite { ref path } if path == "channels.db"));
        assert_eq!(config.cache.lookup_capacity, 1000);
        assert_eq!(config.cache.document_idle_secs, 300);
    }

    #[test]
    fn sqlite_backend_requires_path() {
        let err = toml::from_str::<Config>(
            r#"
            [storage]
            backend = "sqlite"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("path"));
    }

    #[test]
    fn empty_path_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            backend = "sqlite"
            path = ""
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_cache_capacity_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            backend = "memory"

            [cache]
            lookup_capacity = 0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
