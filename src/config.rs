//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (VOXLOGICA_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [storage]
//! db_path = "./data/results.db"
//!
//! [execution]
//! strategy = "deferred"
//! num_workers = 0
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! VOXLOGICA_STORAGE__DB_PATH=/custom/results.db
//! VOXLOGICA_EXECUTION__STRATEGY=strict
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Result store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the SQLite results database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

/// Execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Default strategy (strict, deferred; dask accepted as an alias)
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Worker threads for the deferred strategy
    /// 0 = use all available CPU cores
    #[serde(default)]
    pub num_workers: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_db_path() -> PathBuf {
    PathBuf::from("./voxlogica_results.db")
}
fn default_strategy() -> String {
    "deferred".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (VOXLOGICA_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("VOXLOGICA_").split("__"))
            .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("VOXLOGICA_").split("__"))
            .extract()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig::default(),
            execution: ExecutionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            db_path: default_db_path(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            strategy: default_strategy(),
            num_workers: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.db_path, default_db_path());
        assert_eq!(config.execution.strategy, "deferred");
        assert_eq!(config.execution.num_workers, 0);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        assert!(toml_str.contains("[storage]"));
        assert!(toml_str.contains("[execution]"));
        assert!(toml_str.contains("[logging]"));
    }

    #[test]
    fn test_strategy_string_parses() {
        use crate::execution::Strategy;
        let config = Config::default();
        assert!(config.execution.strategy.parse::<Strategy>().is_ok());
    }
}
