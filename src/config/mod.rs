//! Unified configuration for the unicontact server.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! Environment variables use the `UNICONTACT_` prefix and a double underscore
//! between nesting levels, e.g. `UNICONTACT_STORAGE__DATA_DIR`.
//!
//! # Example config file (unicontact.toml)
//! ```toml
//! [server]
//! listen = "0.0.0.0:3000"
//!
//! [storage]
//! data_dir = "/var/lib/unicontact"
//!
//! [log]
//! filter = "unicontact_rs=debug,info"
//! ```

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Main configuration for unicontact components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UniContactConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Contact store configuration
    pub storage: StorageConfig,
    /// Reconciliation engine tuning
    pub reconcile: ReconcileConfig,
    /// Logging configuration
    pub log: LogConfig,
}

impl UniContactConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        Self::figment(config_path, overrides)
            .extract()
            .map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    fn figment(config_path: Option<&str>, overrides: ConfigOverrides) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(UniContactConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with UNICONTACT_ prefix
        figment = figment.merge(Env::prefixed("UNICONTACT_").split("__"));

        // Layer 3: CLI overrides
        figment.merge(Serialized::defaults(overrides))
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((DEFAULT_LISTEN_IP, DEFAULT_LISTEN_PORT)),
        }
    }
}

/// Contact store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory for the persistent store. In-memory when unset.
    pub data_dir: Option<PathBuf>,
    /// Run RocksDB repair before opening
    pub repair: bool,
    /// Decoded contacts kept in the LRU cache
    pub cache_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            repair: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Reconciliation engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Lock-scope widenings allowed per observation
    pub max_scope_attempts: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_scope_attempts: DEFAULT_MAX_SCOPE_ATTEMPTS,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<bool>,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
#[error("configuration error: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
