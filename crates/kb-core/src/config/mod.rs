//! Configuration management for kbridge

mod api;
mod proxy;
mod relay;
pub mod serde_utils;

pub use api::ApiConfig;
pub use proxy::{GatewayConfig, LocalConfig};
pub use relay::RelayConfig;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Remote API endpoint settings
    pub api: ApiConfig,
    /// Local proxy (`app`) settings
    pub local: LocalConfig,
    /// Gateway proxy (`proxy`) settings
    pub gateway: GatewayConfig,
    /// Relay engine tuning
    pub relay: RelayConfig,
}

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kbridge")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Load the config file at `path`, or the default location when `path` is
/// `None`. A missing default file yields the default configuration; a missing
/// explicit file is an error.
pub fn load_or_default(path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => {
            let default_path = default_config_path();
            if default_path.exists() {
                load_config(&default_path)
            } else {
                Ok(ConfigFile::default())
            }
        }
    }
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}
