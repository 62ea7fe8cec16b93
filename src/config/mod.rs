//! Configuration file loading and parsing.
//!
//! This module handles loading the configuration file from disk and parsing
//! it into validated, type-safe structures.
//!
//! # Configuration File Locations
//!
//! The configuration file is searched in the following order:
//!
//! 1. Path specified via `--config` CLI flag
//! 2. Default location:
//!    - **Linux/macOS:** `~/.cadwork-mcp/config.json`
//!    - **Windows:** `%USERPROFILE%\.cadwork-mcp\config.json`
//!
//! A missing file at the default location is not an error: the built-in
//! defaults are used. The `CW_PORT` environment variable overrides the port
//! after the file is read.
//!
//! # Example Configuration
//!
//! See `config/example-config.json` for a complete example.

mod settings;

pub use settings::{
    Config, ConnectionConfig, ConnectionMode, LoggingConfig, ServerConfig, DEFAULT_HOST,
    DEFAULT_PORT, PORT_ENV_VAR,
};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Returns the default configuration directory.
///
/// - **Linux/macOS:** `~/.cadwork-mcp/`
/// - **Windows:** `%USERPROFILE%\.cadwork-mcp\`
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".cadwork-mcp"))
}

/// Returns the platform-specific default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.json"))
}

/// Loads and parses the configuration file.
///
/// If `path` is `None`, uses the platform-specific default location and
/// falls back to defaults when no file exists there.
///
/// # Errors
///
/// Returns an error if:
/// - An explicitly given configuration file cannot be found
/// - The file cannot be read
/// - The JSON is malformed
/// - `CW_PORT` is set to something other than a port number
/// - Required fields are missing or invalid
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => read_config(p)?,
        None => match default_config_path() {
            Some(p) if p.exists() => read_config(&p)?,
            _ => {
                tracing::debug!("No configuration file found, using defaults");
                Config::default()
            }
        },
    };

    config.apply_env()?;
    config.validate()?;

    Ok(config)
}

fn read_config(config_path: &Path) -> Result<Config, ConfigError> {
    if !config_path.exists() {
        return Err(ConfigError::NotFound {
            path: config_path.to_path_buf(),
        });
    }

    let contents = std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
        path: config_path.to_path_buf(),
        source: e,
    })?;

    serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
        path: config_path.to_path_buf(),
        source: e,
    })
}
