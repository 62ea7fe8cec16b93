//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::wire::frame::DEFAULT_MAX_MESSAGE_BYTES;

/// Loopback address the plug-in listens on.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Port the plug-in listens on.
pub const DEFAULT_PORT: u16 = 53002;

/// Environment variable overriding the port of both sides.
pub const PORT_ENV_VAR: &str = "CW_PORT";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Bridge-side connection to the plug-in.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Plug-in-side listener.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::ValidationError { message });

        if self.connection.host.trim().is_empty() || self.server.host.trim().is_empty() {
            return invalid("host must not be empty".to_string());
        }
        if self.connection.port == 0 {
            return invalid("connection.port must be between 1 and 65535".to_string());
        }
        if self.connection.timeout_secs == 0 || self.connection.connect_timeout_secs == 0 {
            return invalid("connection timeouts must be at least 1 second".to_string());
        }
        if self.server.read_timeout_secs == 0 {
            return invalid("server.read_timeout_secs must be at least 1 second".to_string());
        }
        if self.server.max_message_bytes == 0 || self.connection.max_message_bytes == 0 {
            return invalid("max_message_bytes must be greater than zero".to_string());
        }
        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }
        Ok(())
    }

    /// Applies environment overrides.
    ///
    /// `CW_PORT` replaces the port of both the connection and the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is set but is not a valid port.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_port_override(std::env::var(PORT_ENV_VAR).ok().as_deref())
    }

    fn apply_port_override(&mut self, value: Option<&str>) -> Result<(), ConfigError> {
        let Some(value) = value else {
            return Ok(());
        };
        let port: u16 = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::ValidationError {
                message: format!("{PORT_ENV_VAR} must be a port number, got '{value}'"),
            })?;
        self.connection.port = port;
        self.server.port = port;
        Ok(())
    }
}

/// Connection lifecycle strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Open a fresh socket for every command.
    #[default]
    PerCall,
    /// Open one socket at startup and reuse it.
    Persistent,
}

/// Bridge-side connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Plug-in host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Plug-in port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Lifecycle strategy.
    #[serde(default)]
    pub mode: ConnectionMode,

    /// Seconds allowed for establishing the socket.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Seconds allowed between response chunks.
    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,

    /// Largest accepted response.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl ConnectionConfig {
    /// The connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// The receive timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mode: ConnectionMode::default(),
            connect_timeout_secs: default_connect_timeout(),
            timeout_secs: default_client_timeout(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

/// Plug-in listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind; 0 picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds allowed between request chunks.
    #[serde(default = "default_server_timeout")]
    pub read_timeout_secs: u64,

    /// Largest accepted request.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// File name reported by `get_model_name`.
    #[serde(default)]
    pub model_name: Option<String>,
}

impl ServerConfig {
    /// The per-connection read timeout.
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout_secs: default_server_timeout(),
            max_message_bytes: default_max_message_bytes(),
            model_name: None,
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

const fn default_connect_timeout() -> u64 {
    5
}

const fn default_client_timeout() -> u64 {
    30
}

const fn default_server_timeout() -> u64 {
    20
}

const fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let json = r"{}";
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.port, DEFAULT_PORT);
        assert_eq!(config.connection.mode, ConnectionMode::PerCall);
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "_comment": "Test config",
            "connection": {
                "host": "127.0.0.1",
                "port": 2000,
                "mode": "persistent",
                "connect_timeout_secs": 2,
                "timeout_secs": 10,
                "max_message_bytes": 4096
            },
            "server": {
                "host": "0.0.0.0",
                "port": 2001,
                "read_timeout_secs": 15,
                "max_message_bytes": 8192,
                "model_name": "hall.3d"
            },
            "logging": {
                "level": "debug"
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.port, 2000);
        assert_eq!(config.connection.mode, ConnectionMode::Persistent);
        assert_eq!(config.connection.timeout(), Duration::from_secs(10));
        assert_eq!(config.connection.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.read_timeout(), Duration::from_secs(15));
        assert_eq!(config.server.max_message_bytes, 8192);
        assert_eq!(config.server.model_name.as_deref(), Some("hall.3d"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn defaults_match_protocol_constants() {
        let connection = ConnectionConfig::default();
        assert_eq!(connection.host, DEFAULT_HOST);
        assert_eq!(connection.timeout(), Duration::from_secs(30));
        assert_eq!(connection.max_message_bytes, 65_536);

        let server = ServerConfig::default();
        assert_eq!(server.read_timeout(), Duration::from_secs(20));
        assert_eq!(server.port, DEFAULT_PORT);
    }

    #[test]
    fn logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "warn");
    }

    #[test]
    fn port_override_applies_to_both_sides() {
        let mut config = Config::default();
        config.apply_port_override(Some(" 2000 ")).unwrap();
        assert_eq!(config.connection.port, 2000);
        assert_eq!(config.server.port, 2000);

        config.apply_port_override(None).unwrap();
        assert_eq!(config.connection.port, 2000);
    }

    #[test]
    fn reject_invalid_port_override() {
        let mut config = Config::default();
        assert!(config.apply_port_override(Some("70000")).is_err());
        assert!(config.apply_port_override(Some("cadwork")).is_err());
        assert_eq!(config.connection.port, DEFAULT_PORT);
    }

    #[test]
    fn reject_zero_timeouts_and_limits() {
        let mut config = Config::default();
        config.connection.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.max_message_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.connection.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn server_may_bind_ephemeral_port() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reject_unknown_log_level() {
        let json = r#"{ "logging": { "level": "loud" } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_unknown_mode() {
        let json = r#"{ "connection": { "mode": "pooled" } }"#;
        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn reject_unknown_fields() {
        let json = r#"{
            "unknown_field": "value"
        }"#;

        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
