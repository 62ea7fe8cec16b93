//! Error types for cadwork-mcp.
//!
//! Errors are split by layer so that transport failures and business
//! failures never travel on the same path:
//!
//! - [`FrameError`]: the byte stream did not yield one JSON document
//! - [`ClientError`]: what callers of the connection manager observe
//! - [`CommandError`]: in-band failures, always encoded as an error response
//! - [`ServerError`]: the plug-in listener could not start
//! - [`ConfigError`]: configuration loading and validation

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Terminal outcome of a frame read that produced no document.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The peer closed the connection before sending anything.
    #[error("connection closed by peer before any data was received")]
    Closed,

    /// No complete message arrived within the idle timeout.
    #[error("timed out after {timeout:?} waiting for a complete message ({received} bytes received)")]
    Timeout {
        /// The idle timeout that elapsed.
        timeout: Duration,
        /// Bytes accumulated before the deadline.
        received: usize,
    },

    /// Bytes were received but never formed a valid JSON document.
    #[error("malformed message ({received} bytes): {reason}")]
    Malformed {
        /// Bytes accumulated before the peer closed or the deadline passed.
        received: usize,
        /// Parser diagnostic.
        reason: String,
    },

    /// The message exceeded the byte ceiling and was not parsed.
    #[error("message exceeds the {limit} byte limit")]
    TooLarge {
        /// The configured ceiling.
        limit: usize,
    },

    /// The socket failed while reading.
    #[error("socket error while reading message")]
    Io(#[source] io::Error),
}

/// Errors surfaced to callers of the connection manager.
///
/// An error *response* from the plug-in is not a `ClientError`: it arrives as
/// [`Response::Error`](crate::wire::Response::Error) so callers can tell a
/// missing reply apart from a negative one.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The socket could not be established, is absent, or was lost.
    #[error("connection to {endpoint} failed: {reason}")]
    Connection {
        /// The plug-in endpoint.
        endpoint: String,
        /// What went wrong.
        reason: String,
        /// The underlying IO error, if any.
        #[source]
        source: Option<io::Error>,
    },

    /// No complete response arrived within the deadline.
    #[error("timed out after {timeout:?} waiting for the plug-in at {endpoint}")]
    Timeout {
        /// The plug-in endpoint.
        endpoint: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// Bytes arrived but were not a valid response envelope.
    #[error("invalid response from the plug-in at {endpoint}: {reason}")]
    Malformed {
        /// The plug-in endpoint.
        endpoint: String,
        /// Why the response was rejected.
        reason: String,
    },

    /// The response exceeded the byte ceiling.
    #[error("response from the plug-in at {endpoint} exceeds the {limit} byte limit")]
    Oversize {
        /// The plug-in endpoint.
        endpoint: String,
        /// The configured ceiling.
        limit: usize,
    },
}

impl ClientError {
    /// Creates a connection error without an underlying IO cause.
    #[must_use]
    pub fn not_connected(endpoint: impl Into<String>) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            reason: "not connected; call reconnect first".to_string(),
            source: None,
        }
    }

    /// Classifies a frame failure observed while waiting for a response.
    #[must_use]
    pub fn from_frame(endpoint: &str, error: FrameError) -> Self {
        let endpoint = endpoint.to_string();
        match error {
            FrameError::Closed => Self::Connection {
                endpoint,
                reason: "connection closed before a response was received".to_string(),
                source: None,
            },
            FrameError::Timeout { timeout, .. } => Self::Timeout { endpoint, timeout },
            FrameError::Malformed { reason, .. } => Self::Malformed { endpoint, reason },
            FrameError::TooLarge { limit } => Self::Oversize { endpoint, limit },
            FrameError::Io(source) => Self::Connection {
                endpoint,
                reason: format!("connection lost: {source}"),
                source: Some(source),
            },
        }
    }
}

/// In-band command failures.
///
/// The dispatcher converts every variant into an error response; none of
/// them abort the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The envelope is not a well-formed command.
    #[error("{0}")]
    Structural(String),

    /// A handler rejected its arguments.
    #[error("{0}")]
    Validation(String),

    /// No handler is registered under this name.
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    /// The handler accepted the arguments but the operation failed.
    #[error("{0}")]
    Failed(String),
}

impl CommandError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates an operation failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors that prevent the plug-in listener from starting.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Another process is already listening on the address.
    #[error("address {addr} is already in use; is another plug-in instance running?")]
    AddressInUse {
        /// The contested address.
        addr: SocketAddr,
    },

    /// The configured host did not resolve to an address.
    #[error("could not resolve listen address {endpoint}")]
    Resolve {
        /// The configured `host:port`.
        endpoint: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Binding or listening failed for another reason.
    #[error("failed to bind {addr}")]
    Bind {
        /// The address that could not be bound.
        addr: SocketAddr,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let error = ConfigError::NotFound {
            path: PathBuf::from("/path/to/config.json"),
        };
        let msg = error.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("config.json"));
    }

    #[test]
    fn unknown_operation_echoes_name() {
        let error = CommandError::UnknownOperation("unknown_op".to_string());
        assert_eq!(error.to_string(), "unknown operation 'unknown_op'");
    }

    #[test]
    fn closed_frame_is_a_connection_error() {
        let error = ClientError::from_frame("127.0.0.1:53002", FrameError::Closed);
        assert!(matches!(error, ClientError::Connection { .. }));
    }

    #[test]
    fn frame_errors_keep_their_class() {
        let endpoint = "127.0.0.1:53002";
        let timeout = ClientError::from_frame(
            endpoint,
            FrameError::Timeout {
                timeout: Duration::from_secs(1),
                received: 0,
            },
        );
        assert!(matches!(timeout, ClientError::Timeout { .. }));

        let oversize = ClientError::from_frame(endpoint, FrameError::TooLarge { limit: 16 });
        assert!(matches!(oversize, ClientError::Oversize { limit: 16, .. }));

        let malformed = ClientError::from_frame(
            endpoint,
            FrameError::Malformed {
                received: 3,
                reason: "eof".to_string(),
            },
        );
        assert!(matches!(malformed, ClientError::Malformed { .. }));
    }

    #[test]
    fn address_in_use_names_address() {
        let addr: SocketAddr = "127.0.0.1:53002".parse().unwrap();
        let msg = ServerError::AddressInUse { addr }.to_string();
        assert!(msg.contains("127.0.0.1:53002"));
    }
}
