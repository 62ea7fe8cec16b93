//! Bridge-side connection manager.
//!
//! Two lifecycle strategies share one exchange routine, so a timeout or a
//! malformed reply is classified the same way regardless of strategy:
//!
//! - [`PersistentConnection`] opens a socket on [`connect`] and reuses it.
//!   Any transport failure tears the socket down; nothing reconnects
//!   implicitly.
//! - [`PerCallConnection`] opens a socket for each command and drops it
//!   before returning.
//!
//! [`Connection`] wraps whichever strategy the configuration selects.
//!
//! [`connect`]: PersistentConnection::connect

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, ConnectionMode, DEFAULT_HOST, DEFAULT_PORT};
use crate::error::ClientError;
use crate::wire::frame::DEFAULT_MAX_MESSAGE_BYTES;
use crate::wire::{read_frame, Command, Response};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Address and limits of the plug-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    connect_timeout: Duration,
    timeout: Duration,
    max_message_bytes: usize,
}

impl Endpoint {
    /// Creates an endpoint with the default timeouts and size limit.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            timeout: DEFAULT_TIMEOUT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    /// Builds an endpoint from the `connection` section of the config.
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout(),
            timeout: config.timeout(),
            max_message_bytes: config.max_message_bytes,
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Sets the timeout applied to every write and every read.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the largest accepted response.
    #[must_use]
    pub const fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    /// The plug-in host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The plug-in port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The receive timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn open(&self) -> Result<TcpStream, ClientError> {
        let attempt = TcpStream::connect((self.host.as_str(), self.port));
        match timeout(self.connect_timeout, attempt).await {
            Ok(Ok(stream)) => {
                debug!(endpoint = %self, "Connected to plug-in");
                Ok(stream)
            }
            Ok(Err(source)) => Err(ClientError::Connection {
                endpoint: self.to_string(),
                reason: format!("could not connect: {source}"),
                source: Some(source),
            }),
            Err(_) => Err(ClientError::Connection {
                endpoint: self.to_string(),
                reason: format!("connect timed out after {:?}", self.connect_timeout),
                source: None,
            }),
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Sends one command on `stream` and waits for the reply.
///
/// An error response from the plug-in is `Ok(Response::Error { .. })`.
///
/// # Errors
///
/// Returns a [`ClientError`] if the write fails, no complete reply arrives in
/// time, or the reply is not a valid envelope.
pub async fn exchange<S>(
    stream: &mut S,
    endpoint: &Endpoint,
    command: &Command,
) -> Result<Response, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = command.to_bytes();
    debug!(
        endpoint = %endpoint,
        operation = command.operation(),
        bytes = request.len(),
        "Sending command"
    );

    match timeout(endpoint.timeout, stream.write_all(&request)).await {
        Ok(Ok(())) => {}
        Ok(Err(source)) => {
            return Err(ClientError::Connection {
                endpoint: endpoint.to_string(),
                reason: format!("send failed: {source}"),
                source: Some(source),
            })
        }
        Err(_) => {
            return Err(ClientError::Timeout {
                endpoint: endpoint.to_string(),
                timeout: endpoint.timeout,
            })
        }
    }

    let document = read_frame(stream, endpoint.timeout, endpoint.max_message_bytes)
        .await
        .map_err(|e| ClientError::from_frame(&endpoint.to_string(), e))?;

    Response::from_document(document).map_err(|reason| ClientError::Malformed {
        endpoint: endpoint.to_string(),
        reason,
    })
}

/// Lifecycle of a [`PersistentConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket is held.
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// A socket is open and ready for commands.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// One long-lived socket to the plug-in.
#[derive(Debug)]
pub struct PersistentConnection {
    endpoint: Endpoint,
    stream: Option<TcpStream>,
    state: ConnectionState,
}

impl PersistentConnection {
    /// Creates a disconnected connection.
    #[must_use]
    pub const fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            stream: None,
            state: ConnectionState::Disconnected,
        }
    }

    /// The current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// The plug-in endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Opens the socket. Does nothing if already connected.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connection`] if the plug-in cannot be reached
    /// within the connect timeout.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.stream.is_some() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        match self.endpoint.open().await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = ConnectionState::Connected;
                info!(endpoint = %self.endpoint, "Persistent connection established");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                warn!(endpoint = %self.endpoint, error = %e, "Persistent connection failed");
                Err(e)
            }
        }
    }

    /// Closes the socket, if any.
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "Socket shutdown failed");
            }
            info!(endpoint = %self.endpoint, "Persistent connection closed");
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Drops any existing socket and opens a new one.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connection`] if the new socket cannot be opened.
    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        self.disconnect().await;
        self.connect().await
    }

    /// Sends a command over the held socket.
    ///
    /// Fails fast without a socket. Any transport failure tears the socket
    /// down and leaves the connection [`ConnectionState::Disconnected`].
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if not connected or the exchange fails.
    pub async fn send(&mut self, command: &Command) -> Result<Response, ClientError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ClientError::not_connected(self.endpoint.to_string()));
        };

        match exchange(stream, &self.endpoint, command).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(
                    endpoint = %self.endpoint,
                    error = %e,
                    "Exchange failed, dropping persistent connection"
                );
                self.stream = None;
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }
}

/// A fresh socket for every command.
#[derive(Debug, Clone)]
pub struct PerCallConnection {
    endpoint: Endpoint,
}

impl PerCallConnection {
    /// Creates a per-call connection.
    #[must_use]
    pub const fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// The plug-in endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connects, exchanges one command and closes the socket.
    ///
    /// The socket is closed on every path, including errors.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if connecting or the exchange fails.
    pub async fn send(&self, command: &Command) -> Result<Response, ClientError> {
        let mut stream = self.endpoint.open().await?;
        let result = exchange(&mut stream, &self.endpoint, command).await;
        if result.is_ok() {
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "Socket shutdown failed");
            }
        }
        result
    }
}

/// The strategy selected by configuration.
#[derive(Debug)]
pub enum Connection {
    /// One reused socket.
    Persistent(PersistentConnection),
    /// One socket per command.
    PerCall(PerCallConnection),
}

impl Connection {
    /// Creates a connection for `endpoint` using `mode`.
    ///
    /// A persistent connection starts disconnected; call [`Self::connect`].
    #[must_use]
    pub fn new(endpoint: Endpoint, mode: ConnectionMode) -> Self {
        match mode {
            ConnectionMode::Persistent => Self::Persistent(PersistentConnection::new(endpoint)),
            ConnectionMode::PerCall => Self::PerCall(PerCallConnection::new(endpoint)),
        }
    }

    /// Creates a connection from the `connection` section of the config.
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(Endpoint::from_config(config), config.mode)
    }

    /// The selected lifecycle.
    #[must_use]
    pub const fn mode(&self) -> ConnectionMode {
        match self {
            Self::Persistent(_) => ConnectionMode::Persistent,
            Self::PerCall(_) => ConnectionMode::PerCall,
        }
    }

    /// The plug-in endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        match self {
            Self::Persistent(connection) => connection.endpoint(),
            Self::PerCall(connection) => connection.endpoint(),
        }
    }

    /// Opens the persistent socket. A no-op for per-call connections.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connection`] if the socket cannot be opened.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        match self {
            Self::Persistent(connection) => connection.connect().await,
            Self::PerCall(_) => Ok(()),
        }
    }

    /// Re-establishes the persistent socket.
    ///
    /// For per-call connections this only checks that the plug-in accepts
    /// connections.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connection`] if the plug-in cannot be reached.
    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        match self {
            Self::Persistent(connection) => connection.reconnect().await,
            Self::PerCall(connection) => {
                let mut stream = connection.endpoint.open().await?;
                if let Err(e) = stream.shutdown().await {
                    debug!(error = %e, "Socket shutdown failed");
                }
                Ok(())
            }
        }
    }

    /// Sends one command and waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if no valid reply was received.
    pub async fn send(&mut self, command: &Command) -> Result<Response, ClientError> {
        match self {
            Self::Persistent(connection) => connection.send(command).await,
            Self::PerCall(connection) => connection.send(command).await,
        }
    }

    /// Human-readable connection status.
    #[must_use]
    pub fn status(&self) -> String {
        match self {
            Self::Persistent(connection) => {
                format!("persistent, {} ({})", connection.state(), connection.endpoint())
            }
            Self::PerCall(connection) => format!("per-call ({})", connection.endpoint()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Fields;
    use serde_json::json;
    use tokio_test::io::Builder;

    fn ping() -> Command {
        Command::new("ping", Fields::new()).unwrap()
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("127.0.0.1", 53002).with_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn exchange_returns_ok_response() {
        let command = ping();
        let mut stream = Builder::new()
            .write(&command.to_bytes())
            .read(br#"{"status": "ok", "message": "pong"}"#)
            .build();

        let response = exchange(&mut stream, &endpoint(), &command).await.unwrap();
        assert!(response.is_ok());
        assert_eq!(response.field("message"), Some(&json!("pong")));
    }

    #[tokio::test]
    async fn error_response_is_not_a_client_error() {
        let command = ping();
        let mut stream = Builder::new()
            .write(&command.to_bytes())
            .read(br#"{"status": "error", "message": "unknown operation 'ping'"}"#)
            .build();

        let response = exchange(&mut stream, &endpoint(), &command).await.unwrap();
        assert_eq!(response, Response::error("unknown operation 'ping'"));
    }

    #[tokio::test]
    async fn response_split_across_chunks() {
        let command = ping();
        let mut stream = Builder::new()
            .write(&command.to_bytes())
            .read(br#"{"status": "#)
            .read(br#""ok", "id": 3}"#)
            .build();

        let response = exchange(&mut stream, &endpoint(), &command).await.unwrap();
        assert_eq!(response.field("id"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn envelope_without_status_is_malformed() {
        let command = ping();
        let mut stream = Builder::new()
            .write(&command.to_bytes())
            .read(br#"{"id": 3}"#)
            .build();

        let err = exchange(&mut stream, &endpoint(), &command)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Malformed { .. }));
    }

    #[tokio::test]
    async fn close_without_reply_is_connection_error() {
        let command = ping();
        let mut stream = Builder::new().write(&command.to_bytes()).build();

        let err = exchange(&mut stream, &endpoint(), &command)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Connection { .. }));
    }

    #[tokio::test]
    async fn stalled_reply_is_timeout() {
        let command = ping();
        let mut stream = Builder::new()
            .write(&command.to_bytes())
            .read(br#"{"status": "#)
            .wait(Duration::from_secs(2))
            .build();

        let err = exchange(&mut stream, &endpoint(), &command)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }));
    }

    #[tokio::test]
    async fn oversized_reply_is_rejected() {
        let command = ping();
        let endpoint = endpoint().with_max_message_bytes(16);
        let mut stream = Builder::new()
            .write(&command.to_bytes())
            .read(br#"{"status": "ok", "padding": "0123456789"}"#)
            .build();

        let err = exchange(&mut stream, &endpoint, &command)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Oversize { limit: 16, .. }));
    }

    #[tokio::test]
    async fn persistent_send_without_socket_fails_fast() {
        let mut connection = PersistentConnection::new(endpoint());
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        let err = connection.send(&ping()).await.unwrap_err();
        assert!(matches!(err, ClientError::Connection { .. }));
        assert!(err.to_string().contains("reconnect"));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut connection = Connection::new(
            Endpoint::new("127.0.0.1", port),
            ConnectionMode::Persistent,
        );
        let err = connection.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Connection { .. }));
        assert!(connection.status().starts_with("persistent, disconnected"));
    }

    #[test]
    fn mode_selects_strategy() {
        let per_call = Connection::new(endpoint(), ConnectionMode::PerCall);
        assert_eq!(per_call.mode(), ConnectionMode::PerCall);

        let config = ConnectionConfig {
            mode: ConnectionMode::Persistent,
            port: 2000,
            ..ConnectionConfig::default()
        };
        let persistent = Connection::from_config(&config);
        assert_eq!(persistent.mode(), ConnectionMode::Persistent);
        assert_eq!(persistent.endpoint().port(), 2000);
        assert_eq!(persistent.endpoint().to_string(), "127.0.0.1:2000");
    }
}
