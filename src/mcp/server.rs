//! MCP server that forwards tool calls to the Cadwork plug-in.
//!
//! This module implements the MCP server lifecycle:
//!
//! 1. **Initialisation**: Capability negotiation and version agreement
//! 2. **Operation**: Handling tool calls and other requests
//! 3. **Shutdown**: Graceful connection termination
//!
//! Every plug-in tool validates its arguments locally, translates them into
//! one [`Command`] and sends it through the owned [`Connection`]. Transport
//! failures and error responses both come back as `isError` tool results;
//! only protocol misuse produces JSON-RPC errors.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::client::Connection;
use crate::config::ConnectionMode;
use crate::error::ClientError;
use crate::host::{self, Operation};
use crate::mcp::protocol::{
    parse_message, IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, OutgoingMessage, RequestId, MCP_PROTOCOL_VERSION, SERVER_NAME,
};
use crate::mcp::transport::{LineTransport, StdioTransport};
use crate::wire::{Command, Fields, Response};

/// Server state in the MCP lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for initialize request.
    AwaitingInit,
    /// Initialize received, waiting for initialized notification.
    Initialising,
    /// Ready for normal operation.
    Running,
    /// Shutdown in progress.
    ShuttingDown,
}

/// Server capabilities advertised during initialisation.
#[derive(Debug, Clone, Serialize)]
pub struct ServerCapabilities {
    /// Tool-related capabilities.
    pub tools: ToolCapabilities,
}

/// Tool-specific capabilities.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolCapabilities {
    /// Whether the tool list can change during the session.
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Server information for initialisation response.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: &'static str,
    /// Server version.
    pub version: &'static str,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: SERVER_NAME,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Client information received during initialisation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version.
    #[serde(default)]
    pub version: Option<String>,
}

/// Parameters for the initialize request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol version requested by client.
    pub protocol_version: String,
    /// Client capabilities.
    #[serde(default)]
    pub capabilities: Value,
    /// Client information.
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
}

/// A tool definition for tools/list response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// JSON Schema for the tool's input parameters.
    pub input_schema: Value,
}

/// Parameters for tools/call request.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    /// Name of the tool to call.
    pub name: String,
    /// Arguments for the tool.
    #[serde(default)]
    pub arguments: Value,
}

/// Content item in a tool call response.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    /// Text content.
    Text {
        /// The text content.
        text: String,
    },
}

/// Result of a tool call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// Content returned by the tool.
    pub content: Vec<ToolContent>,
    /// Whether the tool call resulted in an error.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Creates a successful text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Creates an error text result.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            is_error: true,
        }
    }

    /// The text of the first content item.
    #[must_use]
    pub fn first_text(&self) -> &str {
        self.content.first().map_or("", |ToolContent::Text { text }| text.as_str())
    }
}

/// Tools exposed to the MCP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    /// Host and plug-in version numbers.
    GetVersionInfo,
    /// File name of the open model.
    GetModelName,
    /// Creates a rectangular beam.
    CreateBeam,
    /// Ids of all elements.
    ListElements,
    /// Attributes of one element.
    GetElementInfo,
    /// Round trip to the plug-in.
    Ping,
    /// Re-establishes the plug-in connection.
    Reconnect,
}

impl Tool {
    /// Every tool, in listing order.
    pub const ALL: [Self; 7] = [
        Self::GetVersionInfo,
        Self::GetModelName,
        Self::CreateBeam,
        Self::ListElements,
        Self::GetElementInfo,
        Self::Ping,
        Self::Reconnect,
    ];

    /// The MCP tool name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GetVersionInfo => "get_cadwork_version_info",
            Self::GetModelName => "get_model_name",
            Self::CreateBeam => "create_beam",
            Self::ListElements => "list_elements",
            Self::GetElementInfo => "get_element_info",
            Self::Ping => "ping_cadwork",
            Self::Reconnect => "reconnect_cadwork",
        }
    }

    /// Looks a tool up by MCP name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    /// The plug-in operation this tool forwards to, if any.
    #[must_use]
    pub const fn operation(self) -> Option<Operation> {
        match self {
            Self::GetVersionInfo => Some(Operation::GetVersionInfo),
            Self::GetModelName => Some(Operation::GetModelName),
            Self::CreateBeam => Some(Operation::CreateBeam),
            Self::ListElements => Some(Operation::ListElements),
            Self::GetElementInfo => Some(Operation::GetElementInfo),
            Self::Ping => Some(Operation::Ping),
            Self::Reconnect => None,
        }
    }

    /// The tools/list entry.
    #[must_use]
    pub fn definition(self) -> ToolDefinition {
        let (description, input_schema) = match self {
            Self::GetVersionInfo => (
                "Retrieves version information from the connected Cadwork plug-in: the \
                 Cadwork major version (cw_version) and the plug-in version.",
                no_arguments(),
            ),
            Self::GetModelName => (
                "Returns the file name of the model open in Cadwork, or '(unsaved model)' \
                 if it was never saved.",
                no_arguments(),
            ),
            Self::CreateBeam => (
                "Creates a rectangular beam in Cadwork. The beam axis runs from p1 to p2; \
                 p3 fixes the direction of the height and defaults to the point 1 unit \
                 above p1. Coordinates and dimensions are in millimetres. Returns the new \
                 element ID.",
                json!({
                    "type": "object",
                    "properties": {
                        "p1": point_schema("Start point of the beam axis [x, y, z]"),
                        "p2": point_schema("End point of the beam axis [x, y, z]"),
                        "p3": point_schema(
                            "Optional orientation point [x, y, z]; defaults to p1 + [0, 0, 1]"
                        ),
                        "width": {
                            "type": "number",
                            "exclusiveMinimum": 0,
                            "description": "Cross-section width in mm"
                        },
                        "height": {
                            "type": "number",
                            "exclusiveMinimum": 0,
                            "description": "Cross-section height in mm"
                        },
                        "name": {
                            "type": "string",
                            "description": "Optional element name"
                        }
                    },
                    "required": ["p1", "p2", "width", "height"]
                }),
            ),
            Self::ListElements => (
                "Lists the IDs of all elements in the open Cadwork model.",
                no_arguments(),
            ),
            Self::GetElementInfo => (
                "Returns the attributes of one element: type, name, cross-section, length \
                 and axis points.",
                json!({
                    "type": "object",
                    "properties": {
                        "element_id": {
                            "type": "integer",
                            "minimum": 0,
                            "description": "ID returned by create_beam or list_elements"
                        }
                    },
                    "required": ["element_id"]
                }),
            ),
            Self::Ping => (
                "Checks that the Cadwork plug-in is reachable and answering commands.",
                no_arguments(),
            ),
            Self::Reconnect => (
                "Drops the current connection to the Cadwork plug-in and opens a new one. \
                 Use this after the plug-in was restarted or a command failed with a \
                 connection error.",
                no_arguments(),
            ),
        };

        ToolDefinition {
            name: self.name(),
            description,
            input_schema,
        }
    }
}

fn no_arguments() -> Value {
    json!({ "type": "object", "properties": {} })
}

fn point_schema(description: &str) -> Value {
    json!({
        "type": "array",
        "items": { "type": "number" },
        "minItems": 3,
        "maxItems": 3,
        "description": description
    })
}

/// The MCP server bridging tool calls to the Cadwork plug-in.
#[derive(Debug)]
pub struct McpServer {
    /// Current server state.
    state: ServerState,
    /// Negotiated protocol version (set after initialisation).
    protocol_version: Option<String>,
    /// Connection to the plug-in.
    connection: Connection,
}

impl McpServer {
    /// Creates a server that forwards tool calls over `connection`.
    #[must_use]
    pub const fn new(connection: Connection) -> Self {
        Self {
            state: ServerState::AwaitingInit,
            protocol_version: None,
            connection,
        }
    }

    /// Returns the current server state.
    #[must_use]
    pub const fn state(&self) -> ServerState {
        self.state
    }

    /// The negotiated protocol version, once initialised.
    #[must_use]
    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// The plug-in connection.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Checks that the plug-in is reachable.
    ///
    /// A persistent connection only opens its socket, since the plug-in
    /// closes a connection after one reply. A per-call connection sends
    /// `ping`. Failure is logged as a warning; tools keep failing with
    /// connection errors until the plug-in is reachable.
    pub async fn handshake(&mut self) -> bool {
        let endpoint = self.connection.endpoint().to_string();
        info!(endpoint = %endpoint, mode = ?self.connection.mode(), "Contacting Cadwork plug-in");

        if let Err(e) = self.connection.connect().await {
            warn!(endpoint = %endpoint, error = %e, "Cadwork plug-in is not reachable yet");
            return false;
        }
        if self.connection.mode() == ConnectionMode::Persistent {
            info!(endpoint = %endpoint, "Connected to Cadwork plug-in");
            return true;
        }

        match self.send(Operation::Ping, Fields::new()).await {
            Ok(response) if response.is_ok() => {
                info!(endpoint = %endpoint, "Cadwork plug-in answered ping");
                true
            }
            Ok(response) => {
                warn!(
                    endpoint = %endpoint,
                    message = response.message().unwrap_or_default(),
                    "Cadwork plug-in rejected ping"
                );
                false
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Cadwork plug-in is not reachable yet");
                false
            }
        }
    }

    /// Runs the server on stdio until stdin closes or a shutdown signal
    /// arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if transport I/O fails.
    pub async fn run(&mut self) -> io::Result<()> {
        let mut transport = StdioTransport::stdio();
        self.run_with_shutdown(&mut transport).await
    }

    /// Serves `transport` until its input closes.
    ///
    /// # Errors
    ///
    /// Returns an error if transport I/O fails.
    pub async fn serve<R, W>(&mut self, transport: &mut LineTransport<R, W>) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let line = transport.read_line().await;
            if self.handle_transport_result(transport, line).await? {
                return Ok(());
            }
        }
    }

    /// Runs the main loop and handles shutdown.
    #[cfg(unix)]
    async fn run_with_shutdown(&mut self, transport: &mut StdioTransport) -> io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                    self.state = ServerState::ShuttingDown;
                    return Ok(());
                }

                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    self.state = ServerState::ShuttingDown;
                    return Ok(());
                }

                line = transport.read_line() => {
                    if self.handle_transport_result(transport, line).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Runs the main loop and handles shutdown.
    #[cfg(windows)]
    async fn run_with_shutdown(&mut self, transport: &mut StdioTransport) -> io::Result<()> {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                    self.state = ServerState::ShuttingDown;
                    return Ok(());
                }

                line = transport.read_line() => {
                    if self.handle_transport_result(transport, line).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Handles the result from transport read.
    ///
    /// Returns `true` if the server should shut down.
    async fn handle_transport_result<R, W>(
        &mut self,
        transport: &mut LineTransport<R, W>,
        line: io::Result<Option<String>>,
    ) -> io::Result<bool>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Some(line) = line? else {
            debug!("MCP input closed");
            self.state = ServerState::ShuttingDown;
            return Ok(true);
        };

        if line.trim().is_empty() {
            return Ok(false);
        }

        if let Some(reply) = self.handle_line(&line).await {
            transport.write_message(&reply).await?;
        }

        Ok(self.state == ServerState::ShuttingDown)
    }

    /// Handles one line of input and returns the reply, if any.
    ///
    /// Notifications produce no reply.
    pub async fn handle_line(&mut self, line: &str) -> Option<OutgoingMessage> {
        match parse_message(line) {
            Ok(IncomingMessage::Request(req)) => Some(self.handle_request(req).await),
            Ok(IncomingMessage::Notification(notif)) => {
                self.handle_notification(&notif);
                None
            }
            Err(error) => Some(error.into()),
        }
    }

    /// Handles an incoming request.
    async fn handle_request(&mut self, req: JsonRpcRequest) -> OutgoingMessage {
        debug!(id = %req.id, method = %req.method, "MCP request");
        let result = match req.method.as_str() {
            "initialize" => self.handle_initialize(&req),
            "tools/list" => self.handle_tools_list(&req),
            "tools/call" => self.handle_tools_call(&req).await,
            "ping" => Ok(JsonRpcResponse::success(req.id.clone(), json!({}))),
            _ => Err(JsonRpcError::method_not_found(req.id.clone(), &req.method)),
        };
        result.into()
    }

    /// Handles an incoming notification.
    fn handle_notification(&mut self, notif: &JsonRpcNotification) {
        if notif.method == "notifications/initialized" && self.state == ServerState::Initialising {
            info!("MCP session initialised");
            self.state = ServerState::Running;
        }
    }

    /// Handles the initialize request.
    fn handle_initialize(&mut self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, JsonRpcError> {
        if self.state != ServerState::AwaitingInit {
            return Err(JsonRpcError::wrong_state(
                req.id.clone(),
                "Server already initialised",
            ));
        }

        let params: InitializeParams = req.parse_params("initialize")?;
        if let Some(client) = &params.client_info {
            info!(
                client = %client.name,
                version = client.version.as_deref().unwrap_or("unknown"),
                requested = %params.protocol_version,
                "MCP client connected"
            );
        }

        self.protocol_version = Some(MCP_PROTOCOL_VERSION.to_string());
        self.state = ServerState::Initialising;

        let result = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": ServerCapabilities {
                tools: ToolCapabilities::default(),
            },
            "serverInfo": ServerInfo::default(),
        });

        Ok(JsonRpcResponse::success(req.id.clone(), result))
    }

    /// Handles the tools/list request.
    fn handle_tools_list(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, JsonRpcError> {
        self.require_running(&req.id)?;
        Ok(JsonRpcResponse::success(
            req.id.clone(),
            json!({ "tools": Self::tool_definitions() }),
        ))
    }

    /// Handles the tools/call request.
    async fn handle_tools_call(
        &mut self,
        req: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, JsonRpcError> {
        self.require_running(&req.id)?;
        let params: ToolCallParams = req.parse_params("tool call")?;

        let result = match Tool::from_name(&params.name) {
            Some(tool) => self.call_tool(tool, &params.arguments).await,
            None => ToolCallResult::error(format!("Unknown tool: {}", params.name)),
        };

        let value = serde_json::to_value(&result).map_err(|e| {
            tracing::error!(error = %e, "Failed to serialise tool call result");
            JsonRpcError::internal_error(
                req.id.clone(),
                "Internal error: failed to serialise result",
            )
        })?;

        Ok(JsonRpcResponse::success(req.id.clone(), value))
    }

    /// Ensures the server is in the Running state.
    fn require_running(&self, id: &RequestId) -> Result<(), JsonRpcError> {
        if self.state != ServerState::Running {
            return Err(JsonRpcError::wrong_state(id.clone(), "Server not initialised"));
        }
        Ok(())
    }

    /// Returns the list of available tools.
    #[must_use]
    pub fn tool_definitions() -> Vec<ToolDefinition> {
        Tool::ALL.into_iter().map(Tool::definition).collect()
    }

    /// Runs one tool.
    pub async fn call_tool(&mut self, tool: Tool, arguments: &Value) -> ToolCallResult {
        info!(tool = tool.name(), "Tool called");

        let args = match arguments {
            Value::Null => Fields::new(),
            Value::Object(map) => map.clone(),
            other => {
                return ToolCallResult::error(format!(
                    "Tool arguments must be a JSON object, got {other}"
                ))
            }
        };

        match tool {
            Tool::Reconnect => self.call_reconnect().await,
            Tool::CreateBeam => match host::parse_beam(&args) {
                Ok(beam) => self.forward(Operation::CreateBeam, beam.to_args()).await,
                Err(e) => ToolCallResult::error(format!("Invalid create_beam arguments: {e}")),
            },
            Tool::GetElementInfo => match host::element_id(&args) {
                Ok(id) => {
                    let mut forwarded = Fields::new();
                    forwarded.insert("element_id".to_string(), json!(id));
                    self.forward(Operation::GetElementInfo, forwarded).await
                }
                Err(e) => ToolCallResult::error(format!("Invalid get_element_info arguments: {e}")),
            },
            Tool::GetVersionInfo => self.forward(Operation::GetVersionInfo, Fields::new()).await,
            Tool::GetModelName => self.forward(Operation::GetModelName, Fields::new()).await,
            Tool::ListElements => self.forward(Operation::ListElements, Fields::new()).await,
            Tool::Ping => self.forward(Operation::Ping, Fields::new()).await,
        }
    }

    async fn call_reconnect(&mut self) -> ToolCallResult {
        if let Err(e) = self.connection.reconnect().await {
            return self.client_failure(Operation::Ping, &e);
        }
        // The fresh persistent socket is left for the next command.
        if self.connection.mode() == ConnectionMode::Persistent {
            return self.reconnected();
        }
        match self.send(Operation::Ping, Fields::new()).await {
            Ok(response) if response.is_ok() => self.reconnected(),
            Ok(response) => plugin_error(Operation::Ping, &response),
            Err(e) => self.client_failure(Operation::Ping, &e),
        }
    }

    fn reconnected(&self) -> ToolCallResult {
        ToolCallResult::text(format!(
            "Reconnected to the Cadwork plug-in ({})",
            self.connection.status()
        ))
    }

    async fn send(&mut self, operation: Operation, args: Fields) -> Result<Response, ClientError> {
        let command = Command::new(operation.name(), args).map_err(|e| ClientError::Malformed {
            endpoint: self.connection.endpoint().to_string(),
            reason: e.to_string(),
        })?;
        self.connection.send(&command).await
    }

    async fn forward(&mut self, operation: Operation, args: Fields) -> ToolCallResult {
        match self.send(operation, args).await {
            Ok(response) if response.is_ok() => {
                info!(operation = operation.name(), "Plug-in command succeeded");
                match serde_json::to_string_pretty(&response.to_value()) {
                    Ok(text) => ToolCallResult::text(text),
                    Err(e) => ToolCallResult::error(format!("Failed to render response: {e}")),
                }
            }
            Ok(response) => plugin_error(operation, &response),
            Err(e) => self.client_failure(operation, &e),
        }
    }

    fn client_failure(&self, operation: Operation, error: &ClientError) -> ToolCallResult {
        warn!(operation = operation.name(), error = %error, "Plug-in command failed");
        let mut message = match error {
            ClientError::Connection { .. } => {
                format!("Failed to connect to Cadwork plug-in: {error}")
            }
            ClientError::Timeout { .. } => {
                format!("Timeout communicating with Cadwork plug-in: {error}")
            }
            ClientError::Malformed { .. } | ClientError::Oversize { .. } => {
                format!("Invalid response from Cadwork plug-in: {error}")
            }
        };
        if self.connection.mode() == ConnectionMode::Persistent {
            message.push_str(". Use the reconnect_cadwork tool once the plug-in is running.");
        }
        ToolCallResult::error(message)
    }
}

fn plugin_error(operation: Operation, response: &Response) -> ToolCallResult {
    let message = response.message().unwrap_or("plug-in returned an error status");
    warn!(operation = operation.name(), message = %message, "Plug-in reported an error");
    ToolCallResult::error(format!("Cadwork plug-in reported an error: {message}"))
}
