//! Model Context Protocol (MCP) front-end.
//!
//! Exposes the Cadwork plug-in operations as MCP tools. The server talks to
//! the MCP client over stdio using JSON-RPC 2.0 messages and forwards each
//! tool call to the plug-in through a [`Connection`](crate::client::Connection).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  JSON-RPC   ┌──────────────┐  JSON/TCP   ┌──────────────┐
//! │  MCP client  │────────────▶│  McpServer   │────────────▶│  Cadwork     │
//! │  (stdio)     │◀────────────│  (lifecycle) │◀────────────│  plug-in     │
//! └──────────────┘             └──────────────┘             └──────────────┘
//! ```
//!
//! # Protocol Version
//!
//! This implementation targets MCP protocol version 2024-11-05.

pub mod protocol;
pub mod server;
pub mod transport;

pub use protocol::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, OutgoingMessage, MCP_PROTOCOL_VERSION,
};
pub use server::{McpServer, ServerState, Tool, ToolCallResult};
pub use transport::{LineTransport, StdioTransport};
