//! cadwork-mcp: MCP bridge to a running Cadwork 3D plug-in
//!
//! The plug-in side listens on a local TCP port and executes one JSON command
//! per connection against the open model. The bridge side exposes those
//! commands as MCP tools to AI assistants.
//!
//! # Wire protocol
//!
//! A command is a single JSON object, `{"operation": "...", "args": {...}}`,
//! written without a length prefix or delimiter. The reply is a single JSON
//! object with `"status": "ok"` and result fields, or `"status": "error"` and
//! a `"message"`. The listener closes the connection after each reply.
//!
//! # Modules
//!
//! - [`wire`]: command and response envelopes, frame reading
//! - [`dispatch`]: operation registry and validated dispatch
//! - [`host`]: the built-in model operations
//! - [`server`]: the plug-in TCP listener
//! - [`client`]: bridge-side connections to the plug-in
//! - [`mcp`]: MCP protocol implementation
//! - [`config`]: configuration loading and validation
//! - [`error`]: error types

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod mcp;
pub mod server;
pub mod wire;
