//! scribe-mcp: the task tool server and the clients that call it
//!
//! Newline-delimited JSON-RPC 2.0 in the MCP style: `initialize`, the
//! `notifications/initialized` notification, then `tools/list` and
//! `tools/call`.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{
    EmbeddedToolClient, McpSession, PooledToolClient, ServerCommand, StdioToolClient,
    ToolServerTarget, DEFAULT_TIMEOUT,
};
pub use protocol::{
    CallToolResult, JsonRpcRequest, JsonRpcResponse, ToolDescriptor, PROTOCOL_VERSION,
};
pub use server::TaskToolServer;
