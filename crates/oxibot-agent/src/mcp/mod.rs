//! Model Context Protocol client.
//!
//! Connects to operator-configured MCP servers (stdio subprocess or SSE),
//! discovers their tools and resources, and exposes both to the rest of
//! the agent: tools as `Tool` instances registered into the
//! `ToolRegistry`, resources via `McpClient::read_resource`.
//!
//! Grounded in `original_source/nanobot/agent/mcp/{client,transports,tool_adapter}.py`.

pub mod client;
pub mod tool_adapter;
pub mod transports;
pub mod types;

pub use client::{McpClient, McpResourceInfo, McpToolInfo};
pub use tool_adapter::McpToolAdapter;
pub use transports::{coerce_content, McpTransport, SseTransport, StdioTransport};
pub use types::{McpContentBlock, McpServerConfig, McpTransportKind};
