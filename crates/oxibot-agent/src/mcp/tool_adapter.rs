//! Wraps one MCP-discovered tool as a native `Tool`, so the agent loop's
//! tool registry can dispatch to it exactly like a built-in tool.
//!
//! Grounded in `original_source/nanobot/agent/mcp/tool_adapter.py`'s
//! `create_tool_adapter`, and in this crate's own `tools::base::Tool`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::base::Tool;

use super::client::McpClient;

/// Name exposed to the LLM for a tool discovered on MCP server `server`
/// named `tool`. Namespaced so identically-named tools on different
/// servers never collide.
pub fn namespaced_tool_name(server: &str, tool: &str) -> String {
    format!("mcp__{server}__{tool}")
}

pub struct McpToolAdapter {
    client: Arc<McpClient>,
    server: String,
    tool: String,
    description: String,
    input_schema: Value,
    name: String,
}

impl McpToolAdapter {
    pub fn new(
        client: Arc<McpClient>,
        server: impl Into<String>,
        tool: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        let server = server.into();
        let tool = tool.into();
        let name = namespaced_tool_name(&server, &tool);
        Self {
            client,
            server,
            tool,
            description: description.into(),
            input_schema,
            name,
        }
    }
}

#[async_trait]
impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.input_schema.clone()
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let args = serde_json::to_value(params)?;
        self.client
            .call_tool(&self.server, &self.tool, args)
            .await
            .map_err(|e| anyhow::anyhow!("MCP tool '{}' on '{}' failed: {e}", self.tool, self.server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_tool_name() {
        assert_eq!(namespaced_tool_name("fs", "read"), "mcp__fs__read");
    }

    #[test]
    fn test_adapter_exposes_schema_and_name() {
        let client = Arc::new(McpClient::new("test-agent"));
        let schema = serde_json::json!({"type": "object", "properties": {"path": {"type": "string"}}});
        let adapter = McpToolAdapter::new(client, "fs", "read", "reads a file", schema.clone());
        assert_eq!(adapter.name(), "mcp__fs__read");
        assert_eq!(adapter.description(), "reads a file");
        assert_eq!(adapter.parameters(), schema);
    }

    #[tokio::test]
    async fn test_execute_errors_when_server_not_connected() {
        let client = Arc::new(McpClient::new("test-agent"));
        let adapter = McpToolAdapter::new(
            client,
            "fs",
            "read",
            "reads a file",
            serde_json::json!({"type": "object"}),
        );
        let result = adapter.execute(HashMap::new()).await;
        assert!(result.is_err());
    }
}
