//! MCP client — owns a transport per configured server, tracks discovered
//! tools/resources, and reconnects on failure.
//!
//! Grounded in `original_source/nanobot/agent/mcp/client.py`. Where the
//! original keeps one `asyncio.Lock` per server plus module-level dicts,
//! this keeps a single `Mutex<ClientState>` — simpler to reason about at
//! the cost of one shared lock for all servers, acceptable at this scale.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::transports::{coerce_content, McpTransport, SseTransport, StdioTransport};
use super::types::{McpServerConfig, McpTransportKind};

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
const RECONNECT_MAX_ATTEMPTS: u32 = 5;
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// One tool as discovered from a server's `tools/list` response.
#[derive(Clone, Debug)]
pub struct McpToolInfo {
    pub server: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One resource as discovered from a server's `resources/list` response.
#[derive(Clone, Debug)]
pub struct McpResourceInfo {
    pub server: String,
    pub uri: String,
    pub name: String,
    pub description: String,
}

struct ServerState {
    config: McpServerConfig,
    transport: Arc<dyn McpTransport>,
    tools: Vec<McpToolInfo>,
    resources: Vec<McpResourceInfo>,
    connected: bool,
}

#[derive(Default)]
struct ClientState {
    servers: HashMap<String, ServerState>,
}

/// Owns every configured MCP server connection for one agent.
pub struct McpClient {
    client_name: String,
    state: Mutex<ClientState>,
}

impl McpClient {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Connect to every enabled server, skipping (and logging) any that fail.
    pub async fn connect_all(&self, servers: &[McpServerConfig]) {
        for config in servers {
            if !config.enabled {
                continue;
            }
            if let Err(e) = self.connect(config.clone()).await {
                warn!(server = %config.name, error = %e, "failed to connect MCP server");
            }
        }
    }

    pub async fn connect(&self, config: McpServerConfig) -> Result<(), String> {
        // Idempotent: a no-op if this server is already connected under the
        // lock, so callers don't leak a transport by connecting twice.
        {
            let state = self.state.lock().await;
            if state
                .servers
                .get(&config.name)
                .is_some_and(|s| s.connected)
            {
                return Ok(());
            }
        }

        let transport: Arc<dyn McpTransport> = match config.transport {
            McpTransportKind::Stdio => {
                let t = StdioTransport::new(self.client_name.clone());
                t.start(&config.command, &config.args, &config.env).await?;
                Arc::new(t)
            }
            McpTransportKind::Sse => {
                let t = SseTransport::new(&config.url, config.timeout_s)?;
                t.start().await?;
                Arc::new(t)
            }
        };

        let tools = list_tools(&transport, &config.name).await.unwrap_or_default();
        let resources = list_resources(&transport, &config.name).await.unwrap_or_default();

        info!(
            server = %config.name,
            tools = tools.len(),
            resources = resources.len(),
            "connected MCP server"
        );

        let mut state = self.state.lock().await;
        state.servers.insert(
            config.name.clone(),
            ServerState {
                config,
                transport,
                tools,
                resources,
                connected: true,
            },
        );
        Ok(())
    }

    pub async fn disconnect(&self, name: &str) {
        let mut state = self.state.lock().await;
        if let Some(server) = state.servers.remove(name) {
            server.transport.stop().await;
        }
    }

    pub async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;
        for (_, server) in state.servers.drain() {
            server.transport.stop().await;
        }
    }

    /// Names of currently connected servers, for `ContextBuilder::set_mcp_connected`.
    pub async fn connected_server_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .servers
            .values()
            .filter(|s| s.connected)
            .map(|s| s.config.name.clone())
            .collect()
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        let state = self.state.lock().await;
        state.servers.get(name).map(|s| s.connected).unwrap_or(false)
    }

    pub async fn list_all_tools(&self) -> Vec<McpToolInfo> {
        let state = self.state.lock().await;
        state.servers.values().flat_map(|s| s.tools.clone()).collect()
    }

    pub async fn list_all_resources(&self) -> Vec<McpResourceInfo> {
        let state = self.state.lock().await;
        state.servers.values().flat_map(|s| s.resources.clone()).collect()
    }

    /// Invoke `tools/call` on the named server's transport and coerce the
    /// result content into a single display string.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        args: Value,
    ) -> Result<String, String> {
        let transport = {
            let state = self.state.lock().await;
            state
                .servers
                .get(server)
                .ok_or_else(|| format!("MCP server '{server}' is not connected"))?
                .transport
                .clone()
        };

        let result = transport
            .call("tools/call", serde_json::json!({"name": tool, "arguments": args}))
            .await?;

        let content = result
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(coerce_content(&content))
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<String, String> {
        let transport = {
            let state = self.state.lock().await;
            state
                .servers
                .get(server)
                .ok_or_else(|| format!("MCP server '{server}' is not connected"))?
                .transport
                .clone()
        };
        let result = transport
            .call("resources/read", serde_json::json!({"uri": uri}))
            .await?;
        let content = result
            .get("contents")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(coerce_content(&content))
    }

    /// Runs until cancelled: periodically pings each server and reconnects
    /// with exponential backoff on failure.
    pub async fn run_health_check(self: &Arc<Self>) {
        loop {
            sleep(HEALTH_CHECK_INTERVAL).await;
            let names: Vec<String> = {
                let state = self.state.lock().await;
                state.servers.keys().cloned().collect()
            };
            for name in names {
                self.check_and_reconnect(&name).await;
            }
        }
    }

    async fn check_and_reconnect(&self, name: &str) {
        let running = {
            let state = self.state.lock().await;
            state.servers.get(name).map(|s| s.transport.is_running())
        };
        let Some(running) = running else { return };
        if running {
            return;
        }

        warn!(server = %name, "MCP server transport is down, attempting reconnect");
        let config = {
            let mut state = self.state.lock().await;
            state.servers.remove(name).map(|s| s.config)
        };
        let Some(config) = config else { return };

        let mut attempt = 0;
        loop {
            match self.connect(config.clone()).await {
                Ok(()) => {
                    info!(server = %name, attempt, "reconnected MCP server");
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= RECONNECT_MAX_ATTEMPTS {
                        error!(server = %name, error = %e, "giving up reconnecting MCP server");
                        return;
                    }
                    let delay = std::cmp::min(
                        RECONNECT_BASE_DELAY * 2u32.pow(attempt - 1),
                        RECONNECT_MAX_DELAY,
                    );
                    warn!(server = %name, attempt, delay_s = delay.as_secs(), error = %e, "MCP reconnect failed, retrying");
                    sleep(delay).await;
                }
            }
        }
    }
}

async fn list_tools(
    transport: &Arc<dyn McpTransport>,
    server: &str,
) -> Result<Vec<McpToolInfo>, String> {
    let result = transport.call("tools/list", Value::Object(Default::default())).await?;
    let tools = result
        .get("tools")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    Ok(tools
        .into_iter()
        .filter_map(|t| {
            Some(McpToolInfo {
                server: server.to_string(),
                name: t.get("name")?.as_str()?.to_string(),
                description: t
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                input_schema: t
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
            })
        })
        .collect())
}

async fn list_resources(
    transport: &Arc<dyn McpTransport>,
    server: &str,
) -> Result<Vec<McpResourceInfo>, String> {
    let result = transport
        .call("resources/list", Value::Object(Default::default()))
        .await?;
    let resources = result
        .get("resources")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    Ok(resources
        .into_iter()
        .filter_map(|r| {
            Some(McpResourceInfo {
                server: server.to_string(),
                uri: r.get("uri")?.as_str()?.to_string(),
                name: r.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
                description: r
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A transport that never touches a real process — lets us test
    /// `McpClient` bookkeeping (idempotency, disconnect) without spawning one.
    struct CountingTransport {
        connects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl McpTransport for CountingTransport {
        async fn call(&self, _method: &str, _params: Value) -> Result<Value, String> {
            Ok(Value::Null)
        }
        fn is_running(&self) -> bool {
            true
        }
        async fn stop(&self) {}
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_for_already_connected_server() {
        let client = McpClient::new("test-agent");
        let connects = Arc::new(AtomicUsize::new(0));

        let mut state = client.state.lock().await;
        connects.fetch_add(1, Ordering::SeqCst);
        state.servers.insert(
            "already".to_string(),
            ServerState {
                config: {
                    let mut c = McpServerConfig::default();
                    c.name = "already".to_string();
                    c
                },
                transport: Arc::new(CountingTransport { connects: connects.clone() }),
                tools: Vec::new(),
                resources: Vec::new(),
                connected: true,
            },
        );
        drop(state);

        let mut config = McpServerConfig::default();
        config.name = "already".to_string();
        let result = client.connect(config).await;

        assert!(result.is_ok());
        assert_eq!(connects.load(Ordering::SeqCst), 1, "connect() spawned a second transport");
        assert_eq!(client.connected_server_names().await.len(), 1);
    }

    #[tokio::test]
    async fn test_new_client_has_no_connected_servers() {
        let client = McpClient::new("test-agent");
        assert!(client.connected_server_names().await.is_empty());
        assert!(!client.is_connected("missing").await);
    }

    #[tokio::test]
    async fn test_call_tool_missing_server_errors() {
        let client = McpClient::new("test-agent");
        let result = client.call_tool("missing", "x", Value::Null).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_all_skips_disabled_servers() {
        let client = McpClient::new("test-agent");
        let mut config = McpServerConfig::default();
        config.name = "disabled".to_string();
        config.enabled = false;
        client.connect_all(&[config]).await;
        assert!(client.connected_server_names().await.is_empty());
    }
}
