//! Agent loop — the LLM ↔ tool-calling main loop.
//!
//! Port of nanobot's `agent/loop.py`.
//! Receives inbound messages, builds context, calls the LLM, dispatches
//! tool calls, and publishes outbound responses.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info};

use oxibot_core::bus::queue::MessageBus;
use oxibot_core::bus::types::{InboundMessage, OutboundMessage};
use oxibot_core::session::manager::SessionManager;
use oxibot_core::types::{Message, ToolCall};
use oxibot_providers::traits::{LlmProvider, LlmRequestConfig};

use oxibot_core::config::SummaryConfig;

use crate::context::ContextBuilder;
use crate::mcp::{McpClient, McpServerConfig, McpToolAdapter};
use crate::summary::Summarizer;
use crate::tools::message::MessageTool;
use crate::tools::registry::ToolRegistry;
use crate::tools::cron::CronTool;
use crate::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::shell::ExecTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};

/// Default maximum LLM ↔ tool iterations per user message.
const DEFAULT_MAX_ITERATIONS: usize = 20;

/// Configuration for the exec tool.
#[derive(Clone, Debug)]
pub struct ExecToolConfig {
    /// Timeout in seconds (default 60).
    pub timeout: u64,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self { timeout: 60 }
    }
}

/// Result of `AgentLoop::reload_context`: skill identifiers that changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SkillsDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

// ─────────────────────────────────────────────
// AgentLoop
// ─────────────────────────────────────────────

/// The main agent loop: polls the message bus, calls the LLM, dispatches tools.
pub struct AgentLoop {
    /// Message bus for inbound/outbound messages.
    bus: Arc<MessageBus>,
    /// LLM provider.
    provider: Arc<dyn LlmProvider>,
    /// Workspace root.
    workspace: PathBuf,
    /// Model to use (overrides provider default if set).
    model: String,
    /// Max LLM ↔ tool iterations per message.
    max_iterations: usize,
    /// LLM request config (temperature, max_tokens).
    request_config: LlmRequestConfig,
    /// Tool registry.
    tools: ToolRegistry,
    /// Context builder.
    context: ContextBuilder,
    /// Session manager.
    sessions: SessionManager,
    /// Reference to the message tool (for set_context).
    message_tool: Arc<MessageTool>,
    /// Agent display name (kept to rebuild `ContextBuilder` on reload).
    agent_name: String,
    /// MCP client — owns connections to operator-configured MCP servers.
    mcp_client: Arc<McpClient>,
}

impl AgentLoop {
    /// Create a new agent loop.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn LlmProvider>,
        workspace: PathBuf,
        model: Option<String>,
        max_iterations: Option<usize>,
        request_config: Option<LlmRequestConfig>,
        brave_api_key: Option<String>,
        exec_config: Option<ExecToolConfig>,
        restrict_to_workspace: bool,
        session_manager: Option<SessionManager>,
        agent_name: Option<String>,
        summary_config: Option<SummaryConfig>,
    ) -> Self {
        let model = model.unwrap_or_else(|| provider.default_model().to_string());
        let max_iterations = max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
        let request_config = request_config.unwrap_or_default();
        let exec_config = exec_config.unwrap_or_default();
        let agent_name = agent_name.unwrap_or_else(|| "Oxibot".into());
        let sessions =
            session_manager.unwrap_or_else(|| SessionManager::new(None).expect("failed to create session manager"));

        let mut context = ContextBuilder::new(&workspace, &agent_name);
        let summary_config = summary_config.unwrap_or_default();
        if summary_config.enabled {
            let summarizer_model = if summary_config.model.is_empty() {
                model.clone()
            } else {
                summary_config.model.clone()
            };
            let summarizer = Arc::new(Summarizer::new(provider.clone(), summarizer_model));
            context = context.with_summarizer(summarizer, summary_config);
        }

        // Build tool registry
        let mut tools = ToolRegistry::new();
        let allowed_dir = if restrict_to_workspace {
            Some(workspace.clone())
        } else {
            None
        };

        tools.register(Arc::new(ReadFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(WriteFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(EditFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(ListDirTool::new(allowed_dir)));
        tools.register(Arc::new(ExecTool::new(
            workspace.clone(),
            Some(exec_config.timeout),
            restrict_to_workspace,
        )));
        tools.register(Arc::new(WebSearchTool::new(brave_api_key)));
        tools.register(Arc::new(WebFetchTool::new()));
        tools.register(Arc::new(CronTool::new(None)));

        let message_tool = Arc::new(MessageTool::new(None));
        tools.register(message_tool.clone());

        info!(
            model = %model,
            tools = tools.len(),
            max_iterations = max_iterations,
            "agent loop initialized"
        );

        let mcp_client = Arc::new(McpClient::new(agent_name.clone()));

        Self {
            bus,
            provider,
            workspace,
            model,
            max_iterations,
            request_config,
            tools,
            context,
            sessions,
            message_tool,
            agent_name,
            mcp_client,
        }
    }

    /// Connect every enabled MCP server, registering a `McpToolAdapter` for
    /// each discovered tool and marking connected servers in the context
    /// builder's skills availability. Called once after construction, since
    /// connecting is async and `new()` stays synchronous.
    pub async fn connect_mcp_servers(&mut self, servers: &[McpServerConfig]) {
        self.mcp_client.connect_all(servers).await;

        for tool in self.mcp_client.list_all_tools().await {
            let adapter = McpToolAdapter::new(
                self.mcp_client.clone(),
                tool.server,
                tool.name,
                tool.description,
                tool.input_schema,
            );
            self.tools.register(Arc::new(adapter));
        }

        let connected = self.mcp_client.connected_server_names().await;
        self.context.set_mcp_connected(connected);
    }

    /// Spawn the MCP client's periodic health-check/reconnect loop.
    pub fn mcp_client(&self) -> Arc<McpClient> {
        self.mcp_client.clone()
    }

    /// Disconnect every MCP server transport. Part of the shutdown sequence:
    /// agent loop stops, then MCP transports stop, then cron/git timers.
    pub async fn shutdown_mcp(&self) {
        self.mcp_client.disconnect_all().await;
    }

    /// Run the event loop: poll inbound messages and process them.
    ///
    /// This runs indefinitely until the inbound channel is closed.
    pub async fn run(&self) {
        info!("agent loop started, waiting for messages");
        loop {
            let next = tokio::time::timeout(
                std::time::Duration::from_secs(1),
                self.bus.consume_inbound(),
            )
            .await;

            let msg = match next {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    info!("inbound channel closed, agent loop exiting");
                    break;
                }
                Err(_) => continue,
            };

            let session_key = msg.session_key();
            debug!(session_key = %session_key, "received message");

            // System-channel messages route back to the originating chat
            // (e.g. cron or an external supervisor delivering a reply),
            // independent of whatever in-process component enqueued them.
            let result = if msg.channel == "system" {
                self.process_system_message(&msg).await
            } else {
                self.process_message(&msg).await
            };

            match result {
                Ok(response) => {
                    if let Err(e) = self.bus.publish_outbound(response).await {
                        error!(error = %e, "failed to publish outbound message");
                    }
                }
                Err(e) => {
                    error!(error = %e, session_key = %session_key, "message processing error");
                    let err_msg = OutboundMessage::new(
                        &msg.channel,
                        &msg.chat_id,
                        &format!("I encountered an error: {e}"),
                    );
                    let _ = self.bus.publish_outbound(err_msg).await;
                }
            }
        }
    }

    /// Process a single inbound message → outbound response.
    ///
    /// This is the core agent logic:
    /// 1. Get/create session, load history
    /// 2. Build context messages
    /// 3. LLM ↔ tool loop
    /// 4. Save session, return response
    pub async fn process_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        let session_key = msg.session_key();

        // Set message tool context for this conversation
        self.message_tool
            .set_context(&msg.channel, &msg.chat_id)
            .await;

        // Get session history
        let history = self.sessions.get_history(&session_key, 50);

        // Build LLM messages
        let media_paths: Vec<String> = msg.media.iter().map(|m| m.path.clone()).collect();
        let mut messages = self
            .context
            .build_messages(
                &history,
                &msg.content,
                &media_paths,
                &msg.channel,
                &msg.chat_id,
                self.provider.supports_vision(),
            )
            .await;

        // Get tool definitions
        let tool_defs = self.tools.get_definitions();

        // Agent loop: LLM ↔ tool calling
        let mut final_content: Option<String> = None;

        for iteration in 0..self.max_iterations {
            debug!(iteration = iteration, "LLM call");

            let response = self
                .provider
                .chat(
                    &messages,
                    Some(&tool_defs),
                    &self.model,
                    &self.request_config,
                )
                .await;

            if response.has_tool_calls() {
                // Add assistant message with tool calls
                let tool_calls: Vec<ToolCall> = response.tool_calls.clone();
                ContextBuilder::add_assistant_message(
                    &mut messages,
                    response.content.clone(),
                    tool_calls.clone(),
                );

                // Execute each tool call
                for tc in &tool_calls {
                    let params: HashMap<String, serde_json::Value> =
                        serde_json::from_str(&tc.function.arguments).unwrap_or_default();

                    info!(
                        tool = %tc.function.name,
                        iteration = iteration,
                        "executing tool call"
                    );

                    let result = self.tools.execute(&tc.function.name, params).await;

                    debug!(
                        tool = %tc.function.name,
                        result_len = result.len(),
                        "tool result"
                    );

                    ContextBuilder::add_tool_result(&mut messages, &tc.id, &result);
                }
            } else {
                // No tool calls → final answer
                final_content = response.content;
                break;
            }
        }

        // If we exhausted iterations without a final answer
        let content = final_content
            .unwrap_or_else(|| "I've completed processing but have no response to give.".into());

        // Save conversation to session
        self.sessions
            .add_message(&session_key, Message::user(&msg.content));
        self.sessions
            .add_message(&session_key, Message::assistant(&content));

        Ok(OutboundMessage::new(&msg.channel, &msg.chat_id, &content))
    }

    /// Process a system-channel message: a reply destined for an originating
    /// chat, enqueued by something other than the chat's own channel (cron,
    /// an external supervisor). `chat_id` carries the origin as
    /// `"channel:chat_id"`; the response is routed back there.
    async fn process_system_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        info!(sender = %msg.sender_id, chat_id = %msg.chat_id, "processing system message");

        let (origin_channel, origin_chat_id) = match msg.chat_id.split_once(':') {
            Some((ch, cid)) => (ch.to_string(), cid.to_string()),
            None => {
                return Err(anyhow::anyhow!(
                    "invalid system message chat_id format: {}",
                    msg.chat_id
                ));
            }
        };

        let session_key = format!("{origin_channel}:{origin_chat_id}");

        self.message_tool
            .set_context(&origin_channel, &origin_chat_id)
            .await;

        let history = self.sessions.get_history(&session_key, 50);
        let mut messages = self
            .context
            .build_messages(
                &history,
                &msg.content,
                &[],
                &origin_channel,
                &origin_chat_id,
                self.provider.supports_vision(),
            )
            .await;

        let tool_defs = self.tools.get_definitions();
        let mut final_content: Option<String> = None;

        for iteration in 0..self.max_iterations {
            debug!(iteration = iteration, "system message LLM call");

            let response = self
                .provider
                .chat(&messages, Some(&tool_defs), &self.model, &self.request_config)
                .await;

            if response.has_tool_calls() {
                let tool_calls: Vec<ToolCall> = response.tool_calls.clone();
                ContextBuilder::add_assistant_message(
                    &mut messages,
                    response.content.clone(),
                    tool_calls.clone(),
                );

                for tc in &tool_calls {
                    let params: HashMap<String, serde_json::Value> =
                        serde_json::from_str(&tc.function.arguments).unwrap_or_default();
                    let result = self.tools.execute(&tc.function.name, params).await;
                    ContextBuilder::add_tool_result(&mut messages, &tc.id, &result);
                }
            } else {
                final_content = response.content;
                break;
            }
        }

        let content = final_content
            .unwrap_or_else(|| "I've completed processing but have no response to give.".into());

        self.sessions
            .add_message(&session_key, Message::user(&msg.content));
        self.sessions
            .add_message(&session_key, Message::assistant(&content));

        Ok(OutboundMessage::new(&origin_channel, &origin_chat_id, &content))
    }

    /// Re-read skills/bootstrap files from disk, rebuilding the context
    /// builder in place. Returns the set of skill identifiers added,
    /// removed, or modified (source location changed) relative to the
    /// previous snapshot.
    pub fn reload_context(&mut self) -> SkillsDiff {
        let before = self.context.skills().list_skills(false, &[]);
        self.context = ContextBuilder::new(&self.workspace, &self.agent_name);
        let after = self.context.skills().list_skills(false, &[]);

        let before_map: HashMap<String, PathBuf> =
            before.into_iter().map(|s| (s.name, s.path)).collect();
        let after_map: HashMap<String, PathBuf> =
            after.into_iter().map(|s| (s.name, s.path)).collect();

        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut modified = Vec::new();

        for (name, path) in &after_map {
            match before_map.get(name) {
                None => added.push(name.clone()),
                Some(prev_path) => {
                    if prev_path != path {
                        modified.push(name.clone());
                    }
                }
            }
        }
        for name in before_map.keys() {
            if !after_map.contains_key(name) {
                removed.push(name.clone());
            }
        }

        SkillsDiff {
            added,
            removed,
            modified,
        }
    }

    /// Direct processing mode (CLI entry point, cron jobs, the git updater).
    ///
    /// Wraps `text` into an `InboundMessage` addressed to `channel`/`chat_id`
    /// and processes it against that conversation's own session history —
    /// callers that need an isolated session (e.g. a cron job keyed by its
    /// own id) must pass a `chat_id` unique to them, since the session key
    /// is derived as `"{channel}:{chat_id}"`.
    pub async fn process_direct(&self, channel: &str, chat_id: &str, text: &str) -> Result<String> {
        let msg = InboundMessage::new(channel, "user", chat_id, text);
        let response = self.process_message(&msg).await?;
        Ok(response.content)
    }

    /// Get a reference to the tool registry (for testing/extension).
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Get the model name.
    pub fn model(&self) -> &str {
        &self.model
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oxibot_core::types::{LlmResponse, ToolDefinition};

    /// A mock LLM provider that returns canned responses.
    struct MockProvider {
        /// Responses to return in sequence.
        responses: std::sync::Mutex<Vec<LlmResponse>>,
    }

    impl MockProvider {
        fn new(responses: Vec<LlmResponse>) -> Self {
            Self {
                responses: std::sync::Mutex::new(responses),
            }
        }

        fn simple(text: &str) -> Self {
            Self::new(vec![LlmResponse {
                content: Some(text.into()),
                ..Default::default()
            }])
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _model: &str,
            _config: &LlmRequestConfig,
        ) -> LlmResponse {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                LlmResponse {
                    content: Some("(no more responses)".into()),
                    ..Default::default()
                }
            } else {
                responses.remove(0)
            }
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }

        fn display_name(&self) -> &str {
            "MockProvider"
        }
    }

    fn create_test_loop(provider: Arc<dyn LlmProvider>) -> AgentLoop {
        let bus = Arc::new(MessageBus::new(32));
        let workspace = std::env::temp_dir().join("oxibot_test_agent");
        let _ = std::fs::create_dir_all(&workspace);

        AgentLoop::new(
            bus,
            provider,
            workspace,
            None,
            Some(5),
            None,
            None,
            None,
            false,
            None,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn test_agent_simple_response() {
        let provider = Arc::new(MockProvider::simple("Hello from Oxibot!"));
        let agent = create_test_loop(provider);

        let result = agent.process_direct("cli", "direct", "Hi").await.unwrap();
        assert_eq!(result, "Hello from Oxibot!");
    }

    #[tokio::test]
    async fn test_agent_tool_calling() {
        // First response: LLM requests read_file tool call
        // Second response: LLM gives final answer
        let dir = tempfile::tempdir().unwrap();
        let test_file = dir.path().join("test.txt");
        std::fs::write(&test_file, "file content here").unwrap();

        let tool_call = ToolCall::new(
            "call_1",
            "read_file",
            serde_json::json!({"path": test_file.to_str().unwrap()}).to_string(),
        );

        let responses = vec![
            LlmResponse {
                content: None,
                tool_calls: vec![tool_call],
                ..Default::default()
            },
            LlmResponse {
                content: Some("The file contains: file content here".into()),
                ..Default::default()
            },
        ];

        let provider = Arc::new(MockProvider::new(responses));
        let bus = Arc::new(MessageBus::new(32));

        let agent = AgentLoop::new(
            bus,
            provider,
            dir.path().to_path_buf(),
            None,
            Some(10),
            None,
            None,
            None,
            false,
            None,
            None,
            None,
        );

        let result = agent.process_direct("cli", "direct", "Read test.txt").await.unwrap();
        assert_eq!(result, "The file contains: file content here");
    }

    #[tokio::test]
    async fn test_agent_max_iterations() {
        // All responses are tool calls → should exhaust max_iterations
        let tool_call = ToolCall::new("call_loop", "list_dir", r#"{"path": "/tmp"}"#);
        let responses: Vec<LlmResponse> = (0..10)
            .map(|_| LlmResponse {
                content: None,
                tool_calls: vec![tool_call.clone()],
                ..Default::default()
            })
            .collect();

        let provider = Arc::new(MockProvider::new(responses));
        let agent = create_test_loop(provider);

        let result = agent.process_direct("cli", "direct", "loop forever").await.unwrap();
        assert!(result.contains("completed processing"));
    }

    #[test]
    fn test_default_tools_registered() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider);

        let names = agent.tools().tool_names();
        assert!(names.contains(&"read_file".into()));
        assert!(names.contains(&"write_file".into()));
        assert!(names.contains(&"edit_file".into()));
        assert!(names.contains(&"list_dir".into()));
        assert!(names.contains(&"exec".into()));
        assert!(names.contains(&"web_search".into()));
        assert!(names.contains(&"web_fetch".into()));
        assert!(names.contains(&"cron".into()));
        assert!(names.contains(&"message".into()));
        assert_eq!(names.len(), 9);
    }

    #[test]
    fn test_model_defaults_to_provider() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider);
        assert_eq!(agent.model(), "mock-model");
    }

    #[test]
    fn test_exec_tool_config_default() {
        let config = ExecToolConfig::default();
        assert_eq!(config.timeout, 60);
    }

    #[tokio::test]
    async fn test_cron_tool_registered() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider);
        assert!(agent.tools().has("cron"));
    }
}
