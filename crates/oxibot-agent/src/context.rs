//! Context builder — constructs the system prompt and conversation messages.
//!
//! Port of nanobot's `agent/context.py`.
//! Builds the system prompt from identity, bootstrap files, memory, and skills,
//! then assembles the full message list for an LLM call.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use chrono::Utc;
use oxibot_core::config::SummaryConfig;
use oxibot_core::types::{ContentPart, ImageUrl, Message};
use tracing::debug;

use crate::memory::MemoryStore;
use crate::skills::SkillsLoader;
use crate::summary::Summarizer;

// ─────────────────────────────────────────────
// Bootstrap / identity files
// ─────────────────────────────────────────────

/// Files that are automatically injected into the system prompt when present
/// in the workspace root.
const BOOTSTRAP_FILES: &[&str] = &[
    "AGENTS.md",
    "SOUL.md",
    "USER.md",
    "TOOLS.md",
    "IDENTITY.md",
];

// ─────────────────────────────────────────────
// Context builder
// ─────────────────────────────────────────────

/// Builds system prompts and conversation message lists for the agent loop.
pub struct ContextBuilder {
    /// Root workspace directory.
    workspace: PathBuf,
    /// Agent identity name (for the system prompt).
    agent_name: String,
    /// Memory store for long-term + daily notes.
    memory: MemoryStore,
    /// Skills loader for discovering and loading skill files.
    skills: SkillsLoader,
    /// Conversation summarizer, if auto-summary is configured.
    summarizer: Option<Arc<Summarizer>>,
    /// Dual-threshold auto-summary configuration.
    summary_config: SummaryConfig,
    /// Names of currently-connected MCP servers, for skill availability.
    mcp_connected: Mutex<Vec<String>>,
    /// Session keys currently being summarized, to avoid concurrent compression
    /// of the same conversation racing two turns.
    in_flight: Mutex<HashSet<String>>,
}

impl ContextBuilder {
    /// Create a new context builder.
    pub fn new(workspace: impl Into<PathBuf>, agent_name: impl Into<String>) -> Self {
        let workspace = workspace.into();
        let memory = MemoryStore::new_lazy(&workspace);
        let skills = SkillsLoader::new(&workspace, None);
        Self {
            workspace,
            agent_name: agent_name.into(),
            memory,
            skills,
            summarizer: None,
            summary_config: SummaryConfig::default(),
            mcp_connected: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Set the built-in skills directory (builder pattern).
    pub fn with_builtin_skills(mut self, path: PathBuf) -> Self {
        self.skills = SkillsLoader::new(&self.workspace, Some(path));
        self
    }

    /// Wire in a conversation summarizer and its threshold configuration
    /// (builder pattern). Without this, `build_messages` never compresses
    /// history.
    pub fn with_summarizer(mut self, summarizer: Arc<Summarizer>, config: SummaryConfig) -> Self {
        self.summarizer = Some(summarizer);
        self.summary_config = config;
        self
    }

    /// Update the set of currently-connected MCP server names, used to
    /// compute `mcp`/`hybrid` skill availability.
    pub fn set_mcp_connected(&self, servers: Vec<String>) {
        *self.mcp_connected.lock().expect("mcp_connected mutex poisoned") = servers;
    }

    /// Get a reference to the memory store.
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Get a reference to the skills loader.
    pub fn skills(&self) -> &SkillsLoader {
        &self.skills
    }

    // ────────────── System prompt ──────────────

    /// Build the full system prompt.
    pub fn build_system_prompt(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        // 1) Identity
        parts.push(self.build_identity());

        // 2) Bootstrap files
        for filename in BOOTSTRAP_FILES {
            let path = self.workspace.join(filename);
            if path.is_file() {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    debug!(file = filename, "loaded bootstrap file");
                    parts.push(format!("## {filename}\n\n{content}"));
                }
            }
        }

        // 3) Memory context (via MemoryStore)
        if let Some(memory) = self.memory.get_memory_context() {
            parts.push(memory);
        }

        // 4) Always-on skills (full body injected)
        let always_skills = self.skills.get_always_skills();
        if !always_skills.is_empty() {
            let always_content = self.skills.load_skills_for_context(&always_skills);
            if !always_content.is_empty() {
                parts.push(format!("# Active Skills\n\n{always_content}"));
            }
        }

        // 5) Skills summary (XML catalogue — agent uses read_file for on-demand loading)
        let mcp_status = self
            .mcp_connected
            .lock()
            .expect("mcp_connected mutex poisoned")
            .clone();
        let skills_summary = self.skills.build_skills_summary(&mcp_status);
        if !skills_summary.is_empty() {
            parts.push(format!(
                "# Skills\n\n\
                 The following skills extend your capabilities. \
                 To use a skill, read its SKILL.md file using the `read_file` tool.\n\
                 Skills with available=\"false\" need dependencies installed first.\n\n\
                 {skills_summary}"
            ));
        }

        parts.join("\n\n---\n\n")
    }

    /// Core identity block.
    fn build_identity(&self) -> String {
        let now = Utc::now().format("%Y-%m-%d %H:%M (%A)");
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        let workspace = self.workspace.display();
        let memory_file = self.memory.memory_file().display();
        let today = Utc::now().format("%Y-%m-%d");

        format!(
            "# Identity\n\n\
             You are **{name}**, a personal agent with access to tools for reading and \
             writing files, running commands, searching the web, sending messages, and \
             scheduling future work.\n\n\
             - **Date/time**: {now}\n\
             - **Runtime**: Rust on {os}/{arch}\n\
             - **Workspace**: `{workspace}`\n\n\
             Always prefer using tools over guessing. Be concise and helpful.\n\n\
             ## Memory\n\n\
             When you learn something important about the user or the project, \
             persist it by writing to `{memory_file}` using the `write_file` or `edit_file` tool.\n\
             For daily notes, write to `{workspace}/memory/{today}.md`.",
            name = self.agent_name,
        )
    }

    // ────────────── Message building ──────────────

    /// Build the full message list for an LLM call.
    ///
    /// 1. System prompt
    /// 2. Session history (summarized in place if auto-summary is configured
    ///    and the conversation has grown past the trigger threshold)
    /// 3. Current user message
    pub async fn build_messages(
        &self,
        history: &[Message],
        user_text: &str,
        media: &[String],
        channel: &str,
        chat_id: &str,
        supports_vision: bool,
    ) -> Vec<Message> {
        let mut messages = Vec::new();

        // System prompt + session info
        let mut system = self.build_system_prompt();
        system.push_str(&format!(
            "\n\n## Current Session\nChannel: {channel}\nChat ID: {chat_id}"
        ));
        messages.push(Message::system(system));

        // History, possibly compressed
        let session_key = format!("{channel}:{chat_id}");
        let processed_history = self.maybe_summarize(history, &session_key).await;
        messages.extend(processed_history);

        // Current user message. Media is only encoded as image parts when
        // the provider claims vision support — otherwise it's dropped and
        // only the text stands (transcriptions/descriptions belong in the
        // text content already).
        if media.is_empty() || !supports_vision {
            messages.push(Message::user(user_text));
        } else {
            messages.push(build_multimodal_user_message(user_text, media));
        }

        messages
    }

    /// Summarize `history` if auto-summary is enabled and the session isn't
    /// already being summarized by a concurrent call; otherwise returns it
    /// unchanged. The in-flight guard is released on every exit path.
    async fn maybe_summarize(&self, history: &[Message], session_key: &str) -> Vec<Message> {
        if !self.summary_config.enabled {
            return history.to_vec();
        }
        let Some(summarizer) = &self.summarizer else {
            return history.to_vec();
        };

        {
            let mut in_flight = self.in_flight.lock().expect("in_flight mutex poisoned");
            if in_flight.contains(session_key) {
                debug!(session_key, "summary already in flight for session");
                return history.to_vec();
            }
            in_flight.insert(session_key.to_string());
        }

        let result = summarizer
            .maybe_summarize(
                history,
                self.summary_config.threshold_low,
                self.summary_config.threshold_high,
                &self.summary_config.prompt,
                self.summary_config.target_length,
            )
            .await;

        self.in_flight
            .lock()
            .expect("in_flight mutex poisoned")
            .remove(session_key);

        result
    }

    /// Add a tool result to the message list (convenience wrapper).
    pub fn add_tool_result(messages: &mut Vec<Message>, tool_call_id: &str, result: &str) {
        messages.push(Message::tool_result(tool_call_id, result));
    }

    /// Add an assistant message (with optional tool calls) to the message list.
    pub fn add_assistant_message(
        messages: &mut Vec<Message>,
        content: Option<String>,
        tool_calls: Vec<oxibot_core::types::ToolCall>,
    ) {
        if tool_calls.is_empty() {
            if let Some(text) = content {
                messages.push(Message::assistant(text));
            }
        } else {
            messages.push(Message::assistant_tool_calls(tool_calls));
        }
    }
}

// ─────────────────────────────────────────────
// Multimodal helpers
// ─────────────────────────────────────────────

/// Build a user message with base64-encoded images.
///
/// Only paths whose guessed MIME type starts with `image/` are attached —
/// anything else (audio, PDFs, arbitrary binaries) is skipped, since a
/// vision-capable model still only accepts image content parts. If nothing
/// qualifies, falls back to a plain text message.
fn build_multimodal_user_message(text: &str, media_paths: &[String]) -> Message {
    let mut parts = Vec::new();

    for path in media_paths {
        let Some(mime) = guess_image_mime(path) else {
            continue;
        };
        if let Ok(data) = std::fs::read(path) {
            let b64 = base64::engine::general_purpose::STANDARD.encode(&data);
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{mime};base64,{b64}"),
                    detail: None,
                },
            });
        }
    }

    if parts.is_empty() {
        return Message::user(text);
    }

    parts.push(ContentPart::Text {
        text: text.to_string(),
    });

    Message::user_parts(parts)
}

/// Guess a file's MIME type from its extension, returning `None` unless it's
/// a recognized image type. An allowlist, not a denylist — an unrecognized
/// extension is excluded rather than guessed at.
fn guess_image_mime(path: &str) -> Option<&'static str> {
    let lower = path.to_lowercase();
    if lower.ends_with(".png") {
        Some("image/png")
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        Some("image/jpeg")
    } else if lower.ends_with(".gif") {
        Some("image/gif")
    } else if lower.ends_with(".webp") {
        Some("image/webp")
    } else if lower.ends_with(".svg") {
        Some("image/svg+xml")
    } else {
        None
    }
}
