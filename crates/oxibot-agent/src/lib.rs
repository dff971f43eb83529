//! Oxibot Agent — core loop, tools, and context builder.
//!
//! This crate contains:
//! - **tools**: Tool trait, registry, and built-in tools (filesystem, shell, web, message, cron)
//! - **context**: System prompt and message list construction
//! - **summary**: Conversation summarization (token estimation, tail-walk, compression)
//! - **mcp**: Model Context Protocol client (stdio/SSE transports, tool adapter)
//! - **agent_loop**: The LLM ↔ tool-calling main loop

pub mod tools;
pub mod context;
pub mod memory;
pub mod skills;
pub mod summary;
pub mod mcp;
pub mod agent_loop;

pub use agent_loop::{AgentLoop, ExecToolConfig, SkillsDiff};
pub use context::ContextBuilder;
pub use memory::MemoryStore;
pub use skills::SkillsLoader;
pub use summary::Summarizer;
pub use tools::{Tool, ToolRegistry};
