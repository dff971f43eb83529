//! Oxibot Core — shared types, the message bus, session storage,
//! configuration, and the git auto-updater.
//!
//! This crate contains:
//! - **types**: `Message`, `Session`, tool-call and content representations
//! - **bus**: `MessageBus` — the inbound/outbound queue connecting channels to the agent loop
//! - **session**: `SessionManager` — JSONL session persistence
//! - **config**: layered configuration (defaults → file → env)
//! - **git_update**: background auto-updater that tracks a git remote and rebases local changes

pub mod bus;
pub mod config;
pub mod git_update;
pub mod session;
pub mod types;
pub mod utils;

pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use config::Config;
pub use session::SessionManager;
