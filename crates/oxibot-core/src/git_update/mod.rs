//! Git auto-updater — tracks a repo's remote branch and rebases local
//! changes on top of it, on a timer.
//!
//! Port of nanobot's `git_update/service.py`.

pub mod service;
pub mod types;

pub use service::GitUpdateService;
pub use types::{GitRepoConfig, GitRepoState, GitUpdateStatus, GitUpdateStore};
