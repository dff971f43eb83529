//! Git updater type system — repo config, persisted state, and the store.
//!
//! Mirrors the shape of `oxibot_cron::types::CronStore` (JSON file,
//! `{version, repo_states}`), since the two services share the same
//! timer/persistence discipline.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Operator-configured repo to watch.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoConfig {
    /// Stable identifier, derived from `path` if not set explicitly.
    #[serde(default)]
    pub id: String,
    /// Path to the local git working tree.
    pub path: String,
    /// Branch to track (e.g. `"main"`).
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Standard 5-field cron expression controlling the check frequency.
    #[serde(default = "default_check_cron")]
    pub cron_expr: String,
    /// Whether this repo is actively checked.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Shell commands run (via a shell) after a successful update.
    #[serde(default)]
    pub on_update: Vec<String>,
    /// Shell commands run after a rebase conflict is detected.
    #[serde(default)]
    pub on_conflict: Vec<String>,
    /// Whether to notify (deliver a message) when the repo changes.
    #[serde(default)]
    pub notify_on_change: bool,
    /// Channel to deliver the change notification to, if `notify_on_change`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_channel: Option<String>,
    /// Recipient within `notify_channel`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_chat_id: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_check_cron() -> String {
    "*/15 * * * *".to_string()
}

fn default_true() -> bool {
    true
}

impl GitRepoConfig {
    /// Create a config for a repo path, deriving a stable id from the path.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let id = stable_id(&path);
        Self {
            id,
            path,
            branch: default_branch(),
            cron_expr: default_check_cron(),
            enabled: true,
            on_update: Vec::new(),
            on_conflict: Vec::new(),
            notify_on_change: false,
            notify_channel: None,
            notify_chat_id: None,
        }
    }
}

/// Derive a stable identifier from a repo path.
///
/// The original Python implementation regenerated a fresh random uuid on
/// every load, so persisted state could never be matched back up by id.
/// Hashing the canonicalized path instead makes save-then-load idempotent.
pub fn stable_id(path: &str) -> String {
    let canonical = std::fs::canonicalize(path)
        .unwrap_or_else(|_| Path::new(path).to_path_buf());
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Outcome of a single update check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GitUpdateStatus {
    NoChange,
    Updated,
    Conflict,
    Error,
}

/// Persisted per-repo state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoState {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<GitUpdateStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<String>,
    #[serde(default)]
    pub updates_applied: u64,
}

impl GitRepoState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            next_run_ms: None,
            last_run_ms: None,
            last_status: None,
            last_error: None,
            last_commit: None,
            updates_applied: 0,
        }
    }
}

/// Persistent store for git repo states (JSON file).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitUpdateStore {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub repo_states: Vec<GitRepoState>,
}

fn default_version() -> u32 {
    1
}

impl GitUpdateStore {
    pub fn new() -> Self {
        Self {
            version: 1,
            repo_states: Vec::new(),
        }
    }

    pub fn find(&self, id: &str) -> Option<&GitRepoState> {
        self.repo_states.iter().find(|s| s.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut GitRepoState> {
        self.repo_states.iter_mut().find(|s| s.id == id)
    }

    /// Get the state for `id`, inserting a fresh one if absent.
    pub fn get_or_insert(&mut self, id: &str) -> &mut GitRepoState {
        if self.find(id).is_none() {
            self.repo_states.push(GitRepoState::new(id));
        }
        self.find_mut(id).expect("just inserted")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_id_deterministic() {
        let a = stable_id("/tmp/does-not-exist-abc");
        let b = stable_id("/tmp/does-not-exist-abc");
        assert_eq!(a, b);
    }

    #[test]
    fn test_stable_id_differs_by_path() {
        let a = stable_id("/tmp/repo-a");
        let b = stable_id("/tmp/repo-b");
        assert_ne!(a, b);
    }

    #[test]
    fn test_repo_config_new_sets_id() {
        let cfg = GitRepoConfig::new("/tmp/my-repo");
        assert!(!cfg.id.is_empty());
        assert_eq!(cfg.branch, "main");
        assert!(cfg.enabled);
    }

    #[test]
    fn test_store_get_or_insert() {
        let mut store = GitUpdateStore::new();
        let id = "abc123".to_string();
        {
            let state = store.get_or_insert(&id);
            state.updates_applied = 2;
        }
        assert_eq!(store.find(&id).unwrap().updates_applied, 2);
        // Second call returns the same entry, not a fresh one.
        let state = store.get_or_insert(&id);
        assert_eq!(state.updates_applied, 2);
    }

    #[test]
    fn test_store_roundtrip() {
        let mut store = GitUpdateStore::new();
        store.get_or_insert("r1").last_commit = Some("abc".into());
        let json = serde_json::to_string(&store).unwrap();
        let reloaded: GitUpdateStore = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded.repo_states.len(), 1);
        assert_eq!(reloaded.repo_states[0].last_commit.as_deref(), Some("abc"));
    }
}
