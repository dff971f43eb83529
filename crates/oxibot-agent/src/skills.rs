//! Skills loader — discovers, loads, and filters skill files.
//!
//! Port of nanobot's `agent/skills.py`.
//!
//! # Architecture
//!
//! Skills are **Markdown files** (`SKILL.md`) that teach the agent how to
//! combine existing tools for specific domains (GitHub, weather, tmux, etc.).
//! They do **not** register new tools directly — except `mcp`/`hybrid`
//! skills, whose tools come from a connected MCP server.
//!
//! ## Two-tier loading
//!
//! 1. **Always-on skills** (`always: true` in metadata) — full content injected
//!    into every system prompt.
//! 2. **On-demand skills** — only an XML summary (name, description, path,
//!    availability) is injected. The LLM uses `read_file` to load the full
//!    `SKILL.md` when it decides a skill is relevant.
//!
//! ## Discovery order
//!
//! 1. `workspace/skills/<name>/SKILL.md` (user custom — highest priority)
//! 2. Built-in skills bundled with oxibot (lower priority, overridden by name)
//!
//! ## SKILL.md format
//!
//! ```text
//! ---
//! name: github
//! description: "Interact with GitHub using the gh CLI"
//! metadata:
//!   oxibot:
//!     requires: {bins: [gh]}
//!     always: false
//! ---
//!
//! # GitHub Skill
//!
//! Use the `exec` tool to run `gh` commands ...
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

// ─────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────

/// Where a skill was discovered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkillSource {
    /// User's workspace `skills/` directory.
    Workspace,
    /// Built-in with oxibot.
    Builtin,
}

/// Metadata about a discovered skill.
#[derive(Clone, Debug)]
pub struct SkillInfo {
    /// Skill name (directory name).
    pub name: String,
    /// Path to the `SKILL.md` file.
    pub path: PathBuf,
    /// Where the skill was found.
    pub source: SkillSource,
}

/// Parsed requirements for a skill.
#[derive(Clone, Debug, Default)]
pub struct SkillRequires {
    /// CLI binaries that must be on PATH.
    pub bins: Vec<String>,
    /// Environment variables that must be set.
    pub env: Vec<String>,
}

/// How a skill supplies its capability.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SkillKind {
    /// Pure instruction skill — tools used come from the native registry.
    #[default]
    Instruction,
    /// Depends entirely on tools exposed by one or more MCP servers.
    Mcp,
    /// Uses both native tools and MCP-sourced tools.
    Hybrid,
}

/// Parsed metadata block from the frontmatter `metadata.oxibot` field.
#[derive(Clone, Debug, Default)]
pub struct SkillMeta {
    /// If true, full content is always injected into the system prompt.
    pub always: bool,
    /// Requirements for this skill to be available.
    pub requires: SkillRequires,
    /// Description (from frontmatter top-level, not metadata block).
    pub description: Option<String>,
    /// How this skill supplies its capability.
    pub kind: SkillKind,
    /// MCP servers this skill depends on (for `mcp`/`hybrid` kinds).
    pub mcp_servers: Vec<String>,
}

// ─────────────────────────────────────────────
// Frontmatter document (serde_yaml)
// ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct FrontmatterDoc {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    always: bool,
    #[serde(default)]
    metadata: Option<MetadataWrapper>,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataWrapper {
    #[serde(default)]
    oxibot: Option<OxibotMeta>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OxibotMeta {
    always: bool,
    #[serde(rename = "type")]
    kind: Option<String>,
    mcp_servers: Vec<String>,
    requires: RequiresDoc,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RequiresDoc {
    bins: Vec<String>,
    env: Vec<String>,
}

// ─────────────────────────────────────────────
// SkillsLoader
// ─────────────────────────────────────────────

/// Discovers and loads skill files from workspace and built-in directories.
pub struct SkillsLoader {
    /// User workspace root.
    workspace_skills: PathBuf,
    /// Built-in skills directory.
    builtin_skills: Option<PathBuf>,
}

impl SkillsLoader {
    /// Create a new skills loader.
    ///
    /// - `workspace` — the agent workspace root (contains `skills/` subdirectory)
    /// - `builtin_skills` — optional path to built-in skills directory
    pub fn new(workspace: &Path, builtin_skills: Option<PathBuf>) -> Self {
        Self {
            workspace_skills: workspace.join("skills"),
            builtin_skills,
        }
    }

    // ────────────── Discovery ──────────────

    /// List all discovered skills.
    ///
    /// If `filter_unavailable` is true, skills with unmet requirements
    /// (missing CLI binaries, env vars, or disconnected MCP servers) are
    /// excluded. `mcp_status` is the set of currently connected MCP server
    /// names.
    pub fn list_skills(&self, filter_unavailable: bool, mcp_status: &[String]) -> Vec<SkillInfo> {
        let mut skills = Vec::new();

        // 1. Workspace skills (highest priority)
        if self.workspace_skills.is_dir() {
            scan_skill_dirs(&self.workspace_skills, SkillSource::Workspace, &mut skills);
        }

        // 2. Built-in skills (skip if name already found in workspace)
        if let Some(builtin) = &self.builtin_skills {
            if builtin.is_dir() {
                let existing: Vec<String> = skills.iter().map(|s| s.name.clone()).collect();
                let mut builtin_skills = Vec::new();
                scan_skill_dirs(builtin, SkillSource::Builtin, &mut builtin_skills);
                for skill in builtin_skills {
                    if !existing.contains(&skill.name) {
                        skills.push(skill);
                    }
                }
            }
        }

        if filter_unavailable {
            skills.retain(|s| {
                let meta = self.get_skill_meta(&s.name);
                is_available(&meta, mcp_status)
            });
        }

        skills
    }

    // ────────────── Loading ──────────────

    /// Load the raw content of a skill by name.
    ///
    /// Looks in workspace first, then built-in.
    pub fn load_skill(&self, name: &str) -> Option<String> {
        let ws_path = self.workspace_skills.join(name).join("SKILL.md");
        if ws_path.is_file() {
            return std::fs::read_to_string(&ws_path).ok();
        }

        if let Some(builtin) = &self.builtin_skills {
            let bi_path = builtin.join(name).join("SKILL.md");
            if bi_path.is_file() {
                return std::fs::read_to_string(&bi_path).ok();
            }
        }

        None
    }

    /// Load full content of specific skills, stripped of frontmatter,
    /// for injection into the system prompt (always-on skills).
    pub fn load_skills_for_context(&self, names: &[String]) -> String {
        let parts: Vec<String> = names
            .iter()
            .filter_map(|name| {
                let content = self.load_skill(name)?;
                let body = strip_frontmatter(&content);
                if body.is_empty() {
                    return None;
                }
                Some(format!("### Skill: {name}\n\n{body}"))
            })
            .collect();

        parts.join("\n\n---\n\n")
    }

    /// Build an XML summary of all skills for the system prompt.
    ///
    /// The LLM uses this to decide which skills to load on demand via `read_file`.
    pub fn build_skills_summary(&self, mcp_status: &[String]) -> String {
        let all = self.list_skills(false, mcp_status);
        if all.is_empty() {
            return String::new();
        }

        let mut lines = vec!["<skills>".to_string()];

        for skill in &all {
            let meta = self.get_skill_meta(&skill.name);
            let available = is_available(&meta, mcp_status);
            let desc = meta.description.as_deref().unwrap_or(&skill.name);

            lines.push(format!(
                "  <skill available=\"{}\">",
                if available { "true" } else { "false" }
            ));
            lines.push(format!("    <name>{}</name>", escape_xml(&skill.name)));
            lines.push(format!("    <description>{}</description>", escape_xml(desc)));
            lines.push(format!("    <location>{}</location>", skill.path.display()));

            match meta.kind {
                SkillKind::Mcp => lines.push("    <type>mcp</type>".to_string()),
                SkillKind::Hybrid => lines.push("    <type>hybrid</type>".to_string()),
                SkillKind::Instruction => {}
            }
            if !meta.mcp_servers.is_empty() {
                lines.push(format!(
                    "    <mcp_servers>{}</mcp_servers>",
                    escape_xml(&meta.mcp_servers.join(","))
                ));
            }

            if !available {
                let missing = get_missing_requirements(&meta, mcp_status);
                if !missing.is_empty() {
                    lines.push(format!("    <requires>{}</requires>", escape_xml(&missing)));
                }
            }

            lines.push("  </skill>".to_string());
        }

        lines.push("</skills>".to_string());
        lines.join("\n")
    }

    /// Get names of skills that should always be injected (full body).
    pub fn get_always_skills(&self) -> Vec<String> {
        self.list_skills(true, &[])
            .iter()
            .filter(|s| {
                let meta = self.get_skill_meta(&s.name);
                meta.always
            })
            .map(|s| s.name.clone())
            .collect()
    }

    // ────────────── Metadata ──────────────

    /// Parse frontmatter metadata for a skill.
    pub fn get_skill_meta(&self, name: &str) -> SkillMeta {
        let content = match self.load_skill(name) {
            Some(c) => c,
            None => return SkillMeta::default(),
        };

        let block = match extract_frontmatter_block(&content) {
            Some(b) => b,
            None => return SkillMeta::default(),
        };

        let doc: FrontmatterDoc = serde_yaml::from_str(block).unwrap_or_default();
        let oxibot = doc.metadata.and_then(|m| m.oxibot).unwrap_or_default();

        let kind = match oxibot.kind.as_deref() {
            Some("mcp") => SkillKind::Mcp,
            Some("hybrid") => SkillKind::Hybrid,
            _ => SkillKind::Instruction,
        };

        SkillMeta {
            always: doc.always || oxibot.always,
            requires: SkillRequires {
                bins: oxibot.requires.bins,
                env: oxibot.requires.env,
            },
            description: doc.description,
            kind,
            mcp_servers: oxibot.mcp_servers,
        }
    }
}

// ─────────────────────────────────────────────
// Helper functions
// ─────────────────────────────────────────────

/// Scan a directory for skill subdirectories containing `SKILL.md`.
fn scan_skill_dirs(dir: &Path, source: SkillSource, out: &mut Vec<SkillInfo>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let skill_file = path.join("SKILL.md");
            if skill_file.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    debug!(name, source = ?source, "discovered skill");
                    out.push(SkillInfo {
                        name: name.to_string(),
                        path: skill_file,
                        source: source.clone(),
                    });
                }
            }
        }
    }
}

/// Extract the raw text between the leading `---` delimiters, for YAML parsing.
fn extract_frontmatter_block(content: &str) -> Option<&str> {
    if !content.starts_with("---") {
        return None;
    }
    let after_first = &content[3..];
    let end = after_first.find("\n---")?;
    Some(&after_first[..end])
}

/// Strip YAML frontmatter from markdown content.
fn strip_frontmatter(content: &str) -> &str {
    if !content.starts_with("---") {
        return content;
    }
    let after_first = &content[3..];
    match after_first.find("\n---") {
        Some(end) => {
            let rest = &after_first[end + 4..]; // skip "\n---"
            rest.trim_start_matches('\n')
        }
        None => content,
    }
}

/// Escape XML special characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Whether all of a skill's requirements (bins, env, MCP servers) are met.
fn is_available(meta: &SkillMeta, mcp_status: &[String]) -> bool {
    check_requirements(&meta.requires)
        && match meta.kind {
            SkillKind::Instruction => true,
            SkillKind::Mcp | SkillKind::Hybrid => meta
                .mcp_servers
                .iter()
                .all(|s| mcp_status.iter().any(|c| c == s)),
        }
}

/// Check if all bin/env requirements are met.
fn check_requirements(requires: &SkillRequires) -> bool {
    for bin in &requires.bins {
        if !is_binary_available(bin) {
            return false;
        }
    }
    for env_var in &requires.env {
        if std::env::var(env_var).is_err() {
            return false;
        }
    }
    true
}

/// Get a human-readable list of missing requirements.
fn get_missing_requirements(meta: &SkillMeta, mcp_status: &[String]) -> String {
    let mut missing = Vec::new();

    for bin in &meta.requires.bins {
        if !is_binary_available(bin) {
            missing.push(format!("CLI: {bin}"));
        }
    }
    for env_var in &meta.requires.env {
        if std::env::var(env_var).is_err() {
            missing.push(format!("ENV: {env_var}"));
        }
    }
    if matches!(meta.kind, SkillKind::Mcp | SkillKind::Hybrid) {
        for server in &meta.mcp_servers {
            if !mcp_status.iter().any(|c| c == server) {
                missing.push(format!("MCP: {server}"));
            }
        }
    }

    missing.join(", ")
}

/// Check if a binary is available on the system PATH.
fn is_binary_available(name: &str) -> bool {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return true;
            }
        }
    }
    false
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
