//! Shell tool — execute commands in a subprocess.
//!
//! Port of nanobot's `agent/tools/shell.py` `ExecTool`.
//! Includes deny-pattern safety guard and optional workspace restriction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

use super::base::{optional_string, require_string, Tool};

/// Maximum output length before truncation (characters).
const MAX_OUTPUT_LEN: usize = 10_000;

/// Default command timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Dangerous command patterns that are always blocked.
const DENY_PATTERNS: &[&str] = &[
    r"\brm\s+-[rf]{1,2}\b",
    r"\bdel\s+/[fq]\b",
    r"\brmdir\s+/s\b",
    r"\b(format|mkfs|diskpart)\b",
    r"\bdd\s+if=",
    r">\s*/dev/sd",
    r"\b(shutdown|reboot|poweroff)\b",
    r":\(\)\s*\{.*\};\s*:",   // fork bomb
];

/// Shell metacharacters that disqualify a command outright — the command is
/// never handed to a shell, so these would just be passed through literally
/// and silently fail to do what the caller expects (or worse).
const SHELL_METACHARS: &[char] = &['|', '&', ';', '$', '`', '\\', '>', '<', '\n', '\r'];

/// Program basenames the tool is willing to spawn directly.
const SAFE_COMMANDS: &[&str] = &[
    "ls", "pwd", "cat", "head", "tail", "grep", "find",
    "echo", "date", "whoami", "id", "uname", "df", "du", "free",
    "ps", "top", "netstat", "ss", "ping", "traceroute",
    "curl", "wget", "git", "python", "python3", "pip", "pip3",
    "npm", "node", "npx", "cargo", "rustc", "go", "java", "javac",
    "mvn", "gradle", "docker", "docker-compose", "kubectl",
    "terraform", "ansible", "make", "cmake", "gcc", "g++", "clang",
    "rustup", "gem", "bundle", "composer", "yarn",
    "pytest", "black", "ruff", "mypy", "pylint",
    "flake8", "sed", "awk", "sort", "uniq", "wc",
    "cut", "tr", "xargs", "tree", "file",
    "stat", "readlink", "realpath", "basename", "dirname",
    "md5sum", "sha1sum", "sha256sum", "base64", "hexdump",
    "jq", "yq", "rsync", "tar", "zip", "unzip",
    "gzip", "gunzip", "xz",
    "ln", "cp", "mv", "mkdir", "touch",
    "sleep", "true", "false",
];

// ─────────────────────────────────────────────
// ExecTool
// ─────────────────────────────────────────────

/// Execute shell commands in a subprocess.
pub struct ExecTool {
    /// Working directory for commands.
    working_dir: PathBuf,
    /// Command timeout.
    timeout: Duration,
    /// If true, block commands that reference paths outside `working_dir`.
    restrict_to_workspace: bool,
    /// Compiled deny regexes (built once at construction).
    deny_regexes: Vec<Regex>,
}

impl ExecTool {
    /// Create a new `ExecTool`.
    pub fn new(
        working_dir: PathBuf,
        timeout_secs: Option<u64>,
        restrict_to_workspace: bool,
    ) -> Self {
        let deny_regexes: Vec<Regex> = DENY_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();

        Self {
            working_dir,
            timeout: Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            restrict_to_workspace,
            deny_regexes,
        }
    }

    /// Check if a command is safe to execute. Returns an error message if blocked.
    fn guard_command(&self, command: &str, cwd: &str) -> Option<String> {
        let lower = command.to_lowercase();

        // Check deny patterns
        for re in &self.deny_regexes {
            if re.is_match(&lower) {
                warn!(command = command, "command blocked by safety guard");
                return Some(
                    "Error: Command blocked by safety guard (dangerous pattern detected)".into(),
                );
            }
        }

        // Reject shell metacharacters outright — the command is never handed
        // to a shell, so pipes/chaining/substitution would just be passed as
        // literal argv text rather than doing what the caller expects.
        if command.contains(SHELL_METACHARS) {
            warn!(command = command, "command blocked: shell metacharacter");
            return Some(
                "Error: Command contains shell metacharacters (pipes, redirection, chaining, \
                 or substitution are not supported — issue multiple exec calls instead)"
                    .into(),
            );
        }

        // Workspace restriction
        if self.restrict_to_workspace {
            // Block path traversal
            if command.contains("../") || command.contains("..\\") {
                return Some(
                    "Error: Command blocked — path traversal (../) not allowed in restricted mode"
                        .into(),
                );
            }

            // Check for absolute paths outside workspace
            let cwd_path = PathBuf::from(cwd);
            let abs_path_re = Regex::new(r#"(?:/[^\s"']+|[A-Za-z]:\\[^\s"']+)"#).ok();
            if let Some(re) = abs_path_re {
                for cap in re.find_iter(command) {
                    let p = PathBuf::from(cap.as_str());
                    let resolved = if p.exists() {
                        p.canonicalize().unwrap_or(p)
                    } else {
                        p
                    };
                    if !resolved.starts_with(&cwd_path) {
                        return Some(format!(
                            "Error: Command references path '{}' outside workspace",
                            cap.as_str()
                        ));
                    }
                }
            }
        }

        None
    }

    /// Word-split `command` and verify the program basename is allowlisted.
    /// Returns the parsed argv on success, or an error string otherwise.
    fn parse_command(&self, command: &str) -> Result<Vec<String>, String> {
        let args = shlex::split(command).ok_or_else(|| {
            "Error: Command could not be parsed (unbalanced quotes)".to_string()
        })?;

        let program = args.first().ok_or_else(|| {
            "Error: Command is empty after parsing".to_string()
        })?;

        // Reject paths — only bare basenames resolved against PATH are allowed.
        if program.contains('/') || program.contains('\\') {
            return Err(format!(
                "Error: Command '{program}' is not allowed (paths are not permitted, only a \
                 basename from the allowlist)"
            ));
        }

        if !SAFE_COMMANDS.contains(&program.as_str()) {
            return Err(format!(
                "Error: Command '{program}' is not in the allowlist of permitted programs"
            ));
        }

        Ok(args)
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output. \
         Use this for running builds, tests, git, or any CLI tool."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "working_dir": {
                    "type": "string",
                    "description": "Optional working directory (defaults to workspace root)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let command = require_string(&params, "command")?;
        let cwd = optional_string(&params, "working_dir")
            .unwrap_or_else(|| self.working_dir.to_string_lossy().to_string());

        // Safety check
        if let Some(err) = self.guard_command(&command, &cwd) {
            return Ok(err); // return as tool output, not Rust error
        }

        // Word-split and validate the program basename — never handed to a shell.
        let args = match self.parse_command(&command) {
            Ok(args) => args,
            Err(err) => return Ok(err),
        };
        let (program, rest) = args.split_first().expect("parse_command guarantees non-empty");

        info!(command = %command, cwd = %cwd, "executing shell command");

        // Spawn the process directly (no shell involved)
        let mut child = Command::new(program)
            .args(rest)
            .current_dir(&cwd)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn command: {e}"))?;

        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let collect = async {
            let (stdout_res, stderr_res) = tokio::join!(
                stdout_pipe.read_to_end(&mut stdout_buf),
                stderr_pipe.read_to_end(&mut stderr_buf),
            );
            stdout_res?;
            stderr_res?;
            child.wait().await
        };

        match tokio::time::timeout(self.timeout, collect).await {
            Ok(Ok(status)) => {
                let stdout = String::from_utf8_lossy(&stdout_buf).to_string();
                let stderr = String::from_utf8_lossy(&stderr_buf).to_string();
                let code = status.code().unwrap_or(-1);

                let mut parts = Vec::new();
                if !stdout.is_empty() {
                    parts.push(stdout);
                }
                if !stderr.is_empty() {
                    parts.push(format!("STDERR:\n{stderr}"));
                }
                if code != 0 {
                    parts.push(format!("Exit code: {code}"));
                }

                let mut combined = if parts.is_empty() {
                    "(no output)".to_string()
                } else {
                    parts.join("\n")
                };

                // Truncate if too long
                if combined.len() > MAX_OUTPUT_LEN {
                    let remaining = combined.len() - MAX_OUTPUT_LEN;
                    combined.truncate(MAX_OUTPUT_LEN);
                    combined.push_str(&format!("\n... (truncated, {remaining} more chars)"));
                }

                Ok(combined)
            }
            Ok(Err(e)) => {
                anyhow::bail!("Command failed: {e}");
            }
            Err(_) => {
                // Timeout: kill explicitly rather than relying on kill_on_drop
                // alone, and reap so the process doesn't linger as a zombie.
                let _ = child.start_kill();
                let _ = child.wait().await;
                Ok(format!(
                    "Error: Command timed out after {} seconds",
                    self.timeout.as_secs()
                ))
            }
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────


