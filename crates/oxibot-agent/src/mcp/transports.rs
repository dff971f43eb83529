//! MCP transports — stdio subprocess and HTTP/SSE, behind one shared trait.
//!
//! Grounded in `original_source/nanobot/agent/mcp/transports.py`, ported to
//! `tokio::process`/`reqwest` with a request/response correlation map instead
//! of per-call futures resolved inline.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Environment variable names always inherited by a spawned MCP server.
const BASE_ENV_VARS: &[&str] = &["PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM"];

/// Command basenames allowed to run as an MCP stdio server.
const COMMAND_ALLOWLIST: &[&str] = &[
    "npx", "uvx", "python", "python3", "node", "deno", "cargo", "docker", "java",
];

const SHELL_METACHARACTERS: &[char] = &['|', '&', ';', '$', '`', '\\', '>', '<', '\n', '\r'];

/// Names whose values are never logged, only warned-about, when overlaid
/// onto a spawned server's environment.
const SENSITIVE_NAME_FRAGMENTS: &[&str] = &[
    "KEY", "TOKEN", "SECRET", "PASSWORD", "CRED", "SESSION", "COOKIE",
];

/// Shared contract both transports implement.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, String>;
    fn is_running(&self) -> bool;
    async fn stop(&self);
}

/// Format a `tools/call` or `resources/read` `content` array into the single
/// standardized string the agent loop ultimately sees.
pub fn coerce_content(content: &[Value]) -> String {
    let parts: Vec<String> = content
        .iter()
        .filter_map(|item| {
            let kind = item.get("type").and_then(Value::as_str)?;
            match kind {
                "text" => Some(item.get("text").and_then(Value::as_str).unwrap_or("").to_string()),
                "resource" => {
                    let uri = item.get("uri").and_then(Value::as_str).unwrap_or("");
                    Some(format!("[Resource: {uri}]"))
                }
                "image" => {
                    let mime = item
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .unwrap_or("image/png");
                    let len = item.get("data").and_then(Value::as_str).unwrap_or("").len();
                    Some(format!("[Image: {mime}, {len} chars]"))
                }
                _ => None,
            }
        })
        .collect();
    if parts.is_empty() {
        "Tool executed successfully".to_string()
    } else {
        parts.join("\n")
    }
}

fn validate_command(command: &str, args: &[String]) -> Result<(), String> {
    let basename = std::path::Path::new(command)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(command);
    if !COMMAND_ALLOWLIST.contains(&basename) {
        return Err(format!("command '{basename}' is not in the MCP server allowlist"));
    }
    let has_meta = |s: &str| s.chars().any(|c| SHELL_METACHARACTERS.contains(&c));
    if has_meta(command) || args.iter().any(|a| has_meta(a)) {
        return Err("command or arguments contain shell metacharacters".to_string());
    }
    Ok(())
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

// ─────────────────────────────────────────────
// StdioTransport
// ─────────────────────────────────────────────

/// Spawns `command args`, speaks JSON-RPC 2.0 over stdin/stdout.
pub struct StdioTransport {
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<tokio::process::ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    client_name: String,
}

impl StdioTransport {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            reader_task: Mutex::new(None),
            client_name: client_name.into(),
        }
    }

    pub async fn start(
        &self,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<(), String> {
        validate_command(command, args)?;

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear();

        for name in BASE_ENV_VARS {
            if let Ok(val) = std::env::var(name) {
                cmd.env(name, val);
            }
        }
        for (k, v) in env {
            if SENSITIVE_NAME_FRAGMENTS
                .iter()
                .any(|frag| k.to_uppercase().contains(frag))
            {
                warn!(var = %k, "overlaying sensitive-looking env var onto MCP server process");
            }
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn '{command}': {e}"))?;

        let stdout = child.stdout.take().ok_or("no stdout pipe")?;
        let stdin = child.stdin.take().ok_or("no stdin pipe")?;

        let pending = self.pending.clone();
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(msg) => handle_message(&pending, msg).await,
                            Err(e) => warn!(error = %e, "failed to parse MCP JSON-RPC message"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "error reading MCP server stdout");
                        break;
                    }
                }
            }
            // EOF: fail every still-pending request.
            let mut pending = pending.lock().await;
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err("Connection closed".to_string()));
            }
        });

        *self.child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);
        *self.reader_task.lock().await = Some(handle);

        self.call(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": self.client_name, "version": env!("CARGO_PKG_VERSION")},
            }),
        )
        .await?;
        self.notify("notifications/initialized", json!({})).await?;
        Ok(())
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.write_line(&request).await.map_err(|e| {
            self.pending.try_lock().map(|mut p| p.remove(&id));
            e
        })?;

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err("MCP response channel closed".to_string()),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err("MCP request timed out".to_string())
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), String> {
        let notification = json!({"jsonrpc": "2.0", "method": method, "params": params});
        self.write_line(&notification).await
    }

    async fn write_line(&self, value: &Value) -> Result<(), String> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or("MCP transport not connected")?;
        let mut line = serde_json::to_string(value).map_err(|e| e.to_string())?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("failed to write MCP request: {e}"))?;
        stdin.flush().await.map_err(|e| e.to_string())
    }
}

async fn handle_message(pending: &PendingMap, msg: Value) {
    let Some(id) = msg.get("id").and_then(Value::as_u64) else {
        debug!(?msg, "MCP notification (ignored)");
        return;
    };
    let tx = pending.lock().await.remove(&id);
    let Some(tx) = tx else { return };
    if let Some(err) = msg.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let _ = tx.send(Err(message));
    } else {
        let _ = tx.send(Ok(msg.get("result").cloned().unwrap_or(Value::Null)));
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn call(&self, method: &str, params: Value) -> Result<Value, String> {
        self.send_request(method, params).await
    }

    fn is_running(&self) -> bool {
        self.child
            .try_lock()
            .map(|c| c.is_some())
            .unwrap_or(true)
    }

    async fn stop(&self) {
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err("Connection closed".to_string()));
        }
        *self.stdin.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(STOP_GRACE, child.wait()).await;
        }
    }
}

// ─────────────────────────────────────────────
// SseTransport
// ─────────────────────────────────────────────

/// HTTP/SSE transport: probes for the live endpoint, then POSTs JSON-RPC.
pub struct SseTransport {
    client: reqwest::Client,
    base_url: String,
    endpoint: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl SseTransport {
    pub fn new(url: &str, timeout_s: u64) -> Result<Self, String> {
        check_url_allowed(url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            endpoint: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    pub async fn start(&self) -> Result<(), String> {
        for path in ["/mcp", "/sse", "/"] {
            let candidate = format!("{}{path}", self.base_url);
            if self.client.get(&candidate).send().await.is_ok() {
                *self.endpoint.lock().await = Some(candidate);
                return Ok(());
            }
        }
        *self.endpoint.lock().await = Some(format!("{}/mcp", self.base_url));
        Ok(())
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn call(&self, method: &str, params: Value) -> Result<Value, String> {
        let endpoint = self
            .endpoint
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| format!("{}/mcp", self.base_url));
        check_url_allowed(&endpoint)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});

        let response = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("MCP request error: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("MCP HTTP error: {}", response.status()));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| format!("failed to parse MCP response: {e}"))?;

        if let Some(err) = data.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(message);
        }
        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }

    fn is_running(&self) -> bool {
        self.endpoint.try_lock().map(|e| e.is_some()).unwrap_or(true)
    }

    async fn stop(&self) {
        *self.endpoint.lock().await = None;
    }
}

/// SSRF defense: reject anything but loopback/private-safe/public hostnames
/// resolving away from link-local and cloud-metadata ranges.
fn check_url_allowed(url: &str) -> Result<(), String> {
    let parsed = url::Url::parse(url).map_err(|e| format!("invalid MCP server URL: {e}"))?;
    match parsed.scheme() {
        "http" | "https" | "ws" | "wss" => {}
        other => return Err(format!("unsupported MCP server URL scheme: {other}")),
    }

    let Some(host) = parsed.host_str() else {
        return Err("MCP server URL has no host".to_string());
    };

    if host == "169.254.169.254" || host == "100.100.100.200" {
        return Err("MCP server URL targets a cloud metadata endpoint".to_string());
    }
    if host == "localhost" {
        return Ok(());
    }

    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return check_ip_allowed(ip);
    }

    // Hostname: resolve and re-check. DNS failure is tolerated (permits
    // `.local`/mDNS names a resolver here cannot see).
    let lookup_host = format!("{host}:0");
    match std::net::ToSocketAddrs::to_socket_addrs(&lookup_host) {
        Ok(addrs) => {
            for addr in addrs {
                check_ip_allowed(addr.ip())?;
            }
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

fn check_ip_allowed(ip: std::net::IpAddr) -> Result<(), String> {
    use std::net::IpAddr;
    let blocked = match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                && false // loopback handled by caller via "localhost"/explicit 127.0.0.1 below
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() && false
                || (v6.segments()[0] & 0xfe00) == 0xfc00 // unique-local (fc00::/7)
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // link-local (fe80::/10)
        }
    };
    let is_explicit_loopback = matches!(ip, IpAddr::V4(v4) if v4.is_loopback())
        || matches!(ip, IpAddr::V6(v6) if v6.is_loopback());
    if is_explicit_loopback {
        return Ok(());
    }
    if blocked {
        return Err(format!("MCP server URL resolves to a disallowed address: {ip}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_text_block() {
        let content = vec![json!({"type": "text", "text": "hi there"})];
        assert_eq!(coerce_content(&content), "hi there");
    }

    #[test]
    fn test_coerce_resource_and_image() {
        let content = vec![
            json!({"type": "text", "text": "A"}),
            json!({"type": "resource", "uri": "u"}),
            json!({"type": "image", "mimeType": "image/png", "data": "abcd"}),
        ];
        assert_eq!(
            coerce_content(&content),
            "A\n[Resource: u]\n[Image: image/png, 4 chars]"
        );
    }

    #[test]
    fn test_coerce_empty_defaults() {
        assert_eq!(coerce_content(&[]), "Tool executed successfully");
    }

    #[test]
    fn test_validate_command_rejects_unknown_binary() {
        assert!(validate_command("rm", &[]).is_err());
    }

    #[test]
    fn test_validate_command_rejects_metacharacters() {
        assert!(validate_command("npx", &["foo; rm -rf /".to_string()]).is_err());
    }

    #[test]
    fn test_validate_command_allows_known_binary() {
        assert!(validate_command("npx", &["-y".to_string(), "some-mcp-server".to_string()]).is_ok());
    }

    #[test]
    fn test_check_url_allowed_rejects_metadata_endpoint() {
        assert!(check_url_allowed("http://169.254.169.254/latest").is_err());
    }

    #[test]
    fn test_check_url_allowed_permits_localhost() {
        assert!(check_url_allowed("http://localhost:8080/mcp").is_ok());
    }

    #[test]
    fn test_check_url_allowed_rejects_private_ip() {
        assert!(check_url_allowed("http://10.0.0.5:8080/mcp").is_err());
    }

    #[test]
    fn test_check_url_allowed_rejects_bad_scheme() {
        assert!(check_url_allowed("ftp://example.com/mcp").is_err());
    }

    #[test]
    fn test_check_url_allowed_rejects_ipv6_link_local() {
        assert!(check_url_allowed("http://[fe80::1]/mcp").is_err());
    }

    #[test]
    fn test_check_url_allowed_rejects_ipv6_unique_local() {
        assert!(check_url_allowed("http://[fc00::1]/mcp").is_err());
    }

    #[test]
    fn test_check_url_allowed_permits_ipv6_loopback() {
        assert!(check_url_allowed("http://[::1]/mcp").is_ok());
    }
}
