//! Cron tool — lets the agent itself schedule, list, and cancel jobs.
//!
//! Port of nanobot's `agent/tools/cron.py` `CronTool`.
//!
//! Reads and writes the same JSON store file the background `CronService`
//! polls; the two never share in-memory state, only the file, so every
//! invocation here re-reads the store from disk.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use oxibot_cron::types::{CronJob, CronPayload, CronSchedule, CronStore};

use super::base::{optional_bool, optional_i64, optional_string, require_string, Tool};

/// Agent-facing tool wrapping the cron job store.
pub struct CronTool {
    store_path: PathBuf,
}

impl CronTool {
    /// Create a cron tool reading/writing the given store file.
    ///
    /// If `store_path` is `None`, defaults to `~/.oxibot/cron/jobs.json`,
    /// matching `CronService::new`'s default.
    pub fn new(store_path: Option<PathBuf>) -> Self {
        let path = store_path.unwrap_or_else(|| {
            oxibot_core::utils::get_data_path().join("cron").join("jobs.json")
        });
        Self { store_path: path }
    }

    async fn load_store(&self) -> anyhow::Result<CronStore> {
        if !self.store_path.exists() {
            return Ok(CronStore::new());
        }
        let data = tokio::fs::read_to_string(&self.store_path).await?;
        Ok(serde_json::from_str(&data)
            .map_err(|e| anyhow::anyhow!("failed to parse cron store: {e}"))?)
    }

    async fn save_store(&self, store: &CronStore) -> anyhow::Result<()> {
        if let Some(parent) = self.store_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(store)?;
        tokio::fs::write(&self.store_path, json).await?;
        Ok(())
    }

    async fn add(&self, params: &HashMap<String, Value>) -> anyhow::Result<String> {
        let name = require_string(params, "name")?;
        let message = require_string(params, "message")?;
        let deliver = optional_bool(params, "deliver");
        let channel = optional_string(params, "channel");
        let to = optional_string(params, "to");

        let at = optional_string(params, "at");
        let every_seconds = optional_i64(params, "every_seconds");
        let cron_expr = optional_string(params, "cron_expr");

        let schedule = match (at, every_seconds, cron_expr) {
            (Some(at), _, _) => {
                let dt = DateTime::parse_from_rfc3339(&at)
                    .map_err(|e| anyhow::anyhow!("invalid `at` timestamp (expected RFC 3339): {e}"))?;
                CronSchedule::at(dt.timestamp_millis())
            }
            (None, Some(secs), _) => {
                if secs <= 0 {
                    anyhow::bail!("`every_seconds` must be greater than zero");
                }
                CronSchedule::every(secs * 1000)
            }
            (None, None, Some(expr)) => {
                if expr.trim().is_empty() {
                    anyhow::bail!("`cron_expr` must not be empty");
                }
                CronSchedule::cron(expr)
            }
            (None, None, None) => {
                anyhow::bail!("must provide one of `at`, `every_seconds`, or `cron_expr`")
            }
        };

        let mut job = CronJob::new(
            name,
            schedule,
            CronPayload {
                message,
                deliver,
                channel,
                to,
                ..Default::default()
            },
        );
        let now_ms = Utc::now().timestamp_millis();
        job.state.next_run_at_ms = oxibot_cron::types::compute_next_run_from(&job.schedule, now_ms);

        let next_run = job
            .state
            .next_run_at_ms
            .and_then(DateTime::from_timestamp_millis)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| "never (schedule already elapsed)".to_string());

        let mut store = self.load_store().await?;
        let id = job.id.clone();
        let job_name = job.name.clone();
        store.add(job);
        self.save_store(&store).await?;

        Ok(format!(
            "Created scheduled task '{job_name}' (ID: {id})\n  Next run: {next_run}"
        ))
    }

    async fn list(&self) -> anyhow::Result<String> {
        let store = self.load_store().await?;
        if store.jobs.is_empty() {
            return Ok("No scheduled tasks.".to_string());
        }
        let mut lines = Vec::new();
        for job in &store.jobs {
            let next_run = job
                .state
                .next_run_at_ms
                .and_then(DateTime::from_timestamp_millis)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| "none".to_string());
            let status = if job.enabled { "enabled" } else { "disabled" };
            lines.push(format!(
                "- {} (ID: {}) [{}] next run: {}",
                job.name, job.id, status, next_run
            ));
        }
        Ok(lines.join("\n"))
    }

    async fn remove(&self, params: &HashMap<String, Value>) -> anyhow::Result<String> {
        let id = require_string(params, "id")?;
        let mut store = self.load_store().await?;
        if store.remove(&id) {
            self.save_store(&store).await?;
            Ok(format!("Removed scheduled task {id}"))
        } else {
            Ok(format!("No scheduled task found with ID {id}"))
        }
    }
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }

    fn description(&self) -> &str {
        "Schedule, list, or cancel recurring or one-shot agent tasks. Use \
         `action: \"add\"` with one of `at` (RFC 3339 timestamp), \
         `every_seconds`, or `cron_expr` (standard 5-field cron) to create a \
         task; `action: \"list\"` to see scheduled tasks; `action: \"remove\"` \
         with `id` to cancel one."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "list", "remove"],
                    "description": "Which cron operation to perform."
                },
                "name": { "type": "string", "description": "Name for the task (add)." },
                "message": { "type": "string", "description": "Prompt sent to the agent when the task fires (add)." },
                "at": { "type": "string", "description": "RFC 3339 timestamp for a one-shot task (add)." },
                "every_seconds": { "type": "integer", "description": "Interval in seconds for a recurring task (add)." },
                "cron_expr": { "type": "string", "description": "Standard 5-field cron expression (add)." },
                "deliver": { "type": "boolean", "description": "Whether to deliver the response to a channel (add)." },
                "channel": { "type": "string", "description": "Target channel name, required if deliver is true (add)." },
                "to": { "type": "string", "description": "Recipient within the channel, required if deliver is true (add)." },
                "id": { "type": "string", "description": "Task ID to cancel (remove)." }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let action = require_string(&params, "action")?;
        match action.as_str() {
            "add" => self.add(&params).await,
            "list" => self.list().await,
            "remove" => self.remove(&params).await,
            other => anyhow::bail!("unknown cron action: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tool(dir: &TempDir) -> CronTool {
        CronTool::new(Some(dir.path().join("jobs.json")))
    }

    fn params(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_add_every_seconds() {
        let dir = TempDir::new().unwrap();
        let t = tool(&dir);
        let result = t
            .execute(params(&[
                ("action", json!("add")),
                ("name", json!("check-in")),
                ("message", json!("how's it going")),
                ("every_seconds", json!(60)),
            ]))
            .await
            .unwrap();
        assert!(result.starts_with("Created scheduled task 'check-in'"));
    }

    #[tokio::test]
    async fn test_add_requires_schedule_field() {
        let dir = TempDir::new().unwrap();
        let t = tool(&dir);
        let result = t
            .execute(params(&[
                ("action", json!("add")),
                ("name", json!("nothing")),
                ("message", json!("x")),
            ]))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_add_rejects_zero_interval() {
        let dir = TempDir::new().unwrap();
        let t = tool(&dir);
        let result = t
            .execute(params(&[
                ("action", json!("add")),
                ("name", json!("bad")),
                ("message", json!("x")),
                ("every_seconds", json!(0)),
            ]))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_add_rejects_empty_cron_expr() {
        let dir = TempDir::new().unwrap();
        let t = tool(&dir);
        let result = t
            .execute(params(&[
                ("action", json!("add")),
                ("name", json!("bad")),
                ("message", json!("x")),
                ("cron_expr", json!("   ")),
            ]))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_list_empty() {
        let dir = TempDir::new().unwrap();
        let t = tool(&dir);
        let result = t.execute(params(&[("action", json!("list"))])).await.unwrap();
        assert_eq!(result, "No scheduled tasks.");
    }

    #[tokio::test]
    async fn test_add_list_remove_roundtrip() {
        let dir = TempDir::new().unwrap();
        let t = tool(&dir);
        t.execute(params(&[
            ("action", json!("add")),
            ("name", json!("daily")),
            ("message", json!("ping")),
            ("cron_expr", json!("0 9 * * *")),
        ]))
        .await
        .unwrap();

        let listed = t.execute(params(&[("action", json!("list"))])).await.unwrap();
        assert!(listed.contains("daily"));

        let store = t.load_store().await.unwrap();
        let id = store.jobs[0].id.clone();

        let removed = t
            .execute(params(&[("action", json!("remove")), ("id", json!(id))]))
            .await
            .unwrap();
        assert!(removed.starts_with("Removed scheduled task"));

        let listed_after = t.execute(params(&[("action", json!("list"))])).await.unwrap();
        assert_eq!(listed_after, "No scheduled tasks.");
    }

    #[tokio::test]
    async fn test_remove_nonexistent() {
        let dir = TempDir::new().unwrap();
        let t = tool(&dir);
        let result = t
            .execute(params(&[("action", json!("remove")), ("id", json!("nope"))]))
            .await
            .unwrap();
        assert!(result.starts_with("No scheduled task found"));
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let dir = TempDir::new().unwrap();
        let t = tool(&dir);
        let result = t.execute(params(&[("action", json!("bogus"))])).await;
        assert!(result.is_err());
    }
}
