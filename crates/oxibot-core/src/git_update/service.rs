//! Git updater service — per-repo timers that fetch, compare, and rebase.
//!
//! Port of nanobot's `git_update/service.py`. Structurally mirrors
//! `oxibot_cron::service::CronService`: a single soonest-next-wake timer over
//! all configured repos, re-armable when config changes, with a shutdown
//! signal.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::bus::queue::MessageBus;
use crate::bus::types::OutboundMessage;

use super::types::{GitRepoConfig, GitUpdateStatus, GitUpdateStore};

const GIT_TIMEOUT: Duration = Duration::from_secs(60);
const HOOK_TIMEOUT: Duration = Duration::from_secs(300);

/// Background service that keeps a set of repos in sync with their remotes.
pub struct GitUpdateService {
    store_path: PathBuf,
    repos: Mutex<Vec<GitRepoConfig>>,
    store: Arc<Mutex<GitUpdateStore>>,
    bus: Arc<MessageBus>,
    shutdown: Arc<Notify>,
    rearm: Arc<Notify>,
}

impl GitUpdateService {
    pub fn new(bus: Arc<MessageBus>, store_path: Option<PathBuf>) -> Self {
        let path = store_path.unwrap_or_else(|| {
            crate::utils::get_data_path().join("git_update").join("state.json")
        });
        Self {
            store_path: path,
            repos: Mutex::new(Vec::new()),
            store: Arc::new(Mutex::new(GitUpdateStore::new())),
            bus,
            shutdown: Arc::new(Notify::new()),
            rearm: Arc::new(Notify::new()),
        }
    }

    /// Replace the set of watched repos.
    pub async fn set_repos(&self, repos: Vec<GitRepoConfig>) {
        {
            let mut guard = self.repos.lock().await;
            *guard = repos;
        }
        self.rearm.notify_one();
    }

    pub async fn load(&self) -> anyhow::Result<()> {
        if !self.store_path.exists() {
            return Ok(());
        }
        let data = tokio::fs::read_to_string(&self.store_path).await?;
        let loaded: GitUpdateStore = serde_json::from_str(&data)
            .map_err(|e| anyhow::anyhow!("failed to parse git-update store: {e}"))?;
        let mut store = self.store.lock().await;
        *store = loaded;
        Ok(())
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.store_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let store = self.store.lock().await;
        let json = serde_json::to_string_pretty(&*store)?;
        tokio::fs::write(&self.store_path, json).await?;
        Ok(())
    }

    /// Run the per-repo check loop until `stop()` is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        if let Err(e) = self.load().await {
            warn!(error = %e, "failed to load git-update store, starting empty");
        }
        info!("git update service started");

        loop {
            let sleep_for = self.time_until_next_check().await;

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {
                    self.check_due_repos().await;
                }
                _ = self.rearm.notified() => {
                    debug!("git update timer re-armed");
                }
                _ = self.shutdown.notified() => {
                    info!("git update service shutting down");
                    return Ok(());
                }
            }
        }
    }

    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    async fn time_until_next_check(&self) -> Duration {
        let repos = self.repos.lock().await;
        if repos.is_empty() {
            return Duration::from_secs(3600);
        }
        let store = self.store.lock().await;
        let now = Utc::now().timestamp_millis();
        let next = repos
            .iter()
            .filter(|r| r.enabled)
            .filter_map(|r| store.find(&r.id).and_then(|s| s.next_run_ms))
            .min();
        match next {
            Some(ms) => Duration::from_millis((ms - now).max(0) as u64),
            // No state recorded yet for any repo — check soon.
            None => Duration::from_secs(5),
        }
    }

    async fn check_due_repos(&self) {
        let repos: Vec<GitRepoConfig> = {
            let repos = self.repos.lock().await;
            repos.iter().filter(|r| r.enabled).cloned().collect()
        };
        let now = Utc::now().timestamp_millis();
        for repo in repos {
            let due = {
                let store = self.store.lock().await;
                store
                    .find(&repo.id)
                    .and_then(|s| s.next_run_ms)
                    .map(|ms| ms <= now)
                    .unwrap_or(true)
            };
            if due {
                self.check_repo(&repo).await;
            }
        }
        if let Err(e) = self.save().await {
            error!(error = %e, "failed to save git-update store");
        }
    }

    /// Run a single update check for one repo (public for direct/manual invocation).
    pub async fn check_repo(&self, repo: &GitRepoConfig) {
        info!(repo = %repo.id, path = %repo.path, "checking repo for updates");
        let outcome = self.update_repo(repo).await;

        let now_ms = Utc::now().timestamp_millis();
        let next_ms = next_check_ms(&repo.cron_expr, now_ms);

        let mut store = self.store.lock().await;
        let state = store.get_or_insert(&repo.id);
        state.last_run_ms = Some(now_ms);
        state.next_run_ms = next_ms;

        match outcome {
            Ok((status, new_commit, summary)) => {
                state.last_status = Some(status.clone());
                state.last_error = None;
                if let Some(commit) = new_commit {
                    state.last_commit = Some(commit);
                }
                if status == GitUpdateStatus::Updated {
                    state.updates_applied += 1;
                }
                drop(store);

                if matches!(status, GitUpdateStatus::Updated) && repo.notify_on_change {
                    self.notify(repo, &summary).await;
                }
                if matches!(status, GitUpdateStatus::Conflict) {
                    self.run_hooks(&repo.on_conflict, &repo.path).await;
                }
            }
            Err(e) => {
                error!(repo = %repo.id, error = %e, "git update check failed");
                state.last_status = Some(GitUpdateStatus::Error);
                state.last_error = Some(e.to_string());
            }
        }
    }

    async fn notify(&self, repo: &GitRepoConfig, summary: &str) {
        if let (Some(channel), Some(to)) = (&repo.notify_channel, &repo.notify_chat_id) {
            let outbound = OutboundMessage {
                channel: channel.clone(),
                chat_id: to.clone(),
                content: format!("Repo `{}` updated:\n{}", repo.path, summary),
                reply_to: None,
                media: Vec::new(),
                metadata: std::collections::HashMap::new(),
            };
            if let Err(e) = self.bus.publish_outbound(outbound).await {
                error!(error = %e, "failed to deliver git-update notification");
            }
        }
    }

    /// Fetch → compare → rebase a single repo. Returns the resulting status,
    /// the new HEAD commit (if changed), and a human-readable change summary.
    async fn update_repo(
        &self,
        repo: &GitRepoConfig,
    ) -> anyhow::Result<(GitUpdateStatus, Option<String>, String)> {
        let path = Path::new(&repo.path);

        let old_head = git(path, &["rev-parse", "HEAD"]).await?;
        git(path, &["fetch", "origin", &repo.branch]).await?;
        let remote_head = git(path, &["rev-parse", &format!("origin/{}", repo.branch)]).await?;

        if old_head == remote_head {
            return Ok((GitUpdateStatus::NoChange, None, String::new()));
        }

        let summary = git(
            path,
            &["log", "--oneline", &format!("{old_head}..{remote_head}")],
        )
        .await
        .unwrap_or_default();

        let status_out = git(path, &["status", "--porcelain"]).await?;
        let has_local_changes = !status_out.trim().is_empty();

        if !has_local_changes {
            git(path, &["pull", "--rebase", "origin", &repo.branch]).await?;
            let new_head = git(path, &["rev-parse", "HEAD"]).await?;
            self.run_hooks(&repo.on_update, &repo.path).await;
            return Ok((GitUpdateStatus::Updated, Some(new_head), summary));
        }

        let stash_msg = format!("{}-auto-update-stash", repo.id);
        git(path, &["stash", "push", "-m", &stash_msg]).await?;

        let rebase = git_allow_failure(path, &["rebase", &format!("origin/{}", repo.branch)]).await;
        let conflict = rebase.is_err() || {
            git(path, &["status", "--porcelain"])
                .await
                .map(|s| s.contains("UU"))
                .unwrap_or(false)
        };

        if conflict {
            let _ = git_allow_failure(path, &["rebase", "--abort"]).await;
            let _ = git_allow_failure(path, &["stash", "pop"]).await;
            return Ok((GitUpdateStatus::Conflict, None, summary));
        }

        git(path, &["stash", "pop"]).await?;
        let new_head = git(path, &["rev-parse", "HEAD"]).await?;
        self.run_hooks(&repo.on_update, &repo.path).await;
        Ok((GitUpdateStatus::Updated, Some(new_head), summary))
    }

    async fn run_hooks(&self, hooks: &[String], cwd: &str) {
        for hook in hooks {
            debug!(hook = %hook, "running git-update hook");
            let result = tokio::time::timeout(
                HOOK_TIMEOUT,
                Command::new("sh")
                    .arg("-c")
                    .arg(hook)
                    .current_dir(cwd)
                    .stdin(Stdio::null())
                    .output(),
            )
            .await;

            match result {
                Ok(Ok(output)) if !output.status.success() => {
                    warn!(hook = %hook, status = ?output.status, "hook exited non-zero");
                }
                Ok(Err(e)) => warn!(hook = %hook, error = %e, "failed to spawn hook"),
                Err(_) => warn!(hook = %hook, "hook timed out"),
                _ => {}
            }
        }
    }
}

/// Compute the next check timestamp (ms) for a repo's cron expression.
///
/// Accepts standard 5-field expressions (padded with a leading `"0 "` for
/// the `cron` crate's 6-field seconds-first grammar) as well as native
/// 6-field expressions.
fn next_check_ms(cron_expr: &str, now_ms: i64) -> Option<i64> {
    let field_count = cron_expr.split_whitespace().count();
    let padded;
    let expr = if field_count == 5 {
        padded = format!("0 {cron_expr}");
        padded.as_str()
    } else {
        cron_expr
    };
    let schedule: cron::Schedule = expr.parse().ok()?;
    let now_dt = chrono::DateTime::<Utc>::from_timestamp_millis(now_ms)?;
    schedule.after(&now_dt).next().map(|dt| dt.timestamp_millis())
}

/// Run a git subcommand, returning trimmed stdout. 60s timeout, no shell.
async fn git(cwd: &Path, args: &[&str]) -> anyhow::Result<String> {
    let out = run_git(cwd, args).await?;
    if !out.status.success() {
        anyhow::bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Like `git`, but returns `Err` on non-zero exit without treating it as a
/// hard stop (used for `rebase`, where a conflict is an expected outcome).
async fn git_allow_failure(cwd: &Path, args: &[&str]) -> anyhow::Result<String> {
    let out = run_git(cwd, args).await?;
    if !out.status.success() {
        anyhow::bail!("git {} exited non-zero", args.join(" "));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

async fn run_git(cwd: &Path, args: &[&str]) -> anyhow::Result<std::process::Output> {
    tokio::time::timeout(
        GIT_TIMEOUT,
        Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("git {} timed out", args.join(" ")))?
    .map_err(|e| anyhow::anyhow!("failed to spawn git {}: {e}", args.join(" ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_bus() -> Arc<MessageBus> {
        Arc::new(MessageBus::new(10))
    }

    async fn init_repo(dir: &Path) {
        Command::new("git").arg("init").arg("-q").current_dir(dir).output().await.unwrap();
        Command::new("git").args(["config", "user.email", "a@b.c"]).current_dir(dir).output().await.unwrap();
        Command::new("git").args(["config", "user.name", "test"]).current_dir(dir).output().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_repos_sleeps_long() {
        let svc = GitUpdateService::new(make_bus(), None);
        let d = svc.time_until_next_check().await;
        assert!(d >= Duration::from_secs(3000));
    }

    #[tokio::test]
    async fn test_set_repos_and_check_no_remote_fails_gracefully() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;
        tokio::fs::write(dir.path().join("f.txt"), "hi").await.unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir.path()).output().await.unwrap();
        Command::new("git").args(["commit", "-q", "-m", "init"]).current_dir(dir.path()).output().await.unwrap();

        let store_path = dir.path().join("state.json");
        let svc = GitUpdateService::new(make_bus(), Some(store_path));
        let repo = GitRepoConfig::new(dir.path().to_str().unwrap());

        // No `origin` remote configured — update_repo should error, and
        // check_repo should record that as an Error status, not panic.
        svc.check_repo(&repo).await;
    }

    #[tokio::test]
    async fn test_stop_does_not_panic() {
        let svc = GitUpdateService::new(make_bus(), None);
        svc.stop().await;
    }
}
