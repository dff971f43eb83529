//! Gateway command — orchestrates channels, agent loop, and message routing.
//!
//! Port of nanobot's gateway command from `cli/commands.py`.
//!
//! Startup sequence:
//! 1. Load config
//! 2. Create message bus
//! 3. Create agent loop (with provider, tools, sessions), connect MCP servers
//! 4. Create channel manager (operators register `Channel` implementations
//!    of their own before calling this, since concrete transports live
//!    outside this crate)
//! 5. Run: `tokio::select!` of agent loop + channel manager + cron + git updater
//! 6. Handle Ctrl+C for graceful shutdown

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use oxibot_agent::{AgentLoop, ExecToolConfig};
use oxibot_channels::ChannelManager;
use oxibot_core::bus::queue::MessageBus;
use oxibot_core::bus::types::OutboundMessage;
use oxibot_core::config::load_config;
use oxibot_core::git_update::GitUpdateService;
use oxibot_core::session::SessionManager;
use oxibot_cron::CronService;
use oxibot_providers::http_provider::create_provider;

use crate::helpers;

/// Run the gateway — starts the agent loop + channel manager.
pub async fn run() -> Result<()> {
    println!();
    helpers::print_banner();
    println!("  Mode: Gateway");
    println!();

    // 1. Load config
    let config = load_config(None);
    let defaults = &config.agents.defaults;

    // 2. Resolve workspace
    let workspace = helpers::expand_tilde(&defaults.workspace);
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("failed to create workspace: {}", workspace.display()))?;

    // 3. Create message bus (shared between agent + channels)
    let bus = Arc::new(MessageBus::new(100));

    // 4. Create provider
    let model = &defaults.model;
    let providers_map = config.providers.to_map();
    let provider = create_provider(model, &providers_map)
        .map_err(|e| anyhow::anyhow!(e))?;

    // 5. Brave API key
    let brave_key = if config.tools.web.search.api_key.is_empty() {
        None
    } else {
        Some(config.tools.web.search.api_key.clone())
    };

    // 6. Create session manager
    let session_manager = SessionManager::new(None)
        .context("failed to create session manager")?;

    // 7. Create agent loop, connect MCP servers, then Arc-wrap for sharing
    //    with the cron callback (connecting is async, `new()` stays sync).
    let mut agent_loop_inner = AgentLoop::new(
        bus.clone(),
        Arc::new(provider),
        workspace.clone(),
        Some(model.to_string()),
        Some(defaults.max_tool_iterations as usize),
        None,
        brave_key,
        Some(ExecToolConfig::default()),
        config.tools.restrict_to_workspace,
        Some(session_manager),
        None,
        Some(config.summary.clone()),
    );
    agent_loop_inner.connect_mcp_servers(&config.mcp_servers).await;
    let agent_loop = Arc::new(agent_loop_inner);

    let mcp_client = agent_loop.mcp_client();
    let mcp_health_check = {
        let mcp_client = mcp_client.clone();
        tokio::spawn(async move { mcp_client.run_health_check().await })
    };

    // 8. Create cron service
    let cron_service = Arc::new(CronService::new(bus.clone(), None));
    {
        let agent = agent_loop.clone();
        let bus = bus.clone();
        cron_service
            .set_on_job(Arc::new(move |job: oxibot_cron::CronJob| {
                let agent = agent.clone();
                let bus = bus.clone();
                Box::pin(async move {
                    let response = agent
                        .process_direct("cron", &job.id, &job.payload.message)
                        .await
                        .unwrap_or_else(|e| format!("Error: {e}"));

                    // Deliver result to channel if configured
                    if job.payload.deliver {
                        if let Some(ref chat_id) = job.payload.to {
                            let channel = job.payload.channel.as_deref().unwrap_or("cli");
                            let msg = OutboundMessage::new(channel, chat_id.as_str(), &response);
                            if let Err(e) = bus.publish_outbound(msg).await {
                                tracing::error!(error = %e, "failed to deliver cron result");
                            }
                        }
                    }

                    Ok(response)
                })
            }))
            .await;
    }

    // Pre-load to show job count in banner
    if let Err(e) = cron_service.load().await {
        tracing::warn!(error = %e, "failed to pre-load cron store");
    }
    let cron_jobs = cron_service.list_jobs().await;

    // 8b. Create git updater service
    let git_update_service = Arc::new(GitUpdateService::new(bus.clone(), None));
    if let Err(e) = git_update_service.load().await {
        tracing::warn!(error = %e, "failed to pre-load git update store");
    }
    git_update_service
        .set_repos(config.git_repos.clone())
        .await;

    // 9. Create channel manager. No concrete transports live in this crate —
    //    operators register `Channel` implementations of their own here
    //    before the gateway starts.
    let channel_manager = ChannelManager::new(bus.clone());

    info!(
        model = %model,
        workspace = %workspace.display(),
        channels = ?channel_manager.channel_names(),
        "gateway starting"
    );

    println!("  Model:     {}", model);
    println!("  Workspace: {}", workspace.display());
    println!("  Channels:  {} registered", channel_manager.len());
    if !cron_jobs.is_empty() {
        let enabled = cron_jobs.iter().filter(|j| j.enabled).count();
        println!("  Cron:      {} jobs ({} enabled)", cron_jobs.len(), enabled);
    }
    if !config.git_repos.is_empty() {
        let enabled = config.git_repos.iter().filter(|r| r.enabled).count();
        println!(
            "  Git repos: {} watched ({} enabled)",
            config.git_repos.len(),
            enabled
        );
    }
    if !config.mcp_servers.is_empty() {
        let connected = mcp_client.connected_server_names().await;
        println!(
            "  MCP servers: {} configured ({} connected)",
            config.mcp_servers.len(),
            connected.len()
        );
    }
    println!();

    if channel_manager.is_empty() {
        println!("  ⚠  No channels registered. The agent loop will run but");
        println!("     only process messages from the internal bus.");
        println!();
    }

    println!("  Ctrl+C to stop");
    println!();

    // 10. Run: agent loop + channel manager + cron + git updater concurrently
    //     Ctrl+C triggers graceful shutdown, in the order §5 specifies:
    //     agent loop -> MCP transports -> cron/git timers -> channels.
    tokio::select! {
        _ = agent_loop.run() => {
            info!("agent loop exited");
        }
        result = channel_manager.start_all() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "channel manager error");
            }
        }
        result = cron_service.start() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "cron service error");
            }
        }
        result = git_update_service.start() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "git update service error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("  Shutting down...");
            info!("received Ctrl+C, shutting down");
            mcp_health_check.abort();
            agent_loop.shutdown_mcp().await;
            cron_service.stop().await;
            git_update_service.stop().await;
            channel_manager.stop_all().await;
        }
    }

    println!("  Gateway stopped. Goodbye!");
    Ok(())
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
