// ABOUTME: kafclaw binary: serve the agent hub, manage pairing, inspect state.
// ABOUTME: Initializes logging, config, stores, and the agent loop with ctrl-c shutdown.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kafclaw::agent::{AgentLoop, LoopOptions};
use kafclaw::bus::MessageBus;
use kafclaw::channels::diagnostics::{
    collect_channel_account_diagnostics, collect_unsafe_group_policy_warnings,
};
use kafclaw::channels::pairing::PairingService;
use kafclaw::channels::pairing_messages::PAIRING_APPROVED_MESSAGE;
use kafclaw::config::Config;
use kafclaw::group::{spawn_knowledge_consumers, KnowledgeHandler};
use kafclaw::paths;
use kafclaw::session::SessionManager;
use kafclaw::timeline::TimelineService;
use kafclaw_agent::{MockProvider, NullToolExecutor};

#[derive(Parser)]
#[command(name = "kafclaw", about = "Multi-channel conversational agent hub")]
struct Cli {
    /// Config file path (defaults to ./kafclaw.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent hub
    Serve,
    /// Manage pending sender approvals
    Pairing {
        #[command(subcommand)]
        command: PairingCommand,
    },
    /// Inspect or delete conversation sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// Show recent timeline events
    Timeline {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Report config health: policy warnings and account diagnostics
    Doctor,
}

#[derive(Subcommand)]
enum PairingCommand {
    /// List pending pairing requests
    List,
    /// Approve a pairing code and add the sender to the allow-list
    Approve { channel: String, code: String },
    /// Deny a pairing code
    Deny { channel: String, code: String },
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// List persisted sessions
    List,
    /// Delete a session by key
    Delete { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Pairing { command } => pairing(cli.config, config, command),
        Command::Sessions { command } => sessions(config, command),
        Command::Timeline { limit } => timeline(config, limit),
        Command::Doctor => doctor(&config),
    }
}

fn open_timeline(config: &Config) -> Result<Arc<TimelineService>> {
    let path = if config.timeline.path.trim().is_empty() {
        paths::timeline_db()
    } else {
        PathBuf::from(&config.timeline.path)
    };
    Ok(Arc::new(TimelineService::new(path)?))
}

fn open_sessions(config: &Config) -> SessionManager {
    let dir = config.sessions.dir.trim();
    if dir.is_empty() {
        SessionManager::new(None)
    } else {
        SessionManager::new(Some(std::path::Path::new(dir)))
    }
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!(
        session_scope = %config.agent.session_scope,
        workspace = %config.agent.workspace,
        group_enabled = config.group.enabled,
        "Starting kafclaw"
    );
    for warning in collect_unsafe_group_policy_warnings(&config) {
        tracing::warn!(warning = %warning, "Unsafe policy configuration");
    }

    let timeline = open_timeline(&config)?;
    let sessions = open_sessions(&config);
    let bus = MessageBus::new();
    let pairing = Arc::new(PairingService::new(timeline.clone()));
    let config = Arc::new(config);

    // Channel adapters register here; real protocol bindings live outside
    // this crate and attach through ChannelRegistry::bind_outbound.
    let registry = kafclaw::channels::ChannelRegistry::new();
    registry.bind_outbound(&bus, Some(timeline.clone()));
    if registry.names().is_empty() {
        tracing::warn!("No channel adapters registered; inbound must arrive via embedding code");
    }

    let cancel = CancellationToken::new();

    let mut consumer_handles = Vec::new();
    if config.group.enabled {
        let handler = Arc::new(KnowledgeHandler::new(
            timeline.clone(),
            &config.group.claw_id,
        ));
        consumer_handles =
            spawn_knowledge_consumers(&config.group, handler, cancel.clone()).await?;
    }

    // The LLM provider is a collaborator; until one is wired through the
    // embedding API the mock keeps the loop functional end to end.
    let agent_loop = Arc::new(AgentLoop::new(LoopOptions {
        bus,
        sessions,
        provider: Arc::new(MockProvider::new()),
        tools: Arc::new(NullToolExecutor),
        pairing: Some(pairing),
        timeline: Some(timeline),
        config: Arc::clone(&config),
    }));

    let loop_handle = {
        let agent_loop = Arc::clone(&agent_loop);
        let cancel = cancel.clone();
        tokio::spawn(async move { agent_loop.run(cancel).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    cancel.cancel();
    let _ = loop_handle.await;
    for handle in consumer_handles {
        let _ = handle.await;
    }
    Ok(())
}

fn pairing(
    config_path: Option<PathBuf>,
    mut config: Config,
    command: PairingCommand,
) -> Result<()> {
    let timeline = open_timeline(&config)?;
    let service = PairingService::new(timeline);

    match command {
        PairingCommand::List => {
            let pending = service.list_pending()?;
            if pending.is_empty() {
                println!("No pending pairing requests.");
                return Ok(());
            }
            for entry in pending {
                println!(
                    "{}  {}  {}  expires {}",
                    entry.channel,
                    entry.code,
                    entry.sender_id,
                    entry.expires_at.to_rfc3339()
                );
            }
        }
        PairingCommand::Approve { channel, code } => {
            let entry = service.approve(&mut config, &channel, &code)?;
            let path = config_path.unwrap_or_else(paths::config_file);
            config.save(&path)?;
            println!(
                "Approved {} on {}; allow-list updated in {}",
                entry.sender_id,
                entry.channel,
                path.display()
            );
            println!("Notify the sender: {PAIRING_APPROVED_MESSAGE}");
        }
        PairingCommand::Deny { channel, code } => {
            let entry = service.deny(&channel, &code)?;
            println!("Denied {} on {}", entry.sender_id, entry.channel);
        }
    }
    Ok(())
}

fn sessions(config: Config, command: SessionsCommand) -> Result<()> {
    let manager = open_sessions(&config);
    match command {
        SessionsCommand::List => {
            let infos = manager.list();
            if infos.is_empty() {
                println!("No sessions.");
                return Ok(());
            }
            for info in infos {
                println!(
                    "{}  {} messages  updated {}",
                    info.key,
                    info.message_count,
                    info.updated_at.to_rfc3339()
                );
            }
        }
        SessionsCommand::Delete { key } => {
            if manager.delete(&key) {
                println!("Deleted session {key}");
            } else {
                println!("No session found for {key}");
            }
        }
    }
    Ok(())
}

fn timeline(config: Config, limit: usize) -> Result<()> {
    let timeline = open_timeline(&config)?;
    let events = timeline.recent_events(limit)?;
    if events.is_empty() {
        println!("No timeline events.");
        return Ok(());
    }
    for event in events {
        println!(
            "{}  {}  {}  {}",
            event.timestamp.to_rfc3339(),
            event.classification,
            event.sender_id,
            event.content_text
        );
    }
    Ok(())
}

fn doctor(config: &Config) -> Result<()> {
    let warnings = collect_unsafe_group_policy_warnings(config);
    if warnings.is_empty() {
        println!("Policy: no warnings.");
    } else {
        println!("Policy warnings:");
        for warning in &warnings {
            println!("  - {warning}");
        }
    }

    println!("Accounts:");
    for diag in collect_channel_account_diagnostics(config) {
        let state = if diag.enabled { "enabled" } else { "disabled" };
        if diag.issues.is_empty() {
            println!("  {} ({}/{}): ok", diag.channel, diag.account, state);
        } else {
            println!("  {} ({}/{}):", diag.channel, diag.account, state);
            for issue in &diag.issues {
                println!("    - {issue}");
            }
        }
    }

    if config.group.enabled {
        match kafclaw::group::build_kafka_dialer(&config.group) {
            Ok(dialer) => println!(
                "Broker: ok (host {}, protocol {})",
                dialer.host,
                if dialer.security_protocol.is_empty() {
                    "PLAINTEXT"
                } else {
                    &dialer.security_protocol
                }
            ),
            Err(error) => println!("Broker: config invalid: {error:#}"),
        }
    }
    Ok(())
}
