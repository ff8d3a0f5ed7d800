//! ZeptoClaw: personal AI-agent control plane.
//!
//! Usage:
//!   zeptoclaw init        Write a default config with fresh tokens
//!   zeptoclaw serve       Run the gateway and its heartbeat daemon
//!   zeptoclaw watchdog    Run the edge watchdog
//!   zeptoclaw status      Show persisted gateway state

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use zeptoclaw::config::{self, ZeptoClawConfig};
use zeptoclaw::heartbeat::{self, HeartbeatDaemon};
use zeptoclaw::logs::LogBuffer;
use zeptoclaw::server::{self, AppState};
use zeptoclaw::state::store::{derive_health, STATE_FILE};
use zeptoclaw::state::JsonStore;
use zeptoclaw::types::ZeptoClawState;
use zeptoclaw::watchdog::{self, alerts, monitor, EdgeWatchdog, Relay};

const CONFIG_FILE: &str = "zeptoclaw.toml";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "zeptoclaw")]
#[command(version)]
#[command(about = "Personal AI-agent control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to zeptoclaw home directory.
    #[arg(long, default_value = "~/.zeptoclaw")]
    home: String,

    /// Log level (debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config with freshly generated tokens.
    Init,

    /// Run the gateway (HTTP/WebSocket API + heartbeat daemon).
    Serve,

    /// Run the edge watchdog.
    Watchdog,

    /// Show the gateway's persisted state.
    Status,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logs = LogBuffer::default();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(logs.layer())
        .init();

    let home_dir = PathBuf::from(shellexpand::tilde(&cli.home).into_owned());

    match cli.command {
        Commands::Init => cmd_init(&home_dir),
        Commands::Serve => cmd_serve(&home_dir, logs).await,
        Commands::Watchdog => cmd_watchdog(&home_dir).await,
        Commands::Status => cmd_status(&home_dir),
    }
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

fn cmd_init(home_dir: &Path) -> Result<()> {
    let config_path = home_dir.join(CONFIG_FILE);
    if config_path.exists() {
        anyhow::bail!(
            "Config already exists at {}; remove it first to re-initialise",
            config_path.display()
        );
    }
    std::fs::create_dir_all(home_dir)
        .with_context(|| format!("Failed to create home directory: {}", home_dir.display()))?;

    let mut cfg = ZeptoClawConfig::default();
    cfg.gateway.admin_token = config::generate_token();
    cfg.gateway.workspace_token = config::generate_token();
    let under_home = |name: &str| home_dir.join(name).display().to_string();
    cfg.gateway.state_dir = under_home("state");
    cfg.gateway.workspace_dir = under_home("workspace");
    cfg.heartbeat.schedule_path = under_home("heartbeat.yml");
    cfg.watchdog.state_dir = under_home("watchdog");
    config::save_config(&cfg, &config_path)?;

    let heartbeat_path = cfg.resolved_heartbeat_path();
    if !heartbeat_path.exists() {
        zeptoclaw::state::write_atomic(&heartbeat_path, heartbeat::default_heartbeat_yaml()?.as_bytes())
            .with_context(|| format!("Failed to write {}", heartbeat_path.display()))?;
    }

    println!("{} Wrote {}", ">>>".green().bold(), config_path.display());
    println!();
    println!("  {}: {}", "Admin token".bold(), cfg.gateway.admin_token);
    println!("  {}: {}", "Workspace token".bold(), cfg.gateway.workspace_token);
    println!();
    println!("{}", "Store these now; they are not shown again.".yellow());
    Ok(())
}

async fn cmd_serve(home_dir: &Path, logs: LogBuffer) -> Result<()> {
    let config_path = home_dir.join(CONFIG_FILE);
    let cfg = load(&config_path)?;
    config::validate(&cfg).context("Invalid gateway config")?;

    let bind = cfg.gateway.bind.clone();
    let entries = heartbeat::load_entries(&cfg.resolved_heartbeat_path())?;
    let app = AppState::open(cfg, config_path, logs)
        .await
        .context("Failed to open gateway state")?;
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;

    println!("{} Gateway starting on {}", ">>>".green().bold(), bind);

    let cancel = CancellationToken::new();

    let mut daemon = HeartbeatDaemon::new(app.clone(), entries);
    let heartbeat_cancel = cancel.clone();
    let heartbeat_handle = tokio::spawn(async move { daemon.run(heartbeat_cancel).await });

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(app, listener, server_cancel).await {
            error!("Gateway server error: {:#}", e);
        }
    });

    wait_for_shutdown(cancel, vec![("heartbeat", heartbeat_handle), ("gateway", server_handle)]).await?;
    info!("Gateway shutdown complete");
    Ok(())
}

async fn cmd_watchdog(home_dir: &Path) -> Result<()> {
    let cfg = load(&home_dir.join(CONFIG_FILE))?;
    config::validate_watchdog(&cfg).context("Invalid watchdog config")?;

    let sink = alerts::sink_from_config(&cfg.watchdog.alert_webhook_url);
    let edge = Arc::new(
        EdgeWatchdog::open(
            &cfg.resolved_watchdog_state_dir(),
            &cfg.watchdog,
            cfg.retention.alerts,
            sink,
            Relay::default(),
        )
        .context("Failed to open watchdog state")?,
    );
    let bind = cfg.watchdog.bind.clone();
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;

    println!(
        "{} Watchdog starting on {} ({} gateway(s))",
        ">>>".green().bold(),
        bind,
        cfg.watchdog.gateways.len()
    );

    let cancel = CancellationToken::new();

    let prober = tokio::spawn(monitor::run_prober(
        edge.clone(),
        Duration::from_secs(cfg.watchdog.probe_interval_secs),
        cancel.clone(),
    ));

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = watchdog::server::serve(edge, listener, server_cancel).await {
            error!("Watchdog server error: {:#}", e);
        }
    });

    wait_for_shutdown(cancel, vec![("prober", prober), ("watchdog", server_handle)]).await?;
    info!("Watchdog shutdown complete");
    Ok(())
}

fn cmd_status(home_dir: &Path) -> Result<()> {
    let cfg = load(&home_dir.join(CONFIG_FILE))?;
    let state_path = cfg.resolved_state_dir().join(STATE_FILE);
    let state: ZeptoClawState = JsonStore::read_snapshot(&state_path)?;
    let health = derive_health(&state, chrono::Utc::now());

    let last_seen = state
        .local_last_seen
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".into());
    let agent = if health.local_agent_down {
        "down".red().bold().to_string()
    } else if state.local_last_seen.is_some() {
        "up".green().to_string()
    } else {
        "unknown".dimmed().to_string()
    };

    println!();
    println!("{}", "=== ZeptoClaw Status ===".bold());
    println!();
    println!("  {}:", "Gateway".bold());
    println!("    Bind:       {}", cfg.gateway.bind);
    println!("    State:      {}", state_path.display());
    println!();
    println!("  {}:", "Local agent".bold());
    println!("    Status:     {}", agent);
    println!("    Last seen:  {}", last_seen);
    println!("    Heartbeats: {}", state.heartbeat_history.len());
    println!();
    println!("  {}:", "Traffic".bold());
    println!("    Requests:   {}", state.total_requests);
    println!("    Errors:     {} ({:.2}%)", state.total_errors, health.error_rate * 100.0);
    if let Some(last_error) = &state.last_error {
        println!("    Last error: {}", last_error.red());
    }
    println!("    Incidents:  {}", state.gateway_incidents.len());
    println!();
    println!("  {}:", "Autonomous".bold());
    println!(
        "    Enabled:    {}",
        if cfg.autonomous.enabled { "yes".green() } else { "no".dimmed() }
    );
    println!("    Ideas:      {}", state.autonomous.post_idea_queue.len());
    println!("    Posts:      {}", state.autonomous.posts_published);
    println!("    Discovered: {}", state.autonomous.discoveries.len());
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load(config_path: &Path) -> Result<ZeptoClawConfig> {
    if !config_path.exists() {
        eprintln!(
            "{} No config found at {:?}. Run `zeptoclaw init` first.",
            "Error:".red().bold(),
            config_path
        );
        std::process::exit(1);
    }
    config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

/// Wait for Ctrl+C, cancel, and give the tasks a bounded grace period.
async fn wait_for_shutdown(
    cancel: CancellationToken,
    handles: Vec<(&'static str, tokio::task::JoinHandle<()>)>,
) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    println!("\n{} Shutting down gracefully...", "<<<".red().bold());
    cancel.cancel();

    let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                warn!("{} task join error: {}", name, e);
            }
        }
    })
    .await;
    if joined.is_err() {
        warn!("Shutdown grace period elapsed; exiting anyway");
    }
    Ok(())
}
