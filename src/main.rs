use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use parley_gateway::api::ApiServerBuilder;
use parley_gateway::api::control::ConfigView;
use parley_gateway::config::LogFormat;
use parley_gateway::config::file::config_file_path;
use parley_gateway::upstream::PresetHealth;
use parley_gateway::{
    ConfigStore, LoopbackDriver, MemoryStore, Orchestrator, UpstreamClient, db,
};

/// Parley - auto-reply gateway between chat clients and language models
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/parley/config.toml)
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the control API on (overrides the config file)
    #[arg(long)]
    host: Option<IpAddr>,

    /// Port to listen on (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Database path (overrides the config file)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Serve the control API without starting the orchestrator
    #[arg(long)]
    no_autostart: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the resolved configuration with credentials masked
    CheckConfig,
    /// Probe the configured presets and print the selection
    Probe,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let store = ConfigStore::load(cli.config.clone().or_else(config_file_path));
    let logging = store
        .as_ref()
        .map(|s| s.current().logging.clone())
        .unwrap_or_default();

    let filter = match cli.verbose {
        0 => format!("{level},parley_gateway={level}", level = logging.level),
        1 => "info,parley_gateway=debug".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match logging.format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }

    let result = match store {
        Ok(store) => run(cli, store).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, store: ConfigStore) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::CheckConfig => check_config(&store),
            Command::Probe => probe(&store).await,
        };
    }

    let store = Arc::new(store);
    let snapshot = store.current();
    let host = cli.host.unwrap_or(snapshot.server.host);
    let port = cli.port.unwrap_or(snapshot.server.port);
    let db_path = cli.db.unwrap_or_else(|| snapshot.server.db_path.clone());

    tracing::info!(
        config = ?store.path(),
        db = %db_path.display(),
        %host,
        port,
        presets = snapshot.presets.len(),
        "starting parley gateway"
    );

    let memory = MemoryStore::new(db::init(&db_path)?);
    let driver = Arc::new(LoopbackDriver::new());
    let upstream = Arc::new(UpstreamClient::http(snapshot.bot.max_concurrency)?);
    let orchestrator = Orchestrator::new(store.clone(), driver.clone(), upstream, memory);

    let mut server = ApiServerBuilder::new(orchestrator.clone(), port)
        .host(host)
        .api_key(snapshot.server.api_key.clone())
        .loopback(driver)
        .build()
        .spawn();

    if cli.no_autostart {
        tracing::info!("autostart disabled, waiting for POST /api/start");
    } else if let Err(e) = orchestrator.start().await {
        tracing::error!(error = %e, "orchestrator failed to start, fix the config and POST /api/start");
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("shutdown requested");
        }
        joined = &mut server => {
            joined??;
            tracing::warn!("API server exited");
        }
    }

    if orchestrator.state().is_active() {
        orchestrator.stop().await?;
    }
    server.abort();

    tracing::info!("parley gateway stopped");
    Ok(())
}

/// Print the resolved snapshot
fn check_config(store: &ConfigStore) -> anyhow::Result<()> {
    let view = ConfigView::new(&store.current(), store.path());
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

/// Probe every preset in candidate order
async fn probe(store: &ConfigStore) -> anyhow::Result<()> {
    let snapshot = store.current();
    let upstream = UpstreamClient::http(1)?;
    let selected = upstream.probe(&snapshot).await;

    for status in upstream.statuses() {
        let marker = if status.active { "*" } else { " " };
        let health = match status.health {
            PresetHealth::Probed => "ok",
            PresetHealth::Failed => "failed",
            PresetHealth::Unprobed => "skipped",
        };
        println!(
            "{marker} {:<16} {:<24} {health}{}",
            status.name,
            status.model,
            status
                .last_error
                .map(|e| format!(" ({e})"))
                .unwrap_or_default()
        );
    }

    let preset = selected?;
    println!("\nselected: {} ({})", preset.name, preset.model);
    Ok(())
}
