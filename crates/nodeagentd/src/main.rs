//! nodeagentd — node agent for containerized web app deployment.
//!
//! Serves the authenticated HTTP/WS surface over a trusted keystore,
//! identity store, encrypted-secret intake, and blue/green DeployEngine.

use clap::{Parser, Subcommand};
use nc_audit::AuditLog;
use nc_deploy::DeployEngine;
use nc_identity::KeyStore;
use nc_metrics::OperationsMetrics;
use nc_queue::CommandQueue;
use nc_secrets::ReceivedSecretStore;
use nc_trust::TrustStore;
use nodeagentd::config::AgentConfig;
use nodeagentd::containers::DockerContainerDriver;
use nodeagentd::probe::HttpHealthProbe;
use nodeagentd::proxy::ReverseProxyDriver;
use nodeagentd::state::AgentState;
use nodeagentd::{dispatch, http, reconcile, rotation};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "nodeagentd")]
#[command(about = "Node agent for containerized web app deployment")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node agent (bind HTTP/WS, serve commands).
    Run {
        #[arg(short, long, default_value = "/etc/nodeagentd/config.json")]
        config: PathBuf,
    },
    /// Write a default config file.
    InitConfig {
        #[arg(short, long, default_value = "/etc/nodeagentd/config.json")]
        output: PathBuf,
    },
    /// Print the resolved configuration for this agent.
    Info {
        #[arg(short, long, default_value = "/etc/nodeagentd/config.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("nodeagentd=info".parse()?))
        .init();

    match cli.command {
        Commands::Run { config } => run_agent(config).await?,
        Commands::InitConfig { output } => init_config(output)?,
        Commands::Info { config } => show_info(config)?,
    }

    Ok(())
}

async fn run_agent(config_path: PathBuf) -> anyhow::Result<()> {
    let config = AgentConfig::load(&config_path).unwrap_or_default();
    info!(hostname = %config.hostname, listen = %config.listen_addr, "starting nodeagentd");

    std::fs::create_dir_all(&config.state_path)?;

    let keys = Arc::new(KeyStore::load_or_create(&config.state_path)?);
    let trust = Arc::new(TrustStore::new(&config.state_path));
    let audit = Arc::new(AuditLog::new(&config.state_path));
    let queue = Arc::new(CommandQueue::new(&config.state_path));
    let secrets = Arc::new(ReceivedSecretStore::new(&config.state_path));
    let metrics = Arc::new(OperationsMetrics::new());

    let containers = Arc::new(DockerContainerDriver::new());
    let proxy = Arc::new(ReverseProxyDriver::new(config.state_path.join("proxy-upstreams")));
    let probe = Arc::new(HttpHealthProbe::new());
    let deploys = Arc::new(DeployEngine::new(&config.state_path, containers, proxy, probe));

    reconcile::reconcile_orphans(&deploys).await;
    rotation::spawn(
        keys.clone(),
        metrics.clone(),
        Duration::from_secs(config.key_rotation_interval_secs),
    );

    let drain_budget = Duration::from_secs(config.shutdown_drain_secs);
    let listen_addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen_addr {}: {e}", config.listen_addr))?;

    let state = Arc::new(AgentState::new(
        config, keys, trust, audit, queue, deploys, secrets, metrics,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let executor_handle = tokio::spawn(dispatch::run_executor(state.clone(), shutdown_rx));

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(drain_budget, executor_handle).await.is_err() {
        error!("queue executor did not drain within the shutdown budget");
    }

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("shutdown signal received, draining in-flight work");
}

fn init_config(output: PathBuf) -> anyhow::Result<()> {
    let config = AgentConfig::default();
    config.save(&output)?;
    println!("Config written to {}", output.display());
    println!("Edit the file, then run:");
    println!("  nodeagentd run --config {}", output.display());
    Ok(())
}

fn show_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = AgentConfig::load(&config_path).unwrap_or_default();
    println!("nodeagentd v{}", env!("CARGO_PKG_VERSION"));
    println!("  hostname:     {}", config.hostname);
    println!("  listen addr:  {}", config.listen_addr);
    println!("  state path:   {}", config.state_path.display());
    Ok(())
}
