//! nextcore — CLI controller for containerized web app deployment.
//!
//! `init`/`prepare`/`build` are present as subcommands but are thin stubs
//! (spec §6.4); `ship`/`rollback`/`status`/`logs`/`secrets` drive the agent
//! over its authenticated HTTP/WS surface.

mod client;
mod commands;
mod config;
mod error;
mod trust;

use clap::{Parser, Subcommand};
use error::CliError;
use nc_identity::KeyStore;
use nc_trust::TrustStore;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "nextcore")]
#[command(about = "NextCore deployment controller")]
#[command(version)]
struct Cli {
    /// Agent base URL.
    #[arg(long, global = true, default_value_t = config::default_agent_url())]
    agent: String,

    /// Local state directory (keys, trusted keys). Defaults to `~/.nextcore`.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract project metadata (out of scope here; stub).
    Init,
    /// Generate a Dockerfile from extracted metadata (out of scope here; stub).
    Prepare,
    /// Build the deployable image (out of scope here; stub).
    Build,
    /// Deploy an image with a blue/green swap.
    Ship {
        app: String,
        image: String,
        #[arg(long)]
        ssr_heavy: bool,
        #[arg(long)]
        env_file: Option<PathBuf>,
    },
    /// Redeploy the previous image for an app.
    Rollback { app: String },
    /// Stop an app's running container.
    Stop { app: String },
    /// Restart an app's current container.
    Restart { app: String },
    /// Show deployment state for one app, or every app.
    Status { app: Option<String> },
    /// Tail an app's container logs.
    Logs {
        app: String,
        #[arg(long, default_value_t = 200)]
        lines: u64,
    },
    /// Encrypted secret transfer.
    Secrets {
        #[command(subcommand)]
        action: SecretsAction,
    },
}

#[derive(Subcommand)]
enum SecretsAction {
    /// Encrypt and submit a `.env` file to the agent.
    Push { app: String, env_file: PathBuf },
    /// Not supported: the agent never decrypts a submitted envelope back out.
    Pull { app: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("nextcore=info".parse().unwrap()))
        .init();

    match run(cli).await {
        Ok(value) => {
            if !value.is_null() {
                println!("{}", serde_json::to_string_pretty(&value).unwrap());
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<serde_json::Value, CliError> {
    match &cli.command {
        Commands::Init => {
            commands::init_stub();
            return Ok(serde_json::Value::Null);
        }
        Commands::Prepare => {
            commands::prepare_stub();
            return Ok(serde_json::Value::Null);
        }
        Commands::Build => {
            commands::build_stub();
            return Ok(serde_json::Value::Null);
        }
        _ => {}
    }

    let state_dir = cli.state_dir.clone().unwrap_or_else(config::default_state_dir);
    std::fs::create_dir_all(&state_dir)?;
    let keys = KeyStore::load_or_create(&state_dir).map_err(|e| CliError::Other(e.to_string()))?;
    let trust = TrustStore::new(&state_dir);
    let key = keys.current_key();
    let client = reqwest::Client::new();

    trust::ensure_agent_trusted(&client, &cli.agent, &trust).await?;
    trust::self_bootstrap(&client, &cli.agent, &key, "operator@nextcore.local").await?;

    match cli.command {
        Commands::Init | Commands::Prepare | Commands::Build => unreachable!("handled above"),
        Commands::Ship {
            app,
            image,
            ssr_heavy,
            env_file,
        } => commands::ship(&client, &cli.agent, &key, &app, &image, ssr_heavy, env_file.as_deref()).await,
        Commands::Rollback { app } => commands::rollback(&client, &cli.agent, &key, &app).await,
        Commands::Stop { app } => commands::stop(&client, &cli.agent, &key, &app).await,
        Commands::Restart { app } => commands::restart(&client, &cli.agent, &key, &app).await,
        Commands::Status { app } => commands::status(&client, &cli.agent, &key, app.as_deref()).await,
        Commands::Logs { app, lines } => commands::logs(&cli.agent, &key, &app, lines).await,
        Commands::Secrets { action } => match action {
            SecretsAction::Push { app, env_file } => commands::secrets_push(&client, &cli.agent, &key, &app, &env_file).await,
            SecretsAction::Pull { app: _ } => commands::secrets_pull(),
        },
    }
}
