//! polyfierd: the Polyfier dispatcher daemon.
//!
//! Single binary that assembles the dispatcher:
//! - State store (redb)
//! - Profile generator
//! - Session orchestrator + status broadcaster
//! - WebSocket message channel + status API
//!
//! # Usage
//!
//! ```text
//! polyfierd serve --config polyfier.toml --port 44567 --data-dir /var/lib/polyfier
//! polyfierd default-config > polyfier.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use polyfier_core::{PolyfierConfig, ProfileGenerator};
use polyfier_session::{JobOrchestrator, StatusBroadcaster};
use polyfier_state::StateStore;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "polyfierd", about = "Polyfier dispatcher daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher.
    Serve {
        /// Path to a polyfier.toml file. Built-in defaults apply otherwise.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Keep all state in memory.
        #[arg(long)]
        in_memory: bool,
    },

    /// Print the built-in configuration as TOML.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,polyfierd=debug,polyfier=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            in_memory,
        } => {
            let mut config = match config {
                Some(path) => {
                    info!(path = ?path, "loading configuration");
                    PolyfierConfig::from_file(&path)?
                }
                None => PolyfierConfig::default(),
            };
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            run_server(config, in_memory).await
        }
        Command::DefaultConfig => {
            print!("{}", PolyfierConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_server(config: PolyfierConfig, in_memory: bool) -> anyhow::Result<()> {
    info!("Polyfier dispatcher starting");

    // ── Initialize subsystems ──────────────────────────────────

    let store = if in_memory {
        StateStore::open_in_memory()?
    } else {
        std::fs::create_dir_all(&config.server.data_dir)?;
        let db_path = config.server.data_dir.join("polyfier.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        store
    };

    let generator = ProfileGenerator::new(&config.generator)?;
    let seeds = config.seeds.seed_set()?;
    info!(
        loop_back = config.generator.loop_back,
        sort_mode = ?config.generator.sort_mode,
        seeds = seeds.len(),
        "profile generator initialized"
    );

    let orchestrator = Arc::new(JobOrchestrator::new(
        Arc::new(store.clone()),
        generator,
        seeds,
    ));

    let broadcaster = StatusBroadcaster::new(
        orchestrator.registry(),
        Duration::from_secs(config.server.broadcast_interval_secs),
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let broadcast_handle = tokio::spawn(async move {
        broadcaster.run(shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = polyfier_api::build_router(orchestrator, Arc::new(store));
    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    info!(addr = %listener.local_addr()?, "API server listening");

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = broadcast_handle.await;

    info!("Polyfier dispatcher stopped");
    Ok(())
}
