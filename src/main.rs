use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use flywheel_core::EngineConfig;
use flywheel_dispatch::{HttpExecutionTransport, StaticPoolCoordinator};
use flywheel_engine::{Broadcaster, JobEngine};
use flywheel_store::Database;

#[derive(Parser)]
#[command(name = "flywheel", about = "Multi-cycle autonomous orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestration engine and its HTTP/SSE relay.
    Serve {
        #[arg(long, default_value_t = 8787)]
        port: u16,

        /// Path to the job database.
        #[arg(long, default_value = "flywheel.db")]
        db: PathBuf,

        /// Worker endpoint URL. Repeat for a larger pool.
        #[arg(long = "worker", value_name = "URL", required = true)]
        workers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port, db, workers } => serve(port, db, workers).await,
    }
}

async fn serve(port: u16, db_path: PathBuf, workers: Vec<String>) -> anyhow::Result<()> {
    let db = Database::open(&db_path).context("failed to open database")?;
    tracing::info!(path = %db_path.display(), workers = workers.len(), "flywheel starting");

    let coordinator = Arc::new(StaticPoolCoordinator::from_urls(workers));
    let transport = Arc::new(HttpExecutionTransport::new());
    let broadcaster = Arc::new(Broadcaster::new());

    let engine = Arc::new(JobEngine::new(
        db,
        coordinator,
        transport,
        broadcaster,
        EngineConfig::default(),
    ));

    let handle = flywheel_server::start(flywheel_server::ServerConfig { port }, engine)
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, "flywheel ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    Ok(())
}
