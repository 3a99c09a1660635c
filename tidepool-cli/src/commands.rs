//! CLI command implementations

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use tidepool_core::{FileService, SystemClock, TidepoolConfig, spawn_sweeper};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server and the background sweeper
    Server {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,
        /// Port to bind to
        #[arg(short, long, default_value = "8000")]
        port: u16,
    },
    /// Remove expired files once and reconcile volumes with metadata
    Sweep,
    /// Print storage usage as JSON
    Stats,
}

/// Handle the CLI command
///
/// # Errors
/// Returns an error if the configuration is invalid, storage cannot be
/// opened, or the server fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let config = TidepoolConfig::from_env();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    match command {
        Commands::Server { host, port } => start_server(config, SocketAddr::new(host, port)).await,
        Commands::Sweep => run_sweep(config).await,
        Commands::Stats => show_stats(config).await,
    }
}

async fn open_service(config: &TidepoolConfig) -> anyhow::Result<FileService> {
    FileService::open(&config.storage, Arc::new(SystemClock))
        .await
        .context("Failed to open storage")
}

async fn start_server(config: TidepoolConfig, addr: SocketAddr) -> anyhow::Result<()> {
    let service = Arc::new(open_service(&config).await?);
    let sweeper = spawn_sweeper(
        service.sweeper(config.sweeper.orphan_grace),
        config.sweeper.clone(),
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown requested");
    };
    let served = tidepool_web::run_server(service, addr, shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {e}"));

    sweeper.shutdown().await;
    served
}

async fn run_sweep(config: TidepoolConfig) -> anyhow::Result<()> {
    let service = open_service(&config).await?;
    let sweeper = service.sweeper(config.sweeper.orphan_grace);

    let swept = sweeper.sweep_expired().await;
    let reconciled = sweeper.reconcile().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "sweep": swept,
            "reconcile": reconciled,
        }))?
    );
    Ok(())
}

async fn show_stats(config: TidepoolConfig) -> anyhow::Result<()> {
    let service = open_service(&config).await?;
    let report = service.stats().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
