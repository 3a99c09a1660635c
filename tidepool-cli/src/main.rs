//! Tidepool CLI - Command-line interface
//!
//! Runs the file server, a one-off sweep, or prints storage statistics.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use tidepool_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "tidepool")]
#[command(about = "Expiring multi-volume file store")]
#[command(version)]
struct Cli {
    /// Console log level (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "info")]
    log_level: CliLogLevel,

    /// Directory for a full trace of this run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    commands::handle_command(cli.command).await
}
