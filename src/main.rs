//! ClipMesh - secure peer synchronization
//!
//! This is the main entry point for the ClipMesh daemon and CLI.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clipmesh::cli::{Cli, CliHandler};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("clipmesh={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "ClipMesh v{} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("CLIPMESH_TARGET"),
        env!("CLIPMESH_BUILD_DATE")
    );

    let handler = CliHandler::new(cli.config);
    handler.handle_command(cli.command).await?;

    Ok(())
}
