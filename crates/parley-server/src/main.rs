//! # Parley Server
//!
//! Real-time chat delivery server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file in the working directory
//! PARLEY_AUTH__JWT_SECRET=change-me parley
//!
//! # Run with a specific config file
//! parley --config /path/to/parley.toml
//!
//! # Override settings with environment variables
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 PARLEY_LIMITS__MAILBOX_CAPACITY=128 parley
//! ```

mod auth;
mod config;
mod handlers;
mod metrics;
mod webhook;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Real-time chat delivery server.
#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Real-time chat delivery server")]
struct Args {
    /// Path to a TOML config file (defaults to ./parley.toml when present).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "parley_server=debug,parley_core=debug,parley_transport=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match args.config {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
