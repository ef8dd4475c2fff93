//! # Parley Server
//!
//! Real-time chat server: rooms, presence, typing indicators, private
//! messages and paged history over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parley
//!
//! # Run with custom config
//! parley --config /path/to/parley.toml
//!
//! # Run with environment variables
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 parley
//! PARLEY__PERSISTENCE__BACKEND=none parley
//!
//! # Show the effective configuration
//! parley --print-config
//! ```

mod api;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "parley_server=debug,parley_core=debug,tower_http=info";

#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about = "Real-time chat server with rooms and presence", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Host address to bind to, overriding the configuration
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on, overriding the configuration
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = config::Config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    init_tracing(&config.logging);

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        logging
            .filter
            .as_deref()
            .unwrap_or(DEFAULT_LOG_FILTER)
            .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
