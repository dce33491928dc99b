//! Metrics query gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────────┐
//!                      │                   METRICS GATEWAY                    │
//!                      │                                                      │
//!   find / render      │  ┌────────┐   ┌─────────┐   ┌────────────────────┐   │
//!   ───────────────────┼─▶│  http  │──▶│ gateway │──▶│ cache (single-     │   │
//!                      │  │handlers│   │         │   │ flight, TTL)       │   │
//!                      │  └────────┘   └─────────┘   └─────────┬──────────┘   │
//!                      │                                       │ miss         │
//!                      │                                       ▼              │
//!                      │  ┌────────┐   ┌─────────┐   ┌────────────────────┐   │      ┌─────────┐
//!                      │  │ merge  │◀──│dispatch │──▶│ groups + health    │───┼─────▶│ backend │
//!                      │  └────────┘   │(JoinSet)│   │ broadcast /        │   │      │ stores  │
//!                      │               └─────────┘   │ prefer_first       │   │      └─────────┘
//!                      │                             └────────────────────┘   │
//!                      │  config · resolver · observability · lifecycle       │
//!                      └──────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use metrics_gateway::config::{load_config, DEFAULT_ENV_PREFIX};
use metrics_gateway::lifecycle::{signals, startup, Shutdown};
use metrics_gateway::observability::logging;

#[derive(Parser)]
#[command(name = "metrics-gateway")]
#[command(about = "Fan-out query gateway for metrics storage backends", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Prefix of environment variable overrides.
    #[arg(long, default_value = DEFAULT_ENV_PREFIX)]
    env_prefix: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match load_config(&args.config, &args.env_prefix) {
        Ok(config) => config,
        Err(e) => {
            logging::init_logging("info");
            tracing::error!(path = %args.config.display(), error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };

    logging::init_logging(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "metrics-gateway starting");

    if args.env_prefix.is_empty() {
        tracing::warn!("Empty environment prefix, overrides read bare variable names");
    }

    tracing::info!(
        path = %args.config.display(),
        listeners = config.listeners.len(),
        groups = config.groups.len(),
        "Configuration loaded"
    );

    let shutdown = Arc::new(Shutdown::new());
    signals::spawn_signal_handler(shutdown.clone());

    startup::run(config, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
