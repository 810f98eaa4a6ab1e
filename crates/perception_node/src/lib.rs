//! # Perception Node
//!
//! Replays newline-delimited JSON bus traffic through perception filters on
//! a local bus, logging deliveries and the filter updates the subscriptions
//! would replicate to remote publishers.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration, reading records from stdin
//! perception-node < traffic.ndjson
//!
//! # Specify custom configuration and input
//! perception-node --config proxy.toml --input traffic.ndjson
//!
//! # JSON logging
//! perception-node --json-logs --log-level debug
//! ```
//!
//! ## Configuration
//!
//! The node loads configuration from a TOML file (default:
//! `perception-node.toml`). If the file doesn't exist, a default
//! configuration is created.
//!
//! ## Signal Handling
//!
//! Replay stops early on SIGINT (Ctrl+C) or SIGTERM and still reports final
//! statistics.

mod app;
mod cli;
mod config;
mod logging;
mod replay;
mod signals;

use app::Application;
use cli::CliArgs;
use config::AppConfig;
use tracing::error;

/// Parses arguments, loads configuration, sets up logging and runs the
/// replay.
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(input) = args.input {
        config.node.input = input;
    }
    if let Some(agent_name) = args.agent_name {
        config.node.agent_name = agent_name;
    }

    if let Err(e) = logging::setup_logging(&config.logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    let app = match Application::new(config) {
        Ok(app) => app,
        Err(e) => {
            error!("❌ Failed to start application: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!("❌ Application error: {e}");
        std::process::exit(1);
    }
    Ok(())
}

pub use config::{LoggingSettings, NodeSettings, SubscriptionKind, SubscriptionSettings};
pub use replay::{RemoteFilterUpdate, ReplayOutcome, ReplayRecord};
