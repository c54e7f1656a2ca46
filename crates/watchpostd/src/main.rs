//! watchpostd — the Watchpost daemon.
//!
//! Single binary that assembles every Watchpost subsystem:
//! - History store (JSON-lines event log)
//! - Check runners under one supervisor
//! - Notification dispatcher (webhooks)
//! - Read-only query API
//!
//! # Usage
//!
//! ```text
//! watchpostd run --config /etc/watchpost/watchpost.toml
//! watchpostd check-config --config watchpost.toml [--no-compact]
//! watchpostd compact --config watchpost.toml
//! ```

mod daemon;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use watchpost_core::WatchpostConfig;

#[derive(Parser)]
#[command(name = "watchpostd", about = "Watchpost health-check daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every configured check and serve the status API.
    Run {
        /// Path to the configuration file.
        #[arg(long, short, default_value = "watchpost.toml")]
        config: PathBuf,
    },

    /// Validate the configuration and prepare the history file.
    CheckConfig {
        /// Path to the configuration file.
        #[arg(long, short, default_value = "watchpost.toml")]
        config: PathBuf,

        /// Leave the history file as it is.
        #[arg(long)]
        no_compact: bool,
    },

    /// Drop history of checks no longer in the configuration.
    Compact {
        /// Path to the configuration file.
        #[arg(long, short, default_value = "watchpost.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            let config = load(&config)?;
            daemon::run(config).await
        }
        Command::CheckConfig { config, no_compact } => {
            let config = load(&config)?;
            daemon::check_config(&config, no_compact).await
        }
        Command::Compact { config } => {
            let config = load(&config)?;
            daemon::compact(&config).await
        }
    }
}

/// Load the config and install the log subscriber it asks for.
fn load(path: &Path) -> anyhow::Result<WatchpostConfig> {
    let config = WatchpostConfig::from_file(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;

    // RUST_LOG wins over the configured level.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(config.log_directive()?),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    Ok(config)
}
