//! `tether` - command line host for the coordination layer.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tether_common::{ClientConfig, LoggingConfig, init_logging};
use tracing::Level;

/// Distributed locks and prefix watches on an etcd v3 store.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Comma-separated store endpoints, overriding the config file.
    #[arg(short, long, global = true)]
    pub endpoints: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<Level>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check the store answers within the ping timeout.
    Ping,
    /// Write a key.
    Put { key: String, value: String },
    /// Read a key or a prefix.
    Get {
        key: String,
        #[arg(long)]
        prefix: bool,
    },
    /// Delete a key or a prefix.
    Del {
        key: String,
        #[arg(long)]
        prefix: bool,
    },
    /// Acquire a lock and hold it.
    Lock(commands::LockArgs),
    /// Print changes under one or more prefixes.
    Watch {
        /// Prefix to watch, may be repeated.
        #[arg(long = "prefix", required = true)]
        prefixes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env();
    if let Some(level) = cli.log_level {
        logging = logging.with_level(level);
    }
    let _logging_guard = init_logging(&logging).map_err(|e| anyhow::anyhow!("{}", e))?;

    let config = ClientConfig::load_with_endpoints(cli.config.as_deref(), cli.endpoints.as_deref())?;

    match cli.command {
        Commands::Ping => commands::ping(config).await,
        Commands::Put { key, value } => commands::put(config, &key, &value).await,
        Commands::Get { key, prefix } => commands::get(config, &key, prefix).await,
        Commands::Del { key, prefix } => commands::del(config, &key, prefix).await,
        Commands::Lock(args) => commands::lock(config, args).await,
        Commands::Watch { prefixes } => commands::watch(config, prefixes).await,
    }
}
