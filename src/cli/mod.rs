use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod chain;
pub mod pathmap;
pub mod schema;

use chain::ChainArgs;
use pathmap::PathMapArgs;
use schema::SchemaArgs;

use peerchain::config::ConfigManager;
use value_add::message::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "peerchain",
    about = "Open channels to remote agents through chains of proxy peers",
    version = "0.2.0"
)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error, critical)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: LogLevel,

    /// OpenTelemetry logs endpoint (e.g. http://localhost:4318/v1/logs)
    #[arg(long, global = true)]
    pub otel_logs_endpoint: Option<String>,

    /// OpenTelemetry metrics endpoint (e.g. http://localhost:4318/v1/metrics)
    #[arg(long, global = true)]
    pub otel_events_endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Merge and resolve path-map rules
    Pathmap(PathMapArgs),

    /// Plan or simulate opening a channel
    Chain(ChainArgs),

    /// Emit JSON‐Schema for the chain and rule files
    Schema(SchemaArgs),
}

#[derive(Clone)]
pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(root: PathBuf, config_manager: ConfigManager) -> Self {
        Self { root, config_manager }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Pathmap(args) => pathmap::execute(args, context).await,
        Commands::Chain(args) => chain::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
    }
}
