use clap::Parser;
use peerchain::{
    config::{ConfigManager, EnvConfigManager},
    logger::{LogConfig, init_tracing},
};
use std::{env, path::PathBuf};
use tracing::{error, info};

mod cli;

use cli::{Cli, CliContext};

/// Resolve the peerchain root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("PEERCHAIN_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./peerchain")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();

    let log_config = LogConfig::new(cli.log_level, root.join("logs"))
        .with_otel(cli.otel_logs_endpoint.clone(), cli.otel_events_endpoint.clone());
    let telemetry = init_tracing(&log_config)?;
    info!(root = %root.display(), "peerchain starting");

    let config_manager = ConfigManager(EnvConfigManager::new(root.join("config").join(".env")));
    let context = CliContext::new(root, config_manager);

    let result = cli::execute(&context, cli.command).await;
    if let Err(e) = &result {
        error!("{e:#}");
    }
    telemetry.shutdown();
    result
}
