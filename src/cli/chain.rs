use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args, Subcommand};
use tracing::info;

use super::CliContext;
use peerchain::{
    channel::{
        ChannelManager, ChannelManagerSettings, OpenFlags, PeerInfo, Transport, event::drain,
        memory::MemoryTransport,
    },
    config::ChainConfig,
    dispatch::Dispatcher,
    watcher::PathMapWatcher,
};

const SIMULATED_BASE_PORT: u16 = 40_000;

#[derive(Args, Debug)]
pub struct ChainArgs {
    #[command(subcommand)]
    pub command: ChainCommands,
}

#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Chain file. Default: `<root>/chain.yaml`
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Peer id to open a channel to
    #[arg(long)]
    pub target: String,
    /// Open a private channel
    #[arg(long)]
    pub force_new: bool,
    /// Skip value-adds; implies --force-new
    #[arg(long)]
    pub no_value_add: bool,
    /// Skip the path map; implies --force-new
    #[arg(long)]
    pub no_path_map: bool,
    /// Stand in for every value-add instead of launching the configured helpers
    #[arg(long)]
    pub simulate: bool,
}

impl TargetArgs {
    fn flags(&self) -> OpenFlags {
        OpenFlags {
            force_new: self.force_new,
            no_value_add: self.no_value_add,
            no_path_map: self.no_path_map,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ChainCommands {
    /// Print the steps that open a channel to the target
    Plan(TargetArgs),
    /// Open and close a channel against an in-memory agent and print its events
    Simulate(TargetArgs),
    /// Keep a channel open and push the rule file to it whenever it changes
    Watch {
        #[command(flatten)]
        target: TargetArgs,
        /// Client path-map rule file
        #[arg(long)]
        rules: PathBuf,
    },
}

fn load(args: &TargetArgs, context: &CliContext) -> anyhow::Result<(ChainConfig, PeerInfo)> {
    let path = args.config.clone().unwrap_or_else(|| context.root.join("chain.yaml"));
    let config = ChainConfig::load(&path)?;
    let target = config.peer(&args.target).unwrap_or_else(|| PeerInfo::new(args.target.clone()));
    Ok((config, target))
}

/// Environment settings first, the chain file's own overrides on top.
async fn settings(config: &ChainConfig, context: &CliContext) -> ChannelManagerSettings {
    let layered = context.config_manager.layered(config.overrides()).await;
    ChannelManagerSettings::from_config(&layered).await
}

/// The agent side is always in memory. Value-adds are launched as the chain
/// file declares them unless `simulate` is set.
async fn build_manager(
    config: &ChainConfig,
    context: &CliContext,
    simulate: bool,
) -> anyhow::Result<(ChannelManager, MemoryTransport)> {
    let transport = MemoryTransport::new();
    let directory = if simulate {
        config.build_simulated_directory(SIMULATED_BASE_PORT)
    } else {
        let probe: Arc<dyn Transport> = Arc::new(transport.clone());
        config.build_directory(Some(probe))
    };
    let dispatcher = Dispatcher::start("peerchain-dispatch")?;
    let manager = ChannelManager::new(
        dispatcher,
        Arc::new(transport.clone()),
        Arc::new(directory),
        settings(config, context).await,
    );
    Ok((manager, transport))
}

pub async fn execute(args: ChainArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        ChainCommands::Plan(target_args) => {
            let (config, target) = load(&target_args, context)?;
            let (manager, _) = build_manager(&config, context, target_args.simulate).await?;
            println!("open {}", target.id);
            for line in manager.plan(&target, target_args.flags())? {
                println!("  {line}");
            }
            Ok(())
        }
        ChainCommands::Simulate(target_args) => {
            let (config, target) = load(&target_args, context)?;
            let (manager, transport) = build_manager(&config, context, target_args.simulate).await?;
            let mut events = manager.events().subscribe();

            let channel = manager
                .open_channel(&target, target_args.flags())
                .await
                .with_context(|| format!("opening a channel to `{}`", target.id))?;
            let pushed = manager
                .sync_path_map(&channel, &config.path_map, &config.client_id(), false)
                .await?;
            let remote_id = channel.remote_peer().id;
            manager.close_channel(&channel).await?;

            for event in drain(&mut events) {
                println!("{}", serde_json::to_string(&event)?);
            }
            if pushed {
                let remote = transport.path_map_for(&remote_id).rules();
                print!("{}", serde_yaml_bw::to_string(&remote)?);
            }
            for (from, to) in transport.redirects() {
                println!("# redirected {from} -> {to}");
            }
            Ok(())
        }
        ChainCommands::Watch { target: target_args, rules } => {
            let (config, target) = load(&target_args, context)?;
            let (manager, transport) = build_manager(&config, context, target_args.simulate).await?;
            let channel = manager
                .open_channel(&target, target_args.flags())
                .await
                .with_context(|| format!("opening a channel to `{}`", target.id))?;
            let remote = transport.path_map_for(&channel.remote_peer().id);

            let watcher = PathMapWatcher::new(manager.clone(), rules.clone(), config.client_id());
            let dir_watcher = watcher.watch().await?;
            info!(rules = %rules.display(), peer = %target.id, "watching path map rules");

            let mut seen = 0;
            let mut tick = tokio::time::interval(Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = tick.tick() => {
                        let pushes = remote.set_calls();
                        if pushes != seen {
                            seen = pushes;
                            println!("# push {pushes}");
                            print!("{}", serde_yaml_bw::to_string(&remote.rules())?);
                        }
                    }
                }
            }

            dir_watcher.shutdown();
            manager.close_channel(&channel).await?;
            Ok(())
        }
    }
}
