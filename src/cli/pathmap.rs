use std::path::PathBuf;

use anyhow::bail;
use clap::{Args, Subcommand};

use super::CliContext;
use peerchain::pathmap::{self, resolver};

#[derive(Args, Debug)]
pub struct PathMapArgs {
    #[command(subcommand)]
    pub command: PathMapCommands,
}

#[derive(Subcommand, Debug)]
pub enum PathMapCommands {
    /// Merge client rules into an agent's map and tell whether it must be pushed
    Merge {
        #[arg(long)]
        client: PathBuf,
        #[arg(long)]
        agent: PathBuf,
        #[arg(long)]
        client_id: String,
    },
    /// Translate a host path to the agent's view, or back with `--reverse`
    Map {
        #[arg(long)]
        rules: PathBuf,
        path: String,
        #[arg(long)]
        reverse: bool,
    },
}

pub async fn execute(args: PathMapArgs, _context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        PathMapCommands::Merge { client, agent, client_id } => {
            let client_rules = pathmap::load_rules(&client)?;
            let agent_rules = pathmap::load_rules(&agent)?;
            let merged = pathmap::reconcile(&client_rules, &agent_rules, &client_id);
            let push = pathmap::is_different(&merged, Some(&agent_rules));
            print!("{}", serde_yaml_bw::to_string(&merged)?);
            println!("# push required: {}", if push { "yes" } else { "no" });
            Ok(())
        }
        PathMapCommands::Map { rules, path, reverse } => {
            let rules = pathmap::load_rules(&rules)?;
            let mapped = if reverse {
                resolver::find_host_path(&rules, &path)
            } else {
                resolver::find_target_path(&rules, &path)
            };
            match mapped {
                Some(mapped) => {
                    println!("{mapped}");
                    Ok(())
                }
                None => bail!("no rule maps `{path}`"),
            }
        }
    }
}
