//! `peerchain-relay --target host:port`: a value-add that forwards the
//! connections the host makes to it.

use std::path::PathBuf;

use clap::Parser;
use value_add::{message::LogLevel, relay, runtime};

#[derive(Parser, Debug)]
#[command(name = "peerchain-relay", about = "TCP relay value-add for peerchain")]
struct Args {
    /// Address every connection is forwarded to
    #[arg(long)]
    target: String,

    /// Name reported in the announcement
    #[arg(long, default_value = "relay")]
    name: String,

    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    /// Stdout is reserved for the announcement, so logs go here
    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    runtime::init_logging(args.log_level, &args.log_dir);

    let (listener, props) = relay::bind(&args.name).await?;
    runtime::run(props, relay::serve(listener, args.target)).await
}
