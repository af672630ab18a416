use std::path::PathBuf;

use clap::Args;

use super::CliContext;
use peerchain::schema::write_schema;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Output directory. Default: `<root>/schemas`
    #[arg(long)]
    pub out_dir: Option<PathBuf>,
}

pub async fn execute(args: SchemaArgs, context: &CliContext) -> anyhow::Result<()> {
    let out_dir = args.out_dir.unwrap_or_else(|| context.root.join("schemas"));
    for file in write_schema(&out_dir)? {
        println!("wrote {}", file.display());
    }
    Ok(())
}
