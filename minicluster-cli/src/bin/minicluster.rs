//! The minicluster CLI.

use anyhow::Result;
use structopt::StructOpt;

use minicluster_cli::Minicluster;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Minicluster::from_args();
    cli.run().await
}
