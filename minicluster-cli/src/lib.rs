//! The minicluster CLI.

mod cmd;

use anyhow::Result;
use structopt::StructOpt;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Run ephemeral multi-process storage clusters.
#[derive(StructOpt)]
#[structopt(name = "minicluster")]
pub struct Minicluster {
    #[structopt(subcommand)]
    action: MiniclusterSubcommands,
    /// Enable debug logging.
    #[structopt(short)]
    verbose: bool,
}

impl Minicluster {
    pub async fn run(self) -> Result<()> {
        // Initialize logging based on CLI config.
        let fmt_layer = fmt::layer().with_target(true);
        let filter_layer;
        let level_filter;
        if self.verbose {
            filter_layer = EnvFilter::new("debug");
            level_filter = LevelFilter::DEBUG;
        } else {
            filter_layer = EnvFilter::new("info");
            level_filter = LevelFilter::INFO;
        }
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(level_filter)
            .init();

        match &self.action {
            MiniclusterSubcommands::Start(inner) => inner.run(&self).await,
        }
    }
}

#[derive(StructOpt)]
pub enum MiniclusterSubcommands {
    /// Start a cluster and run it until interrupted.
    #[structopt(name = "start")]
    Start(cmd::start::Start),
}
