//! Start a cluster and run it until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::Minicluster;
use minicluster::{ClusterEvent, MiniClusterBuilder, Role};

/// Start a cluster and run it until interrupted.
///
/// Options not given on the command line are taken from the `MINICLUSTER_*` environment.
#[derive(StructOpt)]
#[structopt(name = "start")]
pub struct Start {
    /// The number of masters to launch.
    #[structopt(long)]
    pub(crate) masters: Option<usize>,
    /// The number of data-servers to launch.
    #[structopt(long)]
    pub(crate) data_servers: Option<usize>,
    /// The directory holding the `kudu-master` & `kudu-tserver` binaries.
    #[structopt(long, parse(from_os_str))]
    pub(crate) bin_dir: Option<PathBuf>,
    /// An explicit path to the master binary.
    #[structopt(long, parse(from_os_str))]
    pub(crate) master_binary: Option<PathBuf>,
    /// An explicit path to the data-server binary.
    #[structopt(long, parse(from_os_str))]
    pub(crate) data_server_binary: Option<PathBuf>,
    /// The directory under which the cluster root is created.
    #[structopt(long, parse(from_os_str))]
    pub(crate) base_dir: Option<PathBuf>,
    /// Keep the cluster's data, logs & flag files after shutdown.
    #[structopt(long)]
    pub(crate) keep_dirs: bool,
    /// The time in seconds each instance is allowed to become healthy.
    #[structopt(long)]
    pub(crate) startup_timeout_secs: Option<u64>,
    /// Extra flags for every master, as `name=value`.
    #[structopt(short = "m", parse(try_from_str = parse_key_val), number_of_values = 1)]
    pub(crate) master_flags: Vec<(String, String)>,
    /// Extra flags for every data-server, as `name=value`.
    #[structopt(short = "t", parse(try_from_str = parse_key_val), number_of_values = 1)]
    pub(crate) data_server_flags: Vec<(String, String)>,
}

impl Start {
    pub async fn run(&self, _base: &Minicluster) -> Result<()> {
        let cluster = self.builder()?.build().await.context("error starting cluster")?;
        tracing::info!(cluster_id = %cluster.cluster_id(), root = %cluster.root_dir().display(), "cluster is running");
        println!("{}", cluster.master_addresses_string());

        let mut events = BroadcastStream::new(cluster.subscribe());
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((sig, _)) = signals.next() => {
                    tracing::info!(signal = sig, "signal received, beginning graceful shutdown");
                    break;
                }
                Some(event) = events.next() => match event {
                    Ok(ClusterEvent::StateChanged { instance, from, to }) => tracing::info!(%instance, %from, %to, "instance state changed"),
                    Err(err) => tracing::warn!(error = ?err, "error receiving cluster event"),
                },
                else => break,
            }
        }

        cluster.shutdown().await;
        tracing::info!("cluster shutdown complete");
        Ok(())
    }

    /// Build the cluster builder from the environment overridden by CLI options.
    pub(crate) fn builder(&self) -> Result<MiniClusterBuilder> {
        // Signals are handled by this command, which shuts the cluster down gracefully.
        let mut builder = MiniClusterBuilder::from_env()?.cleanup_on_signal(false);
        if let Some(count) = self.masters {
            builder = builder.num_masters(count);
        }
        if let Some(count) = self.data_servers {
            builder = builder.num_data_servers(count);
        }
        if let Some(dir) = &self.bin_dir {
            builder = builder.bin_dir(dir);
        }
        if let Some(path) = &self.master_binary {
            builder = builder.master_binary(path);
        }
        if let Some(path) = &self.data_server_binary {
            builder = builder.data_server_binary(path);
        }
        if let Some(dir) = &self.base_dir {
            builder = builder.base_dir(dir);
        }
        if self.keep_dirs {
            builder = builder.keep_dirs(true);
        }
        if let Some(secs) = self.startup_timeout_secs {
            builder = builder.startup_timeout(Duration::from_secs(secs));
        }
        for (name, value) in self.master_flags.iter() {
            builder = builder.role_flag(Role::Master, name, value);
        }
        for (name, value) in self.data_server_flags.iter() {
            builder = builder.role_flag(Role::DataServer, name, value);
        }
        Ok(builder)
    }
}

/// Parse a key-value pair from the given str.
fn parse_key_val<T, U>(s: &str) -> Result<(T, U), Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + 'static,
    U: std::str::FromStr,
    U::Err: std::error::Error + 'static,
{
    let (key, val) = s.split_once('=').ok_or_else(|| format!("invalid key=value pair: no `=` found in `{}`", s))?;
    Ok((key.parse()?, val.parse()?))
}
