//! Runtime configuration.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ClusterError;
use crate::health::DEFAULT_HEALTH_PATH;
use crate::topology::Role;

/// The prefix of all environment variables read by `ClusterConfig::from_env`.
pub const ENV_PREFIX: &str = "MINICLUSTER_";
/// The master binary name looked up in `bin_dir` when no explicit path is given.
pub const DEFAULT_MASTER_BINARY: &str = "kudu-master";
/// The data-server binary name looked up in `bin_dir` when no explicit path is given.
pub const DEFAULT_DATA_SERVER_BINARY: &str = "kudu-tserver";

/// Cluster configuration data.
///
/// Every field may be given through the environment as `MINICLUSTER_<FIELD>`, e.g.
/// `MINICLUSTER_NUM_DATA_SERVERS=3`. Everything has a default.
#[derive(Clone, Debug, Deserialize)]
pub struct ClusterConfig {
    /// The number of masters to launch.
    #[serde(default = "default_num_masters")]
    pub num_masters: usize,
    /// The number of data-servers to launch.
    #[serde(default = "default_num_data_servers")]
    pub num_data_servers: usize,
    /// The directory holding the server binaries.
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,
    /// An explicit path to the master binary, taking precedence over `bin_dir`.
    #[serde(default)]
    pub master_binary: Option<PathBuf>,
    /// An explicit path to the data-server binary, taking precedence over `bin_dir`.
    #[serde(default)]
    pub data_server_binary: Option<PathBuf>,
    /// The directory under which cluster roots are created, defaulting to the OS temp dir.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    /// The host all instances bind to.
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,
    /// Keep the cluster root on disk after shutdown.
    #[serde(default)]
    pub keep_dirs: bool,
    /// Keep logs & flag files on disk when startup fails.
    #[serde(default = "default_true")]
    pub retain_logs_on_failure: bool,
    /// The time allowed for each instance to become healthy.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// The time each instance is given to exit after SIGTERM before it is killed.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// The HTTP path of the readiness endpoint of each instance.
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// The replication factor handed to masters.
    #[serde(default)]
    pub replication_factor: Option<usize>,
    /// Register the cluster with the process-level cleanup hook for SIGINT/SIGTERM.
    #[serde(default = "default_true")]
    pub cleanup_on_signal: bool,
}

impl ClusterConfig {
    /// Build a config instance from the runtime environment.
    pub fn from_env() -> Result<Self> {
        envy::prefixed(ENV_PREFIX).from_env().context("error building config from env")
    }

    /// The startup timeout as a duration.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// The shutdown grace period as a duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Resolve the binary used by instances of the given role.
    ///
    /// An explicit path wins, otherwise the role's default name is looked up in `bin_dir`.
    pub fn binary_for(&self, role: Role) -> Result<PathBuf> {
        let (explicit, default_name) = match role {
            Role::Master => (&self.master_binary, DEFAULT_MASTER_BINARY),
            Role::DataServer => (&self.data_server_binary, DEFAULT_DATA_SERVER_BINARY),
        };
        if let Some(path) = explicit {
            return Ok(path.clone());
        }
        match &self.bin_dir {
            Some(dir) => Ok(dir.join(default_name)),
            None => Err(ClusterError::config(format!("no {} binary configured, set an explicit binary path or a bin dir", role)).into()),
        }
    }

    /// The directory under which cluster roots are created.
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_masters: default_num_masters(),
            num_data_servers: default_num_data_servers(),
            bin_dir: None,
            master_binary: None,
            data_server_binary: None,
            base_dir: None,
            bind_host: default_bind_host(),
            keep_dirs: false,
            retain_logs_on_failure: true,
            startup_timeout_ms: default_startup_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            health_path: default_health_path(),
            replication_factor: None,
            cleanup_on_signal: true,
        }
    }
}

fn default_num_masters() -> usize {
    1
}

fn default_num_data_servers() -> usize {
    1
}

fn default_bind_host() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_true() -> bool {
    true
}

fn default_startup_timeout_ms() -> u64 {
    60_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_PATH.into()
}
