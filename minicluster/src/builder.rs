//! The user-facing cluster builder.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::handle::ClusterHandle;
use crate::layout::{ClusterLayout, InstanceConfigBuilder, InstanceLayout};
use crate::ports::{PortAllocator, DEFAULT_PROBE_ATTEMPTS_PER_PORT, MAX_PORTS};
use crate::supervisor::{ClusterSupervisor, SupervisorSettings, DEFAULT_MONITOR_INTERVAL};
use crate::topology::{ClusterTopology, InstanceId, Role};

/// A builder of mini-clusters.
///
/// ```no_run
/// # async fn demo() -> anyhow::Result<()> {
/// let cluster = minicluster::MiniClusterBuilder::new()
///     .bin_dir("/opt/kudu/bin")
///     .num_masters(3)
///     .num_data_servers(3)
///     .build()
///     .await?;
/// println!("masters: {}", cluster.master_addresses_string());
/// cluster.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct MiniClusterBuilder {
    config: ClusterConfig,
    binary_overrides: BTreeMap<InstanceId, PathBuf>,
    role_flags: BTreeMap<Role, BTreeMap<String, String>>,
    instance_flags: BTreeMap<InstanceId, BTreeMap<String, String>>,
    env: BTreeMap<String, String>,
    monitor_interval: Duration,
    probe_attempts_per_port: usize,
}

impl MiniClusterBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::from_config(ClusterConfig::default())
    }

    /// Create a new builder seeded from the `MINICLUSTER_*` environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_config(ClusterConfig::from_env()?))
    }

    /// Create a new builder seeded from the given config.
    pub fn from_config(config: ClusterConfig) -> Self {
        Self {
            config,
            binary_overrides: BTreeMap::new(),
            role_flags: BTreeMap::new(),
            instance_flags: BTreeMap::new(),
            env: BTreeMap::new(),
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            probe_attempts_per_port: DEFAULT_PROBE_ATTEMPTS_PER_PORT,
        }
    }

    /// The configuration accumulated so far.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn num_masters(mut self, count: usize) -> Self {
        self.config.num_masters = count;
        self
    }

    pub fn num_data_servers(mut self, count: usize) -> Self {
        self.config.num_data_servers = count;
        self
    }

    /// Set the directory in which the default binary names are looked up.
    pub fn bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.bin_dir = Some(dir.into());
        self
    }

    pub fn master_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.master_binary = Some(path.into());
        self
    }

    pub fn data_server_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_server_binary = Some(path.into());
        self
    }

    /// Override the binary of a single instance.
    pub fn instance_binary(mut self, id: InstanceId, path: impl Into<PathBuf>) -> Self {
        self.binary_overrides.insert(id, path.into());
        self
    }

    /// Set the directory under which the cluster root is created.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.base_dir = Some(dir.into());
        self
    }

    pub fn bind_host(mut self, host: IpAddr) -> Self {
        self.config.bind_host = host;
        self
    }

    /// Keep the cluster's directories on disk after shutdown.
    pub fn keep_dirs(mut self, keep: bool) -> Self {
        self.config.keep_dirs = keep;
        self
    }

    /// Keep logs & flag files on disk when startup fails.
    pub fn retain_logs_on_failure(mut self, retain: bool) -> Self {
        self.config.retain_logs_on_failure = retain;
        self
    }

    /// Set the time each instance is allowed to become healthy.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.startup_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the time each instance is given to exit after SIGTERM before being killed.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_ms = duration_ms(grace);
        self
    }

    pub fn health_path(mut self, path: impl Into<String>) -> Self {
        self.config.health_path = path.into();
        self
    }

    pub fn replication_factor(mut self, factor: usize) -> Self {
        self.config.replication_factor = Some(factor);
        self
    }

    /// Register the cluster for cleanup when the host process receives SIGINT/SIGTERM.
    pub fn cleanup_on_signal(mut self, enabled: bool) -> Self {
        self.config.cleanup_on_signal = enabled;
        self
    }

    /// Add an extra flag to every instance of the given role.
    pub fn role_flag(mut self, role: Role, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.role_flags.entry(role).or_default().insert(name.into(), value.into());
        self
    }

    /// Add an extra flag to a single instance, taking precedence over role flags.
    pub fn instance_flag(mut self, id: InstanceId, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.instance_flags.entry(id).or_default().insert(name.into(), value.into());
        self
    }

    /// Add an environment variable to every child process.
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Set the interval at which running instances are checked for unexpected exits.
    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Set the number of bind attempts allowed per requested port.
    pub fn port_probe_attempts(mut self, attempts: usize) -> Self {
        self.probe_attempts_per_port = attempts;
        self
    }

    /// Validate this builder's configuration.
    pub fn validate(&self) -> Result<()> {
        let config = &self.config;
        if config.num_masters == 0 {
            return Err(ClusterError::config("a cluster requires at least 1 master").into());
        }
        if config.startup_timeout_ms == 0 {
            return Err(ClusterError::config("startup timeout must be greater than zero").into());
        }
        if self.monitor_interval.is_zero() {
            return Err(ClusterError::config("monitor interval must be greater than zero").into());
        }
        if self.ports_needed().is_none() {
            return Err(ClusterError::config(format!(
                "{} masters & {} data-servers need more than the {} ports available on a host",
                config.num_masters, config.num_data_servers, MAX_PORTS
            ))
            .into());
        }
        if config.replication_factor == Some(0) {
            return Err(ClusterError::config("replication factor must be at least 1").into());
        }
        if config.health_path.trim().is_empty() {
            return Err(ClusterError::config("health path must not be empty").into());
        }
        let unknown = self
            .binary_overrides
            .keys()
            .chain(self.instance_flags.keys())
            .find(|id| !self.is_planned(id));
        if let Some(id) = unknown {
            return Err(ClusterError::config(format!("override given for {}, which is not part of the planned cluster", id)).into());
        }
        for role in [Role::Master, Role::DataServer] {
            if self.count_of(role) > 0 && self.needs_role_binary(role) {
                config.binary_for(role)?;
            }
        }
        Ok(())
    }

    /// Build & start the cluster, returning once every instance is healthy.
    ///
    /// Any failure tears down everything launched so far before it is returned.
    pub async fn build(self) -> Result<ClusterHandle> {
        self.validate()?;
        let cluster_id = Uuid::new_v4();
        let num_masters = self.config.num_masters;

        // Reserve an RPC & a web port for every instance.
        let allocator = PortAllocator::new(self.config.bind_host).with_attempts_per_port(self.probe_attempts_per_port);
        let count = self.ports_needed().ok_or_else(|| ClusterError::config("instance counts exceed the available ports"))?;
        let reservations = allocator.reserve(count)?;
        let mut addrs = reservations.chunks(2).map(|pair| (pair[0].addr(), pair[1].addr()));
        let masters: Vec<_> = addrs.by_ref().take(num_masters).collect();
        let data_servers: Vec<_> = addrs.collect();
        let topology = Arc::new(ClusterTopology::new(masters, data_servers, self.config.replication_factor)?);

        let layout = ClusterLayout::create(&self.config.base_dir(), cluster_id).await?;
        let instances = match self.materialize(&layout, &topology).await {
            Ok(instances) => instances,
            Err(err) => {
                if let Err(rm_err) = layout.remove_all() {
                    tracing::warn!(error = ?rm_err, root = %layout.root().display(), "error removing cluster root");
                }
                return Err(err);
            }
        };

        let settings = SupervisorSettings {
            startup_timeout: self.config.startup_timeout(),
            shutdown_grace: self.config.shutdown_grace(),
            keep_dirs: self.config.keep_dirs,
            retain_logs_on_failure: self.config.retain_logs_on_failure,
            cleanup_on_signal: self.config.cleanup_on_signal,
            env: self.env,
            health_path: self.config.health_path,
            monitor_interval: self.monitor_interval,
        };
        let supervisor = ClusterSupervisor::new(cluster_id, topology, layout, instances, reservations, settings)?;
        supervisor.start().await?;
        Ok(ClusterHandle::new(supervisor))
    }

    /// Materialize every planned instance on disk & resolve its binary.
    async fn materialize(&self, layout: &ClusterLayout, topology: &ClusterTopology) -> Result<BTreeMap<InstanceId, (InstanceLayout, PathBuf)>> {
        let configs = InstanceConfigBuilder::new(layout, topology, &self.role_flags, &self.instance_flags);
        let mut instances = BTreeMap::new();
        for plan in topology.instances() {
            let binary = match self.binary_overrides.get(&plan.id) {
                Some(path) => path.clone(),
                None => self.config.binary_for(plan.id.role)?,
            };
            let instance = configs
                .materialize(&plan.id)
                .await
                .with_context(|| format!("error materializing layout of {}", plan.id))?;
            instances.insert(plan.id, (instance, binary));
        }
        Ok(instances)
    }

    /// The number of ports to reserve, an RPC & a web port per instance, if within `MAX_PORTS`.
    fn ports_needed(&self) -> Option<usize> {
        self.config
            .num_masters
            .checked_add(self.config.num_data_servers)
            .and_then(|instances| instances.checked_mul(2))
            .filter(|ports| *ports <= MAX_PORTS)
    }

    fn count_of(&self, role: Role) -> usize {
        match role {
            Role::Master => self.config.num_masters,
            Role::DataServer => self.config.num_data_servers,
        }
    }

    fn is_planned(&self, id: &InstanceId) -> bool {
        id.ordinal < self.count_of(id.role)
    }

    /// Check if any instance of the given role lacks a per-instance binary override.
    fn needs_role_binary(&self, role: Role) -> bool {
        (0..self.count_of(role)).any(|ordinal| !self.binary_overrides.contains_key(&InstanceId { role, ordinal }))
    }
}

impl Default for MiniClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
