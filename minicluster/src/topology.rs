//! The in-memory model of a cluster's instances and their addresses.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use anyhow::Result;

use crate::error::ClusterError;

/// The replication factor ceiling used when none is configured explicitly.
const DEFAULT_MAX_REPLICATION_FACTOR: usize = 3;

/// The role an instance plays in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    /// Coordinator instance maintaining cluster & table metadata.
    Master,
    /// Worker instance holding data partitions, a.k.a. a tablet server.
    DataServer,
}

impl Role {
    /// The short name of this role, used in directory & file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::DataServer => "tserver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identity of an instance within its cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    pub role: Role,
    pub ordinal: usize,
}

impl InstanceId {
    /// The id of the master with the given ordinal.
    pub fn master(ordinal: usize) -> Self {
        Self { role: Role::Master, ordinal }
    }

    /// The id of the data-server with the given ordinal.
    pub fn data_server(ordinal: usize) -> Self {
        Self { role: Role::DataServer, ordinal }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.role, self.ordinal)
    }
}

/// The fixed network plan of a single instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstancePlan {
    pub id: InstanceId,
    /// The address the instance serves RPC traffic on.
    pub rpc_addr: SocketAddr,
    /// The address the instance serves its web/status endpoints on.
    pub web_addr: SocketAddr,
}

/// All instances of a cluster along with global cluster parameters.
///
/// A topology is immutable once built. Callers share it via `Arc` as a read-only snapshot.
#[derive(Clone, Debug)]
pub struct ClusterTopology {
    masters: Vec<InstancePlan>,
    data_servers: Vec<InstancePlan>,
    replication_factor: usize,
}

impl ClusterTopology {
    /// Build a new topology from per-role `(rpc, web)` address pairs, validating it.
    ///
    /// Ordinals are assigned in the order the addresses are given. When `replication_factor` is
    /// `None`, it defaults to the number of data-servers capped at 3, and never less than 1.
    pub fn new(
        masters: Vec<(SocketAddr, SocketAddr)>,
        data_servers: Vec<(SocketAddr, SocketAddr)>,
        replication_factor: Option<usize>,
    ) -> Result<Self> {
        let plan = |role: Role, addrs: Vec<(SocketAddr, SocketAddr)>| -> Vec<InstancePlan> {
            addrs
                .into_iter()
                .enumerate()
                .map(|(ordinal, (rpc_addr, web_addr))| InstancePlan {
                    id: InstanceId { role, ordinal },
                    rpc_addr,
                    web_addr,
                })
                .collect()
        };
        let replication_factor = replication_factor.unwrap_or_else(|| data_servers.len().min(DEFAULT_MAX_REPLICATION_FACTOR).max(1));
        let topology = Self {
            masters: plan(Role::Master, masters),
            data_servers: plan(Role::DataServer, data_servers),
            replication_factor,
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Validate the invariants of this topology.
    pub fn validate(&self) -> Result<()> {
        if self.masters.is_empty() {
            return Err(ClusterError::config("a cluster requires at least 1 master").into());
        }
        if self.replication_factor == 0 {
            return Err(ClusterError::config("replication factor must be at least 1").into());
        }
        let mut seen = HashSet::new();
        for plan in self.instances() {
            for addr in [plan.rpc_addr, plan.web_addr] {
                if !seen.insert(addr) {
                    return Err(ClusterError::config(format!("address {} is assigned more than once (seen again on {})", addr, plan.id)).into());
                }
            }
        }
        Ok(())
    }

    /// All instances, masters first, each group ordered by ordinal.
    pub fn instances(&self) -> impl Iterator<Item = &InstancePlan> {
        self.masters.iter().chain(self.data_servers.iter())
    }

    /// All instances of the given role, ordered by ordinal.
    pub fn instances_of(&self, role: Role) -> &[InstancePlan] {
        match role {
            Role::Master => &self.masters,
            Role::DataServer => &self.data_servers,
        }
    }

    /// Look up the plan of the given instance.
    pub fn get(&self, id: &InstanceId) -> Option<&InstancePlan> {
        self.instances_of(id.role).get(id.ordinal).filter(|plan| plan.id == *id)
    }

    pub fn num_masters(&self) -> usize {
        self.masters.len()
    }

    pub fn num_data_servers(&self) -> usize {
        self.data_servers.len()
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// The RPC addresses of all masters as `host:port` strings, ordered by ordinal.
    pub fn master_addresses(&self) -> Vec<String> {
        self.masters.iter().map(|plan| plan.rpc_addr.to_string()).collect()
    }
}
