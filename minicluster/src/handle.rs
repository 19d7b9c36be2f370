//! The caller-facing handle of a running cluster.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::supervisor::{ClusterEvent, ClusterState, ClusterSupervisor, InstanceInfo, InstanceState};
use crate::topology::{ClusterTopology, InstanceId};

/// A handle to a started cluster.
///
/// Dropping the last handle without calling `shutdown` force kills every instance and removes
/// the cluster's directories on a best-effort basis.
#[derive(Clone)]
pub struct ClusterHandle {
    supervisor: Arc<ClusterSupervisor>,
}

impl ClusterHandle {
    pub(crate) fn new(supervisor: Arc<ClusterSupervisor>) -> Self {
        Self { supervisor }
    }

    /// The unique id of this cluster.
    pub fn cluster_id(&self) -> Uuid {
        self.supervisor.cluster_id()
    }

    /// The RPC addresses of all masters as `host:port`, ordered by ordinal.
    pub fn master_addresses(&self) -> Vec<String> {
        self.supervisor.topology().master_addresses()
    }

    /// The comma separated master address list accepted by client libraries.
    pub fn master_addresses_string(&self) -> String {
        self.master_addresses().join(",")
    }

    /// An immutable snapshot of the cluster's topology.
    pub fn topology(&self) -> Arc<ClusterTopology> {
        self.supervisor.topology()
    }

    /// The root directory holding all of the cluster's data, logs & flag files.
    pub fn root_dir(&self) -> &Path {
        self.supervisor.layout().root()
    }

    /// The current state of the given instance, or `None` if it is not part of this cluster.
    pub fn status(&self, id: &InstanceId) -> Option<InstanceState> {
        self.supervisor.status(id)
    }

    /// A snapshot of the given instance.
    pub fn instance(&self, id: &InstanceId) -> Option<InstanceInfo> {
        self.supervisor.instance(id)
    }

    /// Snapshots of all instances, masters first.
    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.supervisor.instances()
    }

    /// The aggregate state of the cluster.
    pub fn state(&self) -> ClusterState {
        self.supervisor.state()
    }

    /// Subscribe to the events of this cluster.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.supervisor.subscribe()
    }

    /// Gracefully stop a single instance.
    pub async fn stop_instance(&self, id: &InstanceId) -> Result<()> {
        self.supervisor.stop_instance(id).await
    }

    /// Relaunch a stopped or failed instance, waiting for it to become healthy again.
    pub async fn restart_instance(&self, id: &InstanceId) -> Result<()> {
        self.supervisor.restart_instance(id).await
    }

    /// Shut down the cluster, stopping data-servers before masters.
    ///
    /// This is idempotent and never fails.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await
    }
}
