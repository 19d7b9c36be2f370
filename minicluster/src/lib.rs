//! An embeddable multi-process mini-cluster manager.
//!
//! Launches, coordinates & tears down a set of cooperating master & data-server processes on
//! ephemeral local ports and directories, so that to a client they behave like a real
//! distributed storage cluster.

mod builder;
pub mod cleanup;
#[cfg(test)]
mod cleanup_test;
pub mod config;
mod error;
mod handle;
pub mod health;
#[cfg(test)]
mod health_test;
pub mod layout;
#[cfg(test)]
mod layout_test;
pub mod ports;
#[cfg(test)]
mod ports_test;
pub mod process;
pub mod retry;
pub mod supervisor;
pub mod topology;

pub use builder::MiniClusterBuilder;
pub use cleanup::{cleanup_cluster, cleanup_registered_clusters};
pub use config::ClusterConfig;
pub use error::ClusterError;
pub use handle::ClusterHandle;
pub use supervisor::{ClusterEvent, ClusterState, InstanceInfo, InstanceState};
pub use topology::{ClusterTopology, InstanceId, Role};
