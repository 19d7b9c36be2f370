//! Mini-cluster error abstractions.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::topology::InstanceId;

/// Error variants of the mini-cluster manager.
///
/// Operations return `anyhow::Result` with one of these variants as the root cause, so callers
/// can recover the variant with `err.downcast_ref::<ClusterError>()`.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Not enough free local resources (ports, disk space) could be found.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// The given configuration was invalid, or its on-disk materialization failed.
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    /// An instance process could not be spawned, or exited before becoming healthy.
    #[error("failed to launch {instance}: {reason} (logs: {})", .log_dir.display())]
    LaunchFailure { instance: InstanceId, reason: String, log_dir: PathBuf },
    /// An instance never passed its readiness check within the startup timeout.
    #[error("{instance} did not become healthy within {timeout:?}{} (logs: {})", last_error_suffix(.last_error), .log_dir.display())]
    HealthCheckTimeout {
        instance: InstanceId,
        timeout: Duration,
        log_dir: PathBuf,
        last_error: Option<String>,
    },
    /// A previously healthy instance terminated on its own.
    #[error("{instance} exited unexpectedly: {status}")]
    UnexpectedExit { instance: InstanceId, status: String },
    /// The referenced instance is not part of this cluster.
    #[error("instance {0} is not part of this cluster")]
    UnknownInstance(InstanceId),
    /// The cluster has already been shut down.
    #[error("the cluster has been shut down")]
    ShutDown,
}

impl ClusterError {
    /// Build a configuration error from the given message.
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::ConfigurationError(msg.into())
    }

    /// The log directory of the instance which caused this error, if any.
    pub fn log_dir(&self) -> Option<&PathBuf> {
        match self {
            Self::LaunchFailure { log_dir, .. } | Self::HealthCheckTimeout { log_dir, .. } => Some(log_dir),
            _ => None,
        }
    }
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(err) => format!(", last probe error: {}", err),
        None => String::new(),
    }
}
