//! The process-level cleanup list.
//!
//! Every cluster registers itself here when it starts and deregisters on clean teardown. If the
//! host process receives SIGINT or SIGTERM while clusters are registered, their children are
//! killed & their directories removed before the host exits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Once;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use lazy_static::lazy_static;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::SignalStream;
use tokio_stream::StreamMap;
use uuid::Uuid;

use crate::topology::InstanceId;

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<Uuid, Entry>> = Mutex::new(HashMap::new());
}

static SIGNAL_HOOK: Once = Once::new();

/// The cleanup data of a single registered cluster.
#[derive(Debug, Default)]
struct Entry {
    pids: HashMap<InstanceId, u32>,
    /// The cluster root to remove, `None` when directories are to be kept.
    root: Option<PathBuf>,
}

/// A cluster's entry in the process-level cleanup list.
///
/// The entry is removed when this value is dropped.
#[derive(Debug)]
pub struct Registration {
    cluster_id: Uuid,
}

impl Registration {
    /// Register a cluster, optionally installing the process-wide signal hook.
    pub fn register(cluster_id: Uuid, root: Option<PathBuf>, install_hook: bool) -> Self {
        REGISTRY.lock().insert(cluster_id, Entry { pids: HashMap::new(), root });
        if install_hook {
            install_signal_hook();
        }
        Self { cluster_id }
    }

    /// Record the pid of a launched instance.
    pub fn track(&self, instance: InstanceId, pid: u32) {
        if let Some(entry) = REGISTRY.lock().get_mut(&self.cluster_id) {
            entry.pids.insert(instance, pid);
        }
    }

    /// Forget the pid of an instance which has been stopped or has exited.
    pub fn untrack(&self, instance: &InstanceId) {
        if let Some(entry) = REGISTRY.lock().get_mut(&self.cluster_id) {
            entry.pids.remove(instance);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        REGISTRY.lock().remove(&self.cluster_id);
    }
}

/// Check if the given cluster is currently registered for cleanup.
pub fn is_registered(cluster_id: &Uuid) -> bool {
    REGISTRY.lock().contains_key(cluster_id)
}

/// Force kill the children & remove the directories of every registered cluster.
///
/// Returns the number of clusters cleaned up. Registered clusters are deregistered.
pub fn cleanup_registered_clusters() -> usize {
    let entries: Vec<(Uuid, Entry)> = REGISTRY.lock().drain().collect();
    let count = entries.len();
    for (cluster_id, entry) in entries {
        cleanup_entry(cluster_id, entry);
    }
    count
}

/// Force kill the children & remove the directories of a single registered cluster.
///
/// Returns false if the cluster was not registered.
pub fn cleanup_cluster(cluster_id: &Uuid) -> bool {
    let entry = REGISTRY.lock().remove(cluster_id);
    match entry {
        Some(entry) => {
            cleanup_entry(*cluster_id, entry);
            true
        }
        None => false,
    }
}

fn cleanup_entry(cluster_id: Uuid, entry: Entry) {
    for (instance, pid) in entry.pids {
        let pid = match i32::try_from(pid) {
            Ok(pid) => Pid::from_raw(pid),
            Err(_) => continue,
        };
        if let Err(err) = kill(pid, Signal::SIGKILL) {
            tracing::debug!(error = ?err, %cluster_id, %instance, "error killing instance during cleanup");
        }
    }
    if let Some(root) = entry.root {
        match std::fs::remove_dir_all(&root) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                tracing::warn!(error = ?err, %cluster_id, root = %root.display(), "error removing cluster root during cleanup");
            }
            _ => (),
        }
    }
}

/// Install the SIGINT/SIGTERM hook, once per host process.
///
/// The hook lives on a dedicated thread with its own runtime so that it outlives any runtime of
/// the caller.
fn install_signal_hook() {
    SIGNAL_HOOK.call_once(|| {
        let res = std::thread::Builder::new().name("minicluster-cleanup".into()).spawn(|| {
            if let Err(err) = run_signal_hook() {
                tracing::error!(error = ?err, "error running cluster cleanup signal hook");
            }
        });
        if let Err(err) = res {
            tracing::error!(error = ?err, "error spawning cluster cleanup signal hook thread");
        }
    });
}

fn run_signal_hook() -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("error building cleanup hook runtime")?;
    rt.block_on(async {
        let mut signals = StreamMap::new();
        signals.insert(Signal::SIGTERM, SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert(Signal::SIGINT, SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        if let Some((sig, _)) = signals.next().await {
            tracing::info!(signal = %sig, "signal received, cleaning up registered clusters");
            let count = cleanup_registered_clusters();
            tracing::info!(count, "cluster cleanup complete, exiting");
            std::process::exit(128 + sig as i32);
        }
        Ok::<_, anyhow::Error>(())
    })
}
