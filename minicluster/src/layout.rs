//! On-disk layout & configuration of cluster instances.
//!
//! Every cluster gets its own root directory, `<base>/minicluster-<uuid>`, under which each
//! instance owns:
//!
//! ```text
//! data/<role>-<ordinal>/       the instance's WAL & data directories
//! logs/<role>-<ordinal>/       server logs plus the child's stdout.log & stderr.log
//! conf/<role>-<ordinal>.flags  the gflags flag file the instance is launched with
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use uuid::Uuid;

use crate::error::ClusterError;
use crate::topology::{ClusterTopology, InstanceId, Role};

/// The prefix of every cluster root directory.
pub const CLUSTER_DIR_PREFIX: &str = "minicluster-";
/// The file extension used for instance flag files.
pub const FLAG_FILE_EXT: &str = "flags";

const DIR_DATA: &str = "data";
const DIR_LOGS: &str = "logs";
const DIR_CONF: &str = "conf";

/// Flags applied to every instance before any computed or extra flags.
const DEFAULT_FLAGS: &[(&str, &str)] = &[("never_fsync", "true"), ("unlock_experimental_flags", "true"), ("unlock_unsafe_flags", "true")];

/// Flag names used in instance flag files.
pub mod flags {
    pub const FS_WAL_DIR: &str = "fs_wal_dir";
    pub const FS_DATA_DIRS: &str = "fs_data_dirs";
    pub const LOG_DIR: &str = "log_dir";
    pub const RPC_BIND_ADDRESSES: &str = "rpc_bind_addresses";
    pub const WEBSERVER_INTERFACE: &str = "webserver_interface";
    pub const WEBSERVER_PORT: &str = "webserver_port";
    pub const MASTER_ADDRESSES: &str = "master_addresses";
    pub const DEFAULT_NUM_REPLICAS: &str = "default_num_replicas";
    pub const TSERVER_MASTER_ADDRS: &str = "tserver_master_addrs";
}

/// The cluster-scoped root directory.
#[derive(Clone, Debug)]
pub struct ClusterLayout {
    root: PathBuf,
}

impl ClusterLayout {
    /// Create a new uniquely named cluster root under the given base directory.
    pub async fn create(base: &Path, cluster_id: Uuid) -> Result<Self> {
        let root = base.join(format!("{}{}", CLUSTER_DIR_PREFIX, cluster_id));
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|err| ClusterError::config(format!("error creating cluster root {}: {}", root.display(), err)))?;
        Ok(Self { root })
    }

    /// Create a layout rooted at the given path without touching the filesystem.
    #[cfg(test)]
    pub(crate) fn new_test(root: PathBuf) -> Self {
        Self { root }
    }

    /// The root directory of the cluster.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The data directory of the given instance.
    pub fn data_dir(&self, id: &InstanceId) -> PathBuf {
        self.root.join(DIR_DATA).join(id.to_string())
    }

    /// The log directory of the given instance.
    pub fn log_dir(&self, id: &InstanceId) -> PathBuf {
        self.root.join(DIR_LOGS).join(id.to_string())
    }

    /// The flag file of the given instance.
    pub fn flag_file(&self, id: &InstanceId) -> PathBuf {
        self.root.join(DIR_CONF).join(format!("{}.{}", id, FLAG_FILE_EXT))
    }

    /// Remove the entire cluster root.
    pub fn remove_all(&self) -> std::io::Result<()> {
        remove_dir_if_exists(&self.root)
    }

    /// Remove the data of all instances, retaining logs & flag files for diagnosis.
    pub fn remove_data(&self) -> std::io::Result<()> {
        remove_dir_if_exists(&self.root.join(DIR_DATA))
    }
}

fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        res => res,
    }
}

/// The materialized on-disk layout of a single instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceLayout {
    pub id: InstanceId,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub flag_file: PathBuf,
}

impl InstanceLayout {
    /// The file receiving the child's stdout.
    pub fn stdout_log(&self) -> PathBuf {
        self.log_dir.join("stdout.log")
    }

    /// The file receiving the child's stderr.
    pub fn stderr_log(&self) -> PathBuf {
        self.log_dir.join("stderr.log")
    }
}

/// Computes & materializes the configuration of instances of one cluster.
pub struct InstanceConfigBuilder<'a> {
    layout: &'a ClusterLayout,
    topology: &'a ClusterTopology,
    role_flags: &'a BTreeMap<Role, BTreeMap<String, String>>,
    instance_flags: &'a BTreeMap<InstanceId, BTreeMap<String, String>>,
}

impl<'a> InstanceConfigBuilder<'a> {
    /// Create a new instance.
    pub fn new(
        layout: &'a ClusterLayout, topology: &'a ClusterTopology, role_flags: &'a BTreeMap<Role, BTreeMap<String, String>>,
        instance_flags: &'a BTreeMap<InstanceId, BTreeMap<String, String>>,
    ) -> Self {
        Self {
            layout,
            topology,
            role_flags,
            instance_flags,
        }
    }

    /// Compute the full flag set of the given instance.
    ///
    /// Precedence, lowest first: defaults, computed layout & address flags, role-wide extra
    /// flags, per-instance extra flags.
    pub fn flags(&self, id: &InstanceId) -> Result<BTreeMap<String, String>> {
        let plan = self.topology.get(id).ok_or(ClusterError::UnknownInstance(*id))?;
        let (data_dir, log_dir) = (self.layout.data_dir(id), self.layout.log_dir(id));
        let masters = self.topology.master_addresses().join(",");

        let mut out: BTreeMap<String, String> = DEFAULT_FLAGS.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        out.insert(flags::FS_WAL_DIR.into(), data_dir.join("wal").display().to_string());
        out.insert(flags::FS_DATA_DIRS.into(), data_dir.join("data").display().to_string());
        out.insert(flags::LOG_DIR.into(), log_dir.display().to_string());
        out.insert(flags::RPC_BIND_ADDRESSES.into(), plan.rpc_addr.to_string());
        out.insert(flags::WEBSERVER_INTERFACE.into(), plan.web_addr.ip().to_string());
        out.insert(flags::WEBSERVER_PORT.into(), plan.web_addr.port().to_string());
        match id.role {
            Role::Master => {
                if self.topology.num_masters() > 1 {
                    out.insert(flags::MASTER_ADDRESSES.into(), masters);
                }
                out.insert(flags::DEFAULT_NUM_REPLICAS.into(), self.topology.replication_factor().to_string());
            }
            Role::DataServer => {
                out.insert(flags::TSERVER_MASTER_ADDRS.into(), masters);
            }
        }
        if let Some(extra) = self.role_flags.get(&id.role) {
            out.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(extra) = self.instance_flags.get(id) {
            out.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(out)
    }

    /// Create the given instance's directories & write its flag file.
    pub async fn materialize(&self, id: &InstanceId) -> Result<InstanceLayout> {
        let flags = self.flags(id)?;
        let layout = InstanceLayout {
            id: *id,
            data_dir: self.layout.data_dir(id),
            log_dir: self.layout.log_dir(id),
            flag_file: self.layout.flag_file(id),
        };
        for dir in [layout.data_dir.join("wal"), layout.data_dir.join("data"), layout.log_dir.clone()] {
            create_dir(&dir).await?;
        }
        if let Some(parent) = layout.flag_file.parent() {
            create_dir(parent).await?;
        }
        tokio::fs::write(&layout.flag_file, render_flag_file(&flags))
            .await
            .map_err(|err| ClusterError::config(format!("error writing flag file {}: {}", layout.flag_file.display(), err)))?;
        tracing::debug!(instance = %id, flag_file = %layout.flag_file.display(), "materialized instance layout");
        Ok(layout)
    }
}

async fn create_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| ClusterError::config(format!("error creating directory {}: {}", dir.display(), err)).into())
}

/// Render the given flags in gflags flag file format, one `--name=value` per line.
pub fn render_flag_file(flags: &BTreeMap<String, String>) -> String {
    flags.iter().map(|(name, value)| format!("--{}={}\n", name, value)).collect()
}

/// Parse a gflags flag file.
///
/// Blank lines & `#` comments are skipped. A flag given without a value, `--name`, maps to
/// `"true"`. Later occurrences of a flag win.
pub fn parse_flag_file(contents: &str) -> BTreeMap<String, String> {
    contents.lines().filter_map(parse_flag).collect()
}

/// Parse a single `--name=value` flag.
pub fn parse_flag(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let flag = line.trim_start_matches('-');
    if flag.is_empty() {
        return None;
    }
    match flag.split_once('=') {
        Some((name, value)) => Some((name.to_string(), value.to_string())),
        None => Some((flag.to_string(), "true".to_string())),
    }
}
