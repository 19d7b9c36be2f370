//! OS-level child processes of a cluster.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::error::ClusterError;
use crate::retry::{retry_until, Check, RetryPolicy};
use crate::topology::InstanceId;

/// Everything needed to spawn the process of one instance.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub id: InstanceId,
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// The instance's log directory, reported in launch errors.
    pub log_dir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// How a process came to a stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process had already exited before the stop was requested.
    AlreadyExited(ExitStatus),
    /// The process exited within its grace period after SIGTERM.
    Graceful(ExitStatus),
    /// The process outlived its grace period and was force killed.
    Killed,
}

/// An owned handle to one running child process.
///
/// The child is force killed if the handle is dropped while it is still running.
#[derive(Debug)]
pub struct ProcessHandle {
    spec: LaunchSpec,
    child: Child,
    pid: Option<u32>,
    exit: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Spawn the process described by the given spec.
    ///
    /// A missing or non-executable binary, or a failed spawn, yields `LaunchFailure`.
    pub fn spawn(spec: LaunchSpec) -> Result<Self> {
        let launch_failure = |reason: String| ClusterError::LaunchFailure {
            instance: spec.id,
            reason,
            log_dir: spec.log_dir.clone(),
        };
        validate_executable(&spec.binary).map_err(launch_failure)?;
        let stdout = open_log(&spec.stdout).map_err(launch_failure)?;
        let stderr = open_log(&spec.stderr).map_err(launch_failure)?;

        let child = Command::new(&spec.binary)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| launch_failure(format!("error spawning {}: {}", spec.binary.display(), err)))?;
        let pid = child.id();
        tracing::debug!(instance = %spec.id, pid = ?pid, binary = %spec.binary.display(), "spawned instance process");
        Ok(Self { spec, child, pid, exit: None })
    }

    /// The id of the instance this process belongs to.
    pub fn id(&self) -> &InstanceId {
        &self.spec.id
    }

    /// The OS pid of the process, as observed at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Check, without blocking, whether the process has exited.
    pub fn try_exit(&mut self) -> Result<Option<ExitStatus>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }
        let status = self
            .child
            .try_wait()
            .with_context(|| format!("error checking status of {} process", self.id()))?;
        self.exit = status;
        Ok(status)
    }

    /// Ask the process to stop gracefully with SIGTERM.
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        let pid = match (self.exit, self.pid) {
            (None, Some(pid)) => pid,
            _ => return Ok(()),
        };
        let pid = i32::try_from(pid).with_context(|| format!("pid {} of {} is out of range", pid, self.id()))?;
        kill(Pid::from_raw(pid), signal).with_context(|| format!("error sending {} to {} process", signal, self.id()))
    }

    /// Force kill the process, waiting for it to be reaped.
    pub async fn kill(&mut self) -> Result<()> {
        if self.try_exit()?.is_some() {
            return Ok(());
        }
        self.child.kill().await.with_context(|| format!("error killing {} process", self.id()))?;
        self.exit = self.child.try_wait().ok().flatten();
        Ok(())
    }

    /// Stop the process: SIGTERM, wait up to `grace` for it to exit, then SIGKILL.
    ///
    /// This never fails; errors along the way are logged and escalate to a force kill.
    pub async fn stop(&mut self, grace: Duration) -> StopOutcome {
        match self.try_exit() {
            Ok(Some(status)) => return StopOutcome::AlreadyExited(status),
            Ok(None) => (),
            Err(err) => tracing::warn!(error = ?err, instance = %self.id(), "error checking process status before stop"),
        }

        if let Err(err) = self.terminate() {
            tracing::warn!(error = ?err, instance = %self.id(), "error requesting graceful stop");
        } else {
            let policy = RetryPolicy::new(grace).with_intervals(Duration::from_millis(10), Duration::from_millis(250));
            let exited = retry_until(&policy, || {
                let check = match self.try_exit() {
                    Ok(Some(_)) => Check::Ready,
                    Ok(None) => Check::NotReady(None),
                    Err(err) => Check::Abort(err),
                };
                futures::future::ready(check)
            })
            .await;
            match exited {
                Ok(()) => {
                    if let Some(status) = self.exit {
                        return StopOutcome::Graceful(status);
                    }
                }
                Err(err) => tracing::debug!(error = %err, instance = %self.id(), "process did not stop gracefully, escalating to SIGKILL"),
            }
        }

        if let Err(err) = self.kill().await {
            tracing::error!(error = ?err, instance = %self.id(), "error force killing process");
        }
        StopOutcome::Killed
    }
}

/// Ensure the given path is an existing, executable regular file.
fn validate_executable(path: &Path) -> std::result::Result<(), String> {
    let meta = std::fs::metadata(path).map_err(|err| format!("binary {} is not accessible: {}", path.display(), err))?;
    if !meta.is_file() {
        return Err(format!("binary {} is not a regular file", path.display()));
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(format!("binary {} is not executable", path.display()));
    }
    Ok(())
}

fn open_log(path: &Path) -> std::result::Result<File, String> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| format!("error opening log file {}: {}", path.display(), err))
}
