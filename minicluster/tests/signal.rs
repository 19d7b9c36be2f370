//! The host-process SIGTERM cleanup hook.
//!
//! The hook exits the process it is installed in, so the cluster is built by a copy of this test
//! binary running only `host_process_with_cleanup_hook`, which the outer test then signals.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use minicluster::MiniClusterBuilder;

const STUB: &str = env!("CARGO_BIN_EXE_minicluster-stub");
/// The env var pointing the host process at the base dir to build its cluster in.
const BASE_DIR_VAR: &str = "CLEANUP_HOOK_TEST_BASE_DIR";
/// The file the host process writes its cluster root & instance pids to, one per line.
const INFO_FILE: &str = "cluster.info";

/// Build a cluster with the cleanup hook installed & park until signalled.
#[tokio::test]
#[ignore = "runs as the signalled host process of sigterm_kills_instances_and_removes_root"]
async fn host_process_with_cleanup_hook() -> Result<()> {
    let base = match std::env::var_os(BASE_DIR_VAR) {
        Some(base) => PathBuf::from(base),
        None => return Ok(()),
    };
    let cluster = MiniClusterBuilder::new()
        .master_binary(STUB)
        .data_server_binary(STUB)
        .num_masters(1)
        .num_data_servers(2)
        .base_dir(&base)
        .cleanup_on_signal(true)
        .startup_timeout(Duration::from_secs(20))
        .build()
        .await?;

    let mut info = vec![cluster.root_dir().display().to_string()];
    info.extend(cluster.instances().iter().filter_map(|info| info.pid).map(|pid| pid.to_string()));
    let tmp = base.join(format!("{}.tmp", INFO_FILE));
    std::fs::write(&tmp, info.join("\n"))?;
    std::fs::rename(&tmp, base.join(INFO_FILE))?;

    tokio::time::sleep(Duration::from_secs(60)).await;
    anyhow::bail!("expected the host process to be terminated by its cleanup hook")
}

/// Wait for the info file written by the host process.
fn await_info(base: &Path) -> Result<(PathBuf, Vec<i32>)> {
    let deadline = Instant::now() + Duration::from_secs(30);
    let contents = loop {
        if let Ok(contents) = std::fs::read_to_string(base.join(INFO_FILE)) {
            break contents;
        }
        anyhow::ensure!(Instant::now() < deadline, "host process never reported its cluster");
        std::thread::sleep(Duration::from_millis(50));
    };
    let mut lines = contents.lines();
    let root = PathBuf::from(lines.next().context("expected cluster root in info file")?);
    let pids = lines.map(|line| line.parse::<i32>().context("malformed pid in info file")).collect::<Result<Vec<_>>>()?;
    Ok((root, pids))
}

/// Check that the given pid is gone, or left as a zombie not yet reaped by its new parent.
fn is_gone(pid: i32) -> bool {
    if matches!(kill(Pid::from_raw(pid), None::<Signal>), Err(Errno::ESRCH)) {
        return true;
    }
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .map(|stat| stat.rsplit_once(')').map_or(false, |(_, rest)| rest.trim_start().starts_with('Z')))
        .unwrap_or(true)
}

#[test]
fn sigterm_kills_instances_and_removes_root() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let mut host = Command::new(std::env::current_exe()?)
        .args(["host_process_with_cleanup_hook", "--exact", "--ignored", "--test-threads=1"])
        .env(BASE_DIR_VAR, tmpdir.path())
        .stdout(Stdio::null())
        .spawn()?;

    let (root, pids) = match await_info(tmpdir.path()) {
        Ok(info) => info,
        Err(err) => {
            let _ = host.kill();
            let _ = host.wait();
            return Err(err);
        }
    };
    assert_eq!(pids.len(), 3, "expected a pid for every instance, got {:?}", pids);
    assert!(root.is_dir(), "expected cluster root {} to exist while running", root.display());
    // Give the hook thread time to register its signal streams.
    std::thread::sleep(Duration::from_millis(250));

    kill(Pid::from_raw(i32::try_from(host.id())?), Signal::SIGTERM)?;
    let status = host.wait()?;

    assert_eq!(status.code(), Some(143), "expected the host process to exit with 128 + SIGTERM, got {:?}", status);
    assert!(!root.exists(), "expected cluster root {} to be removed", root.display());
    for pid in pids {
        let mut gone = is_gone(pid);
        for _ in 0..100 {
            if gone {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
            gone = is_gone(pid);
        }
        assert!(gone, "expected instance process {} to be killed", pid);
    }
    Ok(())
}
