use std::time::Duration;

use anyhow::Result;
use uuid::Uuid;

use crate::cleanup::{cleanup_cluster, is_registered, Registration};
use crate::topology::InstanceId;

#[test]
fn registration_is_removed_on_drop() {
    let cluster_id = Uuid::new_v4();

    let registration = Registration::register(cluster_id, None, false);
    assert!(is_registered(&cluster_id), "expected cluster {} to be registered", cluster_id);
    drop(registration);

    assert!(!is_registered(&cluster_id), "expected cluster {} to be deregistered on drop", cluster_id);
    assert!(!cleanup_cluster(&cluster_id), "expected cleanup of a deregistered cluster to be a no-op");
}

#[test]
fn cleanup_kills_tracked_children_and_removes_root() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let root = tmpdir.path().join("minicluster-test");
    std::fs::create_dir_all(root.join("data"))?;
    let mut child = std::process::Command::new("/bin/sleep").arg("30").spawn()?;
    let cluster_id = Uuid::new_v4();
    let registration = Registration::register(cluster_id, Some(root.clone()), false);
    registration.track(InstanceId::master(0), child.id());

    let cleaned = cleanup_cluster(&cluster_id);

    assert!(cleaned, "expected cluster {} to be cleaned up", cluster_id);
    assert!(!is_registered(&cluster_id), "expected cleanup to deregister cluster {}", cluster_id);
    assert!(!root.exists(), "expected cluster root {} to be removed", root.display());
    let mut exited = None;
    for _ in 0..100 {
        exited = child.try_wait()?;
        if exited.is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(exited.is_some(), "expected tracked child to be killed by cleanup");
    Ok(())
}

#[test]
fn untracked_children_are_left_alone() -> Result<()> {
    let mut child = std::process::Command::new("/bin/sleep").arg("30").spawn()?;
    let cluster_id = Uuid::new_v4();
    let registration = Registration::register(cluster_id, None, false);
    registration.track(InstanceId::data_server(0), child.id());
    registration.untrack(&InstanceId::data_server(0));

    cleanup_cluster(&cluster_id);
    std::thread::sleep(Duration::from_millis(100));

    assert!(child.try_wait()?.is_none(), "expected untracked child to survive cleanup");
    child.kill()?;
    child.wait()?;
    Ok(())
}
