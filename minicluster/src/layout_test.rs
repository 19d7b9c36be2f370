use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::error::ClusterError;
use crate::layout::{flags, parse_flag_file, render_flag_file, ClusterLayout, InstanceConfigBuilder};
use crate::topology::{ClusterTopology, InstanceId, Role};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn topology(masters: u16, data_servers: u16) -> Result<ClusterTopology> {
    let masters = (0..masters).map(|idx| (addr(7000 + idx), addr(8000 + idx))).collect();
    let data_servers = (0..data_servers).map(|idx| (addr(7100 + idx), addr(8100 + idx))).collect();
    ClusterTopology::new(masters, data_servers, None)
}

#[tokio::test]
async fn materialize_creates_distinct_dirs_and_flag_files() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let layout = ClusterLayout::create(tmpdir.path(), Uuid::new_v4()).await?;
    let topology = topology(3, 2)?;
    let (role_flags, instance_flags) = (BTreeMap::new(), BTreeMap::new());
    let builder = InstanceConfigBuilder::new(&layout, &topology, &role_flags, &instance_flags);

    let mut data_dirs = HashSet::new();
    for plan in topology.instances() {
        let instance = builder.materialize(&plan.id).await?;
        assert!(instance.data_dir.join("wal").is_dir(), "expected wal dir for {}", plan.id);
        assert!(instance.log_dir.is_dir(), "expected log dir for {}", plan.id);
        assert!(instance.flag_file.is_file(), "expected flag file for {}", plan.id);
        assert!(instance.data_dir.starts_with(layout.root()), "expected data dir under the cluster root");
        assert!(data_dirs.insert(instance.data_dir.clone()), "data dir {} assigned twice", instance.data_dir.display());
    }
    assert!(
        layout.data_dir(&InstanceId::data_server(1)).ends_with("data/tserver-1"),
        "unexpected data dir layout {}",
        layout.data_dir(&InstanceId::data_server(1)).display()
    );
    assert!(
        layout.flag_file(&InstanceId::master(0)).ends_with("conf/master-0.flags"),
        "unexpected flag file layout {}",
        layout.flag_file(&InstanceId::master(0)).display()
    );

    Ok(())
}

#[tokio::test]
async fn flag_files_carry_addresses_and_master_list() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let layout = ClusterLayout::create(tmpdir.path(), Uuid::new_v4()).await?;
    let topology = topology(2, 1)?;
    let (role_flags, instance_flags) = (BTreeMap::new(), BTreeMap::new());
    let builder = InstanceConfigBuilder::new(&layout, &topology, &role_flags, &instance_flags);
    let expected_masters = "127.0.0.1:7000,127.0.0.1:7001";

    let master = builder.materialize(&InstanceId::master(1)).await?;
    let tserver = builder.materialize(&InstanceId::data_server(0)).await?;
    let master_flags = parse_flag_file(&tokio::fs::read_to_string(&master.flag_file).await?);
    let tserver_flags = parse_flag_file(&tokio::fs::read_to_string(&tserver.flag_file).await?);

    assert_eq!(master_flags.get(flags::RPC_BIND_ADDRESSES).map(String::as_str), Some("127.0.0.1:7001"));
    assert_eq!(master_flags.get(flags::WEBSERVER_PORT).map(String::as_str), Some("8001"));
    assert_eq!(master_flags.get(flags::WEBSERVER_INTERFACE).map(String::as_str), Some("127.0.0.1"));
    assert_eq!(master_flags.get(flags::MASTER_ADDRESSES).map(String::as_str), Some(expected_masters));
    assert_eq!(master_flags.get(flags::DEFAULT_NUM_REPLICAS).map(String::as_str), Some("1"));
    assert!(master_flags.get(flags::TSERVER_MASTER_ADDRS).is_none(), "masters must not carry tserver_master_addrs");

    assert_eq!(tserver_flags.get(flags::RPC_BIND_ADDRESSES).map(String::as_str), Some("127.0.0.1:7100"));
    assert_eq!(tserver_flags.get(flags::TSERVER_MASTER_ADDRS).map(String::as_str), Some(expected_masters));
    assert_eq!(
        tserver_flags.get(flags::LOG_DIR).map(String::as_str),
        Some(tserver.log_dir.display().to_string().as_str())
    );

    Ok(())
}

#[tokio::test]
async fn single_master_omits_master_addresses() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let layout = ClusterLayout::create(tmpdir.path(), Uuid::new_v4()).await?;
    let topology = topology(1, 0)?;
    let (role_flags, instance_flags) = (BTreeMap::new(), BTreeMap::new());
    let builder = InstanceConfigBuilder::new(&layout, &topology, &role_flags, &instance_flags);

    let computed = builder.flags(&InstanceId::master(0))?;

    assert!(computed.get(flags::MASTER_ADDRESSES).is_none(), "expected no master_addresses flag for a single master");
    Ok(())
}

#[test]
fn extra_flags_override_in_precedence_order() -> Result<()> {
    let layout_root = std::env::temp_dir();
    let layout = ClusterLayout::new_test(layout_root);
    let topology = topology(1, 2)?;
    let mut role_flags = BTreeMap::new();
    role_flags.insert(
        Role::DataServer,
        BTreeMap::from([
            ("never_fsync".to_string(), "false".to_string()),
            ("block_cache_capacity_mb".to_string(), "64".to_string()),
        ]),
    );
    let mut instance_flags = BTreeMap::new();
    instance_flags.insert(InstanceId::data_server(1), BTreeMap::from([("block_cache_capacity_mb".to_string(), "128".to_string())]));
    let builder = InstanceConfigBuilder::new(&layout, &topology, &role_flags, &instance_flags);

    let ts0 = builder.flags(&InstanceId::data_server(0))?;
    let ts1 = builder.flags(&InstanceId::data_server(1))?;
    let master = builder.flags(&InstanceId::master(0))?;

    assert_eq!(ts0.get("never_fsync").map(String::as_str), Some("false"), "role flag should override defaults");
    assert_eq!(ts0.get("block_cache_capacity_mb").map(String::as_str), Some("64"));
    assert_eq!(ts1.get("block_cache_capacity_mb").map(String::as_str), Some("128"), "instance flag should override role flag");
    assert_eq!(master.get("never_fsync").map(String::as_str), Some("true"), "role flags must not leak into other roles");
    assert!(master.get("block_cache_capacity_mb").is_none(), "role flags must not leak into other roles");
    Ok(())
}

#[test]
fn flags_for_unknown_instance_are_rejected() -> Result<()> {
    let layout = ClusterLayout::new_test(std::env::temp_dir());
    let topology = topology(1, 0)?;
    let (role_flags, instance_flags) = (BTreeMap::new(), BTreeMap::new());
    let builder = InstanceConfigBuilder::new(&layout, &topology, &role_flags, &instance_flags);

    let err = builder.flags(&InstanceId::data_server(0)).err().context("expected an error for an unknown instance")?;

    assert!(
        matches!(err.downcast_ref::<ClusterError>(), Some(ClusterError::UnknownInstance(id)) if *id == InstanceId::data_server(0)),
        "unexpected error {:?}",
        err
    );
    Ok(())
}

#[tokio::test]
async fn create_fails_with_configuration_error_on_unusable_base() -> Result<()> {
    let file = tempfile::NamedTempFile::new()?;

    let res = ClusterLayout::create(&file.path().join("nested"), Uuid::new_v4()).await;

    let err = res.err().context("expected an error creating a cluster root beneath a regular file")?;
    assert!(
        matches!(err.downcast_ref::<ClusterError>(), Some(ClusterError::ConfigurationError(_))),
        "expected ConfigurationError, got {:?}",
        err
    );
    Ok(())
}

#[test]
fn parse_flag_file_handles_comments_bools_and_overrides() {
    let parsed = parse_flag_file("# comment\n\n--a=1\n--enable_x\n  --b=x=y  \n--a=2\n");

    assert_eq!(parsed.get("a").map(String::as_str), Some("2"), "later flags should win");
    assert_eq!(parsed.get("enable_x").map(String::as_str), Some("true"), "bare flags should parse as true");
    assert_eq!(parsed.get("b").map(String::as_str), Some("x=y"), "only the first `=` should split");
    assert_eq!(parsed.len(), 3, "unexpected flags parsed: {:?}", parsed);
}

#[test]
fn render_then_parse_preserves_flags() {
    let flags = BTreeMap::from([("rpc_bind_addresses".to_string(), "127.0.0.1:7051".to_string()), ("never_fsync".to_string(), "true".to_string())]);

    let rendered = render_flag_file(&flags);

    assert_eq!(rendered, "--never_fsync=true\n--rpc_bind_addresses=127.0.0.1:7051\n");
    assert_eq!(parse_flag_file(&rendered), flags);
}
