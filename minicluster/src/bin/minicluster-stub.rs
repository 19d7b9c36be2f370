//! A lightweight stand-in for master & data-server binaries.
//!
//! Speaks the same contract as the real servers: it is configured through a gflags flag file
//! given as `--flagfile=<path>` (inline `--name=value` flags override it), binds its RPC address,
//! and serves `GET /healthz` on its web address until SIGTERM or SIGINT.
//!
//! Extra flags control its behavior for testing:
//! - `stub_startup_delay_ms`: sleep this long before opening any port.
//! - `stub_fail_startup`: exit with an error instead of serving.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::{routing::get, Router};
use futures::stream::StreamExt;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio_stream::wrappers::SignalStream;
use tokio_stream::StreamMap;
use tracing_subscriber::prelude::*;

use minicluster::health::DEFAULT_HEALTH_PATH;
use minicluster::layout::{flags, parse_flag, parse_flag_file};

const FLAG_FILE: &str = "flagfile";
const STARTUP_DELAY_MS: &str = "stub_startup_delay_ms";
const FAIL_STARTUP: &str = "stub_fail_startup";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(false))
        .try_init()
        .context("error initializing logging/tracing system")?;

    let res = run().await;
    if let Err(err) = &res {
        tracing::error!(error = ?err, "stub server failed");
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    res
}

async fn run() -> Result<()> {
    let conf = load_flags(std::env::args().skip(1))?;
    let rpc_addr: SocketAddr = required(&conf, flags::RPC_BIND_ADDRESSES)?
        .parse()
        .context("invalid rpc_bind_addresses flag")?;
    let web_host: IpAddr = required(&conf, flags::WEBSERVER_INTERFACE)?
        .parse()
        .context("invalid webserver_interface flag")?;
    let web_port: u16 = required(&conf, flags::WEBSERVER_PORT)?.parse().context("invalid webserver_port flag")?;
    let web_addr = SocketAddr::new(web_host, web_port);
    let masters = conf.get(flags::TSERVER_MASTER_ADDRS).or_else(|| conf.get(flags::MASTER_ADDRESSES));
    tracing::info!(%rpc_addr, %web_addr, masters = ?masters, "starting stub server");

    if let Some(delay) = conf.get(STARTUP_DELAY_MS) {
        let delay: u64 = delay.parse().context("invalid stub_startup_delay_ms flag")?;
        tracing::info!(delay_ms = delay, "delaying startup");
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if conf.get(FAIL_STARTUP).map(String::as_str) == Some("true") {
        bail!("startup failure requested via {}", FAIL_STARTUP);
    }
    if let Some(data_dirs) = conf.get(flags::FS_DATA_DIRS) {
        tokio::fs::create_dir_all(data_dirs).await.context("error creating data dir")?;
        tokio::fs::write(std::path::Path::new(data_dirs).join("stub.pid"), std::process::id().to_string())
            .await
            .context("error writing pid file")?;
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let rpc_listener = TcpListener::bind(rpc_addr).await.with_context(|| format!("error binding rpc address {}", rpc_addr))?;
    let rpc_handle = tokio::spawn(accept_rpc(rpc_listener, shutdown_tx.subscribe()));

    let mut web_shutdown = shutdown_tx.subscribe();
    let app = Router::new().route(DEFAULT_HEALTH_PATH, get(|| async { "OK" }));
    let server = axum::Server::try_bind(&web_addr)
        .with_context(|| format!("error binding web address {}", web_addr))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = web_shutdown.recv().await;
        });
    let web_handle = tokio::spawn(server);
    tracing::info!("stub server is listening at {}{}", web_addr, DEFAULT_HEALTH_PATH);

    let mut signals = StreamMap::new();
    signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
    signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
    if let Some((sig, _)) = signals.next().await {
        tracing::info!(signal = sig, "signal received, beginning graceful shutdown");
    }
    let _ = shutdown_tx.send(());

    if let Err(err) = rpc_handle.await {
        tracing::error!(error = ?err, "error joining rpc listener task");
    }
    match web_handle.await {
        Ok(Err(err)) => tracing::error!(error = ?err, "error shutting down web server"),
        Err(err) => tracing::error!(error = ?err, "error joining web server task"),
        Ok(Ok(())) => (),
    }
    tracing::info!("stub server shutdown complete");
    Ok(())
}

/// Accept & immediately drop RPC connections until shutdown.
async fn accept_rpc(listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((_conn, peer)) => tracing::debug!(%peer, "accepted rpc connection"),
                Err(err) => tracing::warn!(error = ?err, "error accepting rpc connection"),
            },
            _ = shutdown.recv() => break,
        }
    }
}

/// Build the effective flags from the command line, expanding `--flagfile`.
fn load_flags(args: impl Iterator<Item = String>) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for arg in args {
        let (name, value) = match parse_flag(&arg) {
            Some(flag) => flag,
            None => continue,
        };
        if name == FLAG_FILE {
            let contents = std::fs::read_to_string(&value).with_context(|| format!("error reading flag file {}", value))?;
            out.extend(parse_flag_file(&contents));
        } else {
            out.insert(name, value);
        }
    }
    Ok(out)
}

fn required<'a>(conf: &'a BTreeMap<String, String>, name: &str) -> Result<&'a str> {
    conf.get(name).map(String::as_str).with_context(|| format!("missing required flag --{}", name))
}
