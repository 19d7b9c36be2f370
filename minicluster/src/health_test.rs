use std::net::{SocketAddr, TcpListener};

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::{routing::get, Router};
use tokio::sync::oneshot;

use crate::health::HealthProbe;
use crate::retry::Check;

/// Serve the given router on a fresh local port, returning its address & a shutdown trigger.
fn serve(app: Router) -> Result<(SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").context("error binding test listener")?;
    let addr = listener.local_addr()?;
    let (tx, rx) = oneshot::channel::<()>();
    let server = axum::Server::from_tcp(listener)?.serve(app.into_make_service()).with_graceful_shutdown(async move {
        let _res = rx.await;
    });
    tokio::spawn(server);
    Ok((addr, tx))
}

#[tokio::test]
async fn probe_reports_ready_on_ok() -> Result<()> {
    let (addr, _shutdown) = serve(Router::new().route("/healthz", get(|| async { "OK" })))?;

    let healthy = HealthProbe::default().is_healthy(addr).await?;

    assert!(healthy, "expected endpoint at {} to be reported healthy", addr);
    Ok(())
}

#[tokio::test]
async fn probe_reports_not_ready_on_error_status() -> Result<()> {
    let (addr, _shutdown) = serve(Router::new().route("/healthz", get(|| async { StatusCode::SERVICE_UNAVAILABLE })))?;

    let check = HealthProbe::default().check(addr).await?;

    match check {
        Check::NotReady(Some(diag)) => assert!(diag.contains("503"), "expected diagnostic to mention 503, got {}", diag),
        other => panic!("expected NotReady with a diagnostic, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn probe_reports_not_ready_when_nothing_listens() -> Result<()> {
    // Bind & immediately release a port so that nothing is listening on it.
    let addr = TcpListener::bind("127.0.0.1:0")?.local_addr()?;

    let healthy = HealthProbe::default().is_healthy(addr).await?;

    assert!(!healthy, "expected closed port {} to be reported unhealthy", addr);
    Ok(())
}

#[tokio::test]
async fn probe_uses_the_configured_path() -> Result<()> {
    let (addr, _shutdown) = serve(Router::new().route("/status/ready", get(|| async { "OK" })))?;

    let probe = HealthProbe::new("status/ready");
    let healthy = probe.is_healthy(addr).await?;
    let default_healthy = HealthProbe::default().is_healthy(addr).await?;

    assert_eq!(probe.path(), "/status/ready", "expected path to be normalized, got {}", probe.path());
    assert!(healthy, "expected configured path to be reported healthy");
    assert!(!default_healthy, "expected default path to 404 and be reported unhealthy");
    Ok(())
}
