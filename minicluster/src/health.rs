//! Application-level readiness checks.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use hyper::client::HttpConnector;
use hyper::{Client, StatusCode, Uri};

use crate::retry::Check;

/// The default HTTP path probed for readiness.
pub const DEFAULT_HEALTH_PATH: &str = "/healthz";
/// The time allowed for a single probe request.
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Probes an instance's web/status endpoint over HTTP.
///
/// An instance is ready only when the endpoint answers with `200 OK`. A live process which is
/// not yet accepting requests is reported as not ready.
#[derive(Clone, Debug)]
pub struct HealthProbe {
    client: Client<HttpConnector>,
    path: String,
    request_timeout: Duration,
}

impl HealthProbe {
    /// Create a new instance probing the given HTTP path.
    pub fn new(path: impl AsRef<str>) -> Self {
        let path = path.as_ref();
        let path = if path.starts_with('/') { path.to_string() } else { format!("/{}", path) };
        Self {
            client: Client::new(),
            path,
            request_timeout: PROBE_REQUEST_TIMEOUT,
        }
    }

    /// The HTTP path being probed.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Probe the given web address once.
    pub async fn check(&self, addr: SocketAddr) -> Result<Check> {
        let uri: Uri = format!("http://{}{}", addr, self.path).parse().context("error building health check URI")?;
        let res = match tokio::time::timeout(self.request_timeout, self.client.get(uri)).await {
            Ok(res) => res,
            Err(_elapsed) => return Ok(Check::NotReady(Some(format!("health check to {} timed out", addr)))),
        };
        match res {
            Ok(res) if res.status() == StatusCode::OK => Ok(Check::Ready),
            Ok(res) => Ok(Check::NotReady(Some(format!("health check to {} returned {}", addr, res.status())))),
            Err(err) => Ok(Check::NotReady(Some(format!("health check to {} failed: {}", addr, err)))),
        }
    }

    /// Probe the given web address once, reducing the outcome to a bool.
    #[cfg(test)]
    pub(crate) async fn is_healthy(&self, addr: SocketAddr) -> Result<bool> {
        Ok(matches!(self.check(addr).await?, Check::Ready))
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_PATH)
    }
}
