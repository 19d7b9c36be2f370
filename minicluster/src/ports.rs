//! Local port reservation.
//!
//! Ports are found by binding `host:0` and letting the OS pick a free port. All listeners of a
//! batch are held open until the batch is complete, which keeps ports within one reservation
//! distinct. A process-wide set of handed-out ports keeps concurrently running clusters of the
//! same host process from being given the same port.
//!
//! Reservations are advisory. Between releasing the probe listener and the child process
//! binding the port, another process on the host may take it. This race is accepted.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr, TcpListener};

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::error::ClusterError;

/// The number of probe attempts allowed per requested port.
pub const DEFAULT_PROBE_ATTEMPTS_PER_PORT: usize = 10;
/// The most ports a single reservation can hold, excluding port 0.
pub const MAX_PORTS: usize = u16::MAX as usize;

lazy_static! {
    /// All addresses currently reserved by any cluster of this process.
    static ref RESERVED: Mutex<HashSet<SocketAddr>> = Mutex::new(HashSet::new());
}

/// A port held exclusively by one instance until released.
///
/// Dropping the reservation releases it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct PortReservation {
    addr: SocketAddr,
}

impl PortReservation {
    /// The reserved port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The reserved bind address & port.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Explicitly release this reservation.
    pub fn release(self) {}
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        RESERVED.lock().remove(&self.addr);
    }
}

/// Check if the given address is currently reserved by this process.
pub fn is_reserved(addr: &SocketAddr) -> bool {
    RESERVED.lock().contains(addr)
}

/// Reserves free local ports by probing the OS.
#[derive(Clone, Debug)]
pub struct PortAllocator {
    bind_host: IpAddr,
    attempts_per_port: usize,
}

impl PortAllocator {
    /// Create a new instance which reserves ports on the given host address.
    pub fn new(bind_host: IpAddr) -> Self {
        Self {
            bind_host,
            attempts_per_port: DEFAULT_PROBE_ATTEMPTS_PER_PORT,
        }
    }

    /// Set the number of probe attempts allowed per requested port.
    pub fn with_attempts_per_port(mut self, attempts_per_port: usize) -> Self {
        self.attempts_per_port = attempts_per_port;
        self
    }

    /// Reserve `count` distinct ports which are currently free on the bind host.
    pub fn reserve(&self, count: usize) -> Result<Vec<PortReservation>> {
        if count > MAX_PORTS {
            let msg = format!("{} ports requested, but at most {} exist on {}", count, MAX_PORTS, self.bind_host);
            return Err(ClusterError::ResourceExhausted(msg).into());
        }
        let max_attempts = count.saturating_mul(self.attempts_per_port);
        let mut reservations = Vec::with_capacity(count);
        let mut listeners = Vec::with_capacity(count);
        let mut attempts = 0;
        while reservations.len() < count {
            if attempts >= max_attempts {
                return Err(ClusterError::ResourceExhausted(format!(
                    "found only {} of {} free ports on {} after {} probe attempts",
                    reservations.len(),
                    count,
                    self.bind_host,
                    attempts
                ))
                .into());
            }
            attempts += 1;

            let listener = match TcpListener::bind((self.bind_host, 0)) {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::debug!(error = ?err, host = %self.bind_host, "error probing for free port");
                    continue;
                }
            };
            let addr = listener.local_addr().context("error reading local address of probe listener")?;
            if !RESERVED.lock().insert(addr) {
                tracing::trace!(%addr, "probed port is already reserved by another cluster");
                continue;
            }
            reservations.push(PortReservation { addr });
            listeners.push(listener);
        }
        tracing::trace!(count, attempts, "reserved ports");
        Ok(reservations)
    }
}
