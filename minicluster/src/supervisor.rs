//! Cluster supervision.
//!
//! The supervisor owns every instance of a cluster along with its process. It drives the
//! startup protocol (all masters healthy before any data-server launches), watches running
//! instances for unexpected exits, and performs ordered teardown.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::{join_all, try_join_all};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cleanup::Registration;
use crate::error::ClusterError;
use crate::health::HealthProbe;
use crate::layout::{ClusterLayout, InstanceLayout};
use crate::ports::PortReservation;
use crate::process::{LaunchSpec, ProcessHandle};
use crate::retry::{retry_until, Check, RetryError, RetryPolicy};
use crate::topology::{ClusterTopology, InstanceId, InstancePlan, Role};

/// The capacity of the cluster event channel.
const EVENTS_CHANNEL_CAPACITY: usize = 1024;
/// The default interval at which running instances are checked for unexpected exits.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(250);

/// The lifecycle state of an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstanceState {
    /// Planned & materialized on disk, not yet launched.
    Pending,
    /// The process is being spawned.
    Launching,
    /// The process is running, but has not yet passed its readiness check.
    Starting,
    /// The instance passed its readiness check.
    Healthy,
    /// The instance is healthy and the cluster startup has completed.
    Running,
    /// The process is being stopped.
    Stopping,
    /// The process has been stopped deliberately.
    Stopped,
    /// The instance failed to start, or exited on its own.
    Failed,
}

impl InstanceState {
    /// Check if this state is terminal, i.e. the instance has no live process.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Check if this state represents a live, serving instance.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Healthy | Self::Running)
    }

    /// Check if the transition from this state to `next` is legal.
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (Pending, Launching) | (Launching, Starting) | (Starting, Healthy) | (Healthy, Running) => true,
            (Pending, Stopped) => true,
            (Launching | Starting | Healthy | Running, Stopping) => true,
            (Stopping, Stopped) => true,
            (Stopped | Failed, Launching) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Launching => "launching",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event emitted by a cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterEvent {
    /// An instance moved from one state to another.
    StateChanged { instance: InstanceId, from: InstanceState, to: InstanceState },
}

/// The aggregate state of a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterState {
    /// Every instance is running.
    Running,
    /// At least one instance is not live.
    Degraded,
    /// The cluster has been torn down.
    ShutDown,
}

/// A point-in-time snapshot of an instance.
#[derive(Clone, Debug)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub state: InstanceState,
    pub rpc_addr: SocketAddr,
    pub web_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub flag_file: PathBuf,
    pub binary: PathBuf,
    /// The pid of the most recently launched process of this instance.
    pub pid: Option<u32>,
    pub launched_at: Option<Instant>,
    pub healthy_at: Option<Instant>,
    /// A description of the most recent failure of this instance.
    pub failure: Option<String>,
}

/// Runtime settings of a supervisor.
#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub keep_dirs: bool,
    pub retain_logs_on_failure: bool,
    pub cleanup_on_signal: bool,
    /// Extra environment variables given to every child.
    pub env: BTreeMap<String, String>,
    pub health_path: String,
    pub monitor_interval: Duration,
}

/// A supervised instance along with its process, if launched.
struct InstanceSlot {
    plan: InstancePlan,
    layout: InstanceLayout,
    binary: PathBuf,
    state: InstanceState,
    process: Option<ProcessHandle>,
    pid: Option<u32>,
    launched_at: Option<Instant>,
    healthy_at: Option<Instant>,
    failure: Option<String>,
}

impl InstanceSlot {
    fn launch_spec(&self, env: &BTreeMap<String, String>) -> LaunchSpec {
        LaunchSpec {
            id: self.plan.id,
            binary: self.binary.clone(),
            args: vec![format!("--flagfile={}", self.layout.flag_file.display())],
            working_dir: self.layout.data_dir.clone(),
            env: env.clone(),
            log_dir: self.layout.log_dir.clone(),
            stdout: self.layout.stdout_log(),
            stderr: self.layout.stderr_log(),
        }
    }

    fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.plan.id,
            state: self.state,
            rpc_addr: self.plan.rpc_addr,
            web_addr: self.plan.web_addr,
            data_dir: self.layout.data_dir.clone(),
            log_dir: self.layout.log_dir.clone(),
            flag_file: self.layout.flag_file.clone(),
            binary: self.binary.clone(),
            pid: self.pid,
            launched_at: self.launched_at,
            healthy_at: self.healthy_at,
            failure: self.failure.clone(),
        }
    }
}

/// The owner & state machine of all instances of one cluster.
pub struct ClusterSupervisor {
    cluster_id: Uuid,
    topology: Arc<ClusterTopology>,
    layout: ClusterLayout,
    settings: SupervisorSettings,
    probe: HealthProbe,

    /// All instances, keyed by id. Never held across an await.
    slots: Mutex<BTreeMap<InstanceId, InstanceSlot>>,
    /// The channel of cluster events.
    events: broadcast::Sender<ClusterEvent>,
    /// Port reservations held until teardown.
    reservations: Mutex<Vec<PortReservation>>,
    /// This cluster's entry in the process-level cleanup list.
    registration: Mutex<Option<Registration>>,

    /// A channel used for triggering monitor shutdown.
    monitor_shutdown: broadcast::Sender<()>,
    /// The join handle of the exit monitor.
    monitor: Mutex<Option<JoinHandle<()>>>,
    /// Serializes concurrent teardown callers.
    teardown_lock: tokio::sync::Mutex<()>,
    torn_down: AtomicBool,
}

impl ClusterSupervisor {
    /// Create a new instance supervising the given materialized instances.
    ///
    /// Every instance of the topology must have a `(layout, binary)` entry. The cluster is
    /// registered with the process-level cleanup list immediately.
    pub fn new(
        cluster_id: Uuid, topology: Arc<ClusterTopology>, layout: ClusterLayout, instances: BTreeMap<InstanceId, (InstanceLayout, PathBuf)>,
        reservations: Vec<PortReservation>, settings: SupervisorSettings,
    ) -> Result<Arc<Self>> {
        let mut instances = instances;
        let mut slots = BTreeMap::new();
        for plan in topology.instances() {
            let (instance_layout, binary) = instances
                .remove(&plan.id)
                .ok_or_else(|| ClusterError::config(format!("no layout materialized for {}", plan.id)))?;
            slots.insert(
                plan.id,
                InstanceSlot {
                    plan: plan.clone(),
                    layout: instance_layout,
                    binary,
                    state: InstanceState::Pending,
                    process: None,
                    pid: None,
                    launched_at: None,
                    healthy_at: None,
                    failure: None,
                },
            );
        }
        if let Some(id) = instances.keys().next() {
            return Err(ClusterError::UnknownInstance(*id).into());
        }

        let cleanup_root = if settings.keep_dirs { None } else { Some(layout.root().to_path_buf()) };
        let registration = Registration::register(cluster_id, cleanup_root, settings.cleanup_on_signal);
        let (events, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);
        let (monitor_shutdown, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            cluster_id,
            topology,
            layout,
            probe: HealthProbe::new(&settings.health_path),
            settings,
            slots: Mutex::new(slots),
            events,
            reservations: Mutex::new(reservations),
            registration: Mutex::new(Some(registration)),
            monitor_shutdown,
            monitor: Mutex::new(None),
            teardown_lock: tokio::sync::Mutex::new(()),
            torn_down: AtomicBool::new(false),
        }))
    }

    pub fn cluster_id(&self) -> Uuid {
        self.cluster_id
    }

    pub fn topology(&self) -> Arc<ClusterTopology> {
        self.topology.clone()
    }

    pub fn layout(&self) -> &ClusterLayout {
        &self.layout
    }

    /// Subscribe to the events of this cluster.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Check if this cluster has been torn down.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Start the cluster: masters first, then data-servers, each group concurrently.
    ///
    /// On any failure every launched instance is stopped, reservations are released, and the
    /// root cause is returned.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        tracing::debug!(
            cluster_id = %self.cluster_id,
            masters = self.topology.num_masters(),
            data_servers = self.topology.num_data_servers(),
            "starting cluster"
        );
        if let Err(err) = self.start_groups().await {
            tracing::error!(error = %err, cluster_id = %self.cluster_id, "error starting cluster, tearing down");
            let _guard = self.teardown_lock.lock().await;
            self.teardown(true).await;
            return Err(err);
        }

        {
            let mut slots = self.slots.lock();
            for slot in slots.values_mut() {
                self.transition(slot, InstanceState::Running);
            }
        }
        self.spawn_monitor();
        tracing::info!(cluster_id = %self.cluster_id, root = %self.layout.root().display(), "cluster is running");
        Ok(())
    }

    async fn start_groups(&self) -> Result<()> {
        for role in [Role::Master, Role::DataServer] {
            let ids: Vec<InstanceId> = self.topology.instances_of(role).iter().map(|plan| plan.id).collect();
            if ids.is_empty() {
                continue;
            }
            try_join_all(ids.into_iter().map(|id| self.launch_and_await(id))).await?;
            tracing::debug!(cluster_id = %self.cluster_id, %role, "all instances of role are healthy");
        }
        Ok(())
    }

    async fn launch_and_await(&self, id: InstanceId) -> Result<()> {
        self.launch(id)?;
        self.await_healthy(id).await
    }

    /// Spawn the process of the given instance.
    fn launch(&self, id: InstanceId) -> Result<()> {
        let spec = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(&id).ok_or(ClusterError::UnknownInstance(id))?;
            if !self.transition(slot, InstanceState::Launching) {
                return Err(ClusterError::config(format!("{} can not be launched while {}", id, slot.state)).into());
            }
            slot.failure = None;
            slot.healthy_at = None;
            slot.launch_spec(&self.settings.env)
        };

        let res = ProcessHandle::spawn(spec);
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&id).ok_or(ClusterError::UnknownInstance(id))?;
        match res {
            Ok(process) => {
                slot.pid = process.pid();
                if let (Some(pid), Some(registration)) = (slot.pid, self.registration.lock().as_ref()) {
                    registration.track(id, pid);
                }
                slot.process = Some(process);
                slot.launched_at = Some(Instant::now());
                self.transition(slot, InstanceState::Starting);
                tracing::info!(instance = %id, pid = ?slot.pid, rpc_addr = %slot.plan.rpc_addr, "launched instance");
                Ok(())
            }
            Err(err) => {
                slot.failure = Some(err.to_string());
                self.transition(slot, InstanceState::Failed);
                Err(err)
            }
        }
    }

    /// Poll the given instance until it is healthy, it exits, or the startup timeout elapses.
    async fn await_healthy(&self, id: InstanceId) -> Result<()> {
        let (web_addr, log_dir) = {
            let slots = self.slots.lock();
            let slot = slots.get(&id).ok_or(ClusterError::UnknownInstance(id))?;
            (slot.plan.web_addr, slot.layout.log_dir.clone())
        };
        let policy = RetryPolicy::new(self.settings.startup_timeout);
        let res = retry_until(&policy, || {
            let log_dir = log_dir.clone();
            async move {
                if let Some(status) = self.exit_status(&id) {
                    return Check::Abort(
                        ClusterError::LaunchFailure {
                            instance: id,
                            reason: format!("process exited during startup with {}", status),
                            log_dir,
                        }
                        .into(),
                    );
                }
                match self.probe.check(web_addr).await {
                    Ok(check) => check,
                    Err(err) => Check::NotReady(Some(err.to_string())),
                }
            }
        })
        .await;

        let err: anyhow::Error = match res {
            Ok(()) => {
                let mut slots = self.slots.lock();
                let slot = slots.get_mut(&id).ok_or(ClusterError::UnknownInstance(id))?;
                slot.healthy_at = Some(Instant::now());
                self.transition(slot, InstanceState::Healthy);
                tracing::info!(instance = %id, web_addr = %web_addr, path = %self.probe.path(), "instance is healthy");
                return Ok(());
            }
            Err(RetryError::Aborted(err)) => err,
            Err(RetryError::DeadlineElapsed { last_error, .. }) => ClusterError::HealthCheckTimeout {
                instance: id,
                timeout: self.settings.startup_timeout,
                log_dir,
                last_error,
            }
            .into(),
        };
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&id) {
            slot.failure = Some(err.to_string());
            self.transition(slot, InstanceState::Failed);
        }
        Err(err)
    }

    /// The exit status of the given instance's process, if it has exited.
    fn exit_status(&self, id: &InstanceId) -> Option<std::process::ExitStatus> {
        let mut slots = self.slots.lock();
        let process = slots.get_mut(id)?.process.as_mut()?;
        match process.try_exit() {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(error = ?err, instance = %id, "error checking instance process");
                None
            }
        }
    }

    /// Apply a state transition to the given slot, emitting an event.
    ///
    /// Illegal transitions are logged & skipped, returning false.
    fn transition(&self, slot: &mut InstanceSlot, to: InstanceState) -> bool {
        let from = slot.state;
        if from == to {
            return true;
        }
        if !from.can_transition_to(to) {
            tracing::warn!(instance = %slot.plan.id, %from, %to, "rejecting illegal instance state transition");
            return false;
        }
        slot.state = to;
        tracing::debug!(instance = %slot.plan.id, %from, %to, "instance state changed");
        let _ = self.events.send(ClusterEvent::StateChanged { instance: slot.plan.id, from, to });
        true
    }

    /// Mark the instance of the given slot as failed if its live process has exited.
    fn check_exit(&self, slot: &mut InstanceSlot) {
        if !slot.state.is_live() {
            return;
        }
        let id = slot.plan.id;
        let status = match slot.process.as_mut().map(|process| process.try_exit()) {
            Some(Ok(Some(status))) => status,
            Some(Err(err)) => {
                tracing::warn!(error = ?err, instance = %id, "error checking instance process");
                return;
            }
            _ => return,
        };
        let err = ClusterError::UnexpectedExit {
            instance: id,
            status: status.to_string(),
        };
        tracing::error!(error = %err, instance = %id, pid = ?slot.pid, "instance exited unexpectedly");
        slot.failure = Some(err.to_string());
        self.transition(slot, InstanceState::Failed);
        if let Some(registration) = self.registration.lock().as_ref() {
            registration.untrack(&id);
        }
    }

    /// Check every live instance for an unexpected exit.
    fn poll_exits(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.values_mut() {
            self.check_exit(slot);
        }
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let supervisor = Arc::downgrade(self);
        let mut shutdown = self.monitor_shutdown.subscribe();
        let mut interval = tokio::time::interval(self.settings.monitor_interval);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = interval.tick() => match supervisor.upgrade() {
                        Some(supervisor) => supervisor.poll_exits(),
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            tracing::debug!("cluster exit monitor has shutdown");
        });
        *self.monitor.lock() = Some(handle);
    }

    /// The current state of the given instance, re-checking its process first.
    pub fn status(&self, id: &InstanceId) -> Option<InstanceState> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(id)?;
        self.check_exit(slot);
        Some(slot.state)
    }

    /// A snapshot of the given instance.
    pub fn instance(&self, id: &InstanceId) -> Option<InstanceInfo> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(id)?;
        self.check_exit(slot);
        Some(slot.info())
    }

    /// Snapshots of all instances, masters first.
    pub fn instances(&self) -> Vec<InstanceInfo> {
        let mut slots = self.slots.lock();
        slots
            .values_mut()
            .map(|slot| {
                self.check_exit(slot);
                slot.info()
            })
            .collect()
    }

    /// The aggregate state of the cluster.
    pub fn state(&self) -> ClusterState {
        if self.is_torn_down() {
            return ClusterState::ShutDown;
        }
        let mut slots = self.slots.lock();
        let mut all_running = true;
        for slot in slots.values_mut() {
            self.check_exit(slot);
            all_running &= slot.state == InstanceState::Running;
        }
        if all_running {
            ClusterState::Running
        } else {
            ClusterState::Degraded
        }
    }

    /// Gracefully stop a single instance. Stopping a stopped or failed instance is a no-op.
    pub async fn stop_instance(&self, id: &InstanceId) -> Result<()> {
        if self.is_torn_down() {
            return Err(ClusterError::ShutDown.into());
        }
        let process = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(id).ok_or(ClusterError::UnknownInstance(*id))?;
            self.check_exit(slot);
            match slot.state {
                InstanceState::Stopped | InstanceState::Failed => return Ok(()),
                InstanceState::Pending => {
                    self.transition(slot, InstanceState::Stopped);
                    return Ok(());
                }
                _ => (),
            }
            if !self.transition(slot, InstanceState::Stopping) {
                return Err(ClusterError::config(format!("{} can not be stopped while {}", id, slot.state)).into());
            }
            slot.process.take()
        };

        if let Some(mut process) = process {
            let outcome = process.stop(self.settings.shutdown_grace).await;
            tracing::info!(instance = %id, ?outcome, "stopped instance");
        }
        let mut slots = self.slots.lock();
        if let Some(registration) = self.registration.lock().as_ref() {
            registration.untrack(id);
        }
        if let Some(slot) = slots.get_mut(id) {
            self.transition(slot, InstanceState::Stopped);
        }
        Ok(())
    }

    /// Relaunch a stopped or failed instance with its original addresses, directories & flags,
    /// waiting for it to become healthy.
    pub async fn restart_instance(&self, id: &InstanceId) -> Result<()> {
        if self.is_torn_down() {
            return Err(ClusterError::ShutDown.into());
        }
        let stale = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(id).ok_or(ClusterError::UnknownInstance(*id))?;
            self.check_exit(slot);
            if !slot.state.is_terminal() {
                return Err(ClusterError::config(format!("{} is {}, only stopped or failed instances can be restarted", id, slot.state)).into());
            }
            slot.process.take()
        };
        // A failed instance may still have a live process, e.g. after a health check timeout.
        if let Some(mut process) = stale {
            process.stop(self.settings.shutdown_grace).await;
        }

        tracing::info!(instance = %id, "restarting instance");
        if let Err(err) = self.launch_and_await(*id).await {
            let process = self.slots.lock().get_mut(id).and_then(|slot| slot.process.take());
            if let Some(mut process) = process {
                process.stop(self.settings.shutdown_grace).await;
            }
            if let Some(registration) = self.registration.lock().as_ref() {
                registration.untrack(id);
            }
            return Err(err);
        }
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(id) {
            self.transition(slot, InstanceState::Running);
        }
        Ok(())
    }

    /// Shut the cluster down. Idempotent; concurrent callers wait for the first to finish.
    pub async fn shutdown(&self) {
        let _guard = self.teardown_lock.lock().await;
        if self.is_torn_down() {
            return;
        }
        tracing::info!(cluster_id = %self.cluster_id, "shutting down cluster");
        self.teardown(false).await;
        tracing::info!(cluster_id = %self.cluster_id, "cluster shutdown complete");
    }

    /// Stop every instance, data-servers first, then remove directories & release resources.
    ///
    /// Must be called while holding the teardown lock.
    async fn teardown(&self, startup_failed: bool) {
        let _ = self.monitor_shutdown.send(());
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            if let Err(err) = monitor.await {
                tracing::error!(error = ?err, "error joining cluster exit monitor");
            }
        }

        for role in [Role::DataServer, Role::Master] {
            self.stop_group(role).await;
        }

        if !self.settings.keep_dirs {
            let layout = self.layout.clone();
            let data_only = startup_failed && self.settings.retain_logs_on_failure;
            let res = tokio::task::spawn_blocking(move || if data_only { layout.remove_data() } else { layout.remove_all() }).await;
            match res {
                Ok(Ok(())) => (),
                Ok(Err(err)) => tracing::warn!(error = ?err, root = %self.layout.root().display(), "error removing cluster directories"),
                Err(err) => tracing::error!(error = ?err, "error joining directory removal task"),
            }
            if data_only {
                tracing::info!(root = %self.layout.root().display(), "retained cluster logs after failed startup");
            }
        }

        self.reservations.lock().clear();
        self.registration.lock().take();
        self.torn_down.store(true, Ordering::SeqCst);
    }

    /// Stop all instances of the given role concurrently.
    async fn stop_group(&self, role: Role) {
        let targets: Vec<(InstanceId, ProcessHandle)> = {
            let mut slots = self.slots.lock();
            let mut targets = vec![];
            for slot in slots.values_mut().filter(|slot| slot.plan.id.role == role) {
                match slot.state {
                    InstanceState::Pending => {
                        self.transition(slot, InstanceState::Stopped);
                    }
                    InstanceState::Stopped | InstanceState::Failed => (),
                    _ => {
                        self.transition(slot, InstanceState::Stopping);
                    }
                }
                if let Some(process) = slot.process.take() {
                    targets.push((slot.plan.id, process));
                }
            }
            targets
        };

        let grace = self.settings.shutdown_grace;
        let stopped = join_all(targets.into_iter().map(|(id, mut process)| async move {
            let outcome = process.stop(grace).await;
            tracing::debug!(instance = %id, ?outcome, "stopped instance process");
            id
        }))
        .await;

        let mut slots = self.slots.lock();
        for id in stopped {
            if let Some(registration) = self.registration.lock().as_ref() {
                registration.untrack(&id);
            }
            if let Some(slot) = slots.get_mut(&id) {
                if slot.state == InstanceState::Stopping {
                    self.transition(slot, InstanceState::Stopped);
                }
            }
        }
    }
}

impl Drop for ClusterSupervisor {
    fn drop(&mut self) {
        if self.is_torn_down() {
            return;
        }
        tracing::warn!(cluster_id = %self.cluster_id, "cluster dropped without shutdown, force killing instances");
        // Processes are spawned with kill-on-drop.
        let slots = std::mem::take(&mut *self.slots.lock());
        drop(slots);
        if !self.settings.keep_dirs {
            if let Err(err) = self.layout.remove_all() {
                tracing::warn!(error = ?err, root = %self.layout.root().display(), "error removing cluster directories");
            }
        }
    }
}
