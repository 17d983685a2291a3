//! Cluster lifecycle orchestration.
//!
//! [`ClusterSupervisor`] drives a plan through spawn, readiness, replica set
//! configuration and shard registration, then persists what it started.
//! Each step is a [`LaunchState`] transition; a failure after the first
//! spawn tears down everything already started before the error surfaces.

use crate::client::{AdminClient, ShellAdminClient, ShellTls};
use crate::node::{
    ForkingSpawner, Launcher, ProcessSpawner, ProcessStatus, ReadinessProbe, RuntimeProcess,
    Signal, TcpProbe,
};
use crate::plan::{ClusterPlan, NodeRole, NodeSpec, TopologyKind};
use crate::replset::{ConfigureOutcome, ReplicaSetConfigurator};
use crate::retry::RetryPolicy;
use crate::shards::ShardRegistrator;
use crate::state::{PersistedState, StateStore};
use crate::topology::SslBundle;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchState {
    Planned,
    Launching,
    AwaitingReadiness,
    ConfiguringReplicaSets,
    RegisteringShards,
    Running,
    Failed(String),
    Stopping,
    Stopped,
}

impl LaunchState {
    /// Whether bring-up is underway.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            LaunchState::Launching
                | LaunchState::AwaitingReadiness
                | LaunchState::ConfiguringReplicaSets
                | LaunchState::RegisteringShards
        )
    }

    pub fn can_transition_to(&self, next: &LaunchState) -> bool {
        use LaunchState::*;
        match (self, next) {
            (_, Failed(_)) => self.is_in_progress(),
            (Planned | Stopped | Running, Launching) => true,
            (Launching, AwaitingReadiness) => true,
            (AwaitingReadiness, ConfiguringReplicaSets | Running) => true,
            (ConfiguringReplicaSets, RegisteringShards | Running) => true,
            (RegisteringShards, Running) => true,
            (Running | Failed(_), Stopping) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            LaunchState::Planned => "planned",
            LaunchState::Launching => "launching",
            LaunchState::AwaitingReadiness => "awaiting-readiness",
            LaunchState::ConfiguringReplicaSets => "configuring-replica-sets",
            LaunchState::RegisteringShards => "registering-shards",
            LaunchState::Running => "running",
            LaunchState::Failed(_) => "failed",
            LaunchState::Stopping => "stopping",
            LaunchState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LaunchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchState::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}

/// External collaborators the supervisor drives.
#[derive(Clone)]
pub struct Collaborators {
    pub spawner: Arc<dyn ProcessSpawner>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub admin: Arc<dyn AdminClient>,
}

impl Collaborators {
    /// Local processes, TCP readiness, and the admin shell at `shell`.
    ///
    /// With SSL enabled the shell connects using the client certificate
    /// when one is given, the server PEM file otherwise.
    pub fn local(shell: impl Into<PathBuf>, ssl: Option<&SslBundle>) -> Self {
        let mut admin = ShellAdminClient::new(shell);
        if let Some(ssl) = ssl {
            admin = admin.with_tls(ShellTls {
                ca_file: ssl.ca_file.clone(),
                certificate_key_file: Some(
                    ssl.client_certificate
                        .clone()
                        .unwrap_or_else(|| ssl.pem_key_file.clone()),
                ),
            });
        }
        Self {
            spawner: Arc::new(ForkingSpawner),
            probe: Arc::new(TcpProbe::default()),
            admin: Arc::new(admin),
        }
    }
}

/// Bounds for every wait the supervisor performs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policies {
    pub readiness: RetryPolicy,
    pub convergence: RetryPolicy,
    pub registration: RetryPolicy,
    pub shutdown: RetryPolicy,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            readiness: RetryPolicy::fixed(120, Duration::from_millis(500)),
            convergence: RetryPolicy::fixed(120, Duration::from_secs(1)),
            registration: RetryPolicy::fixed(30, Duration::from_secs(1)),
            shutdown: RetryPolicy::fixed(60, Duration::from_millis(500)),
        }
    }
}

impl Policies {
    /// No sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        let policy = RetryPolicy::immediate(max_attempts);
        Self {
            readiness: policy,
            convergence: policy,
            registration: policy,
            shutdown: policy,
        }
    }
}

/// One process as seen by `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessReport {
    pub id: String,
    pub role: NodeRole,
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub replica_set: Option<String>,
    pub status: ProcessStatus,
    pub alive: bool,
    pub command_line: String,
}

impl ProcessReport {
    fn new(process: &RuntimeProcess, alive: bool) -> Self {
        Self {
            id: process.node.id.clone(),
            role: process.node.role,
            host: process.node.host.clone(),
            port: process.node.port,
            pid: process.pid,
            replica_set: process.node.replica_set.clone(),
            status: process.status,
            alive,
            command_line: process.command_line.clone(),
        }
    }

    /// Recorded status disagrees with what the OS reports.
    pub fn drifted(&self) -> bool {
        match self.status {
            ProcessStatus::Stopped => self.alive,
            ProcessStatus::Starting | ProcessStatus::Ready => !self.alive,
        }
    }
}

/// A cluster directory as seen by `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterReport {
    pub dir: PathBuf,
    pub kind: TopologyKind,
    pub state: LaunchState,
    pub created_at: DateTime<Utc>,
    pub processes: Vec<ProcessReport>,
}

impl ClusterReport {
    pub fn alive_count(&self) -> usize {
        self.processes.iter().filter(|p| p.alive).count()
    }

    pub fn drifted(&self) -> Vec<&ProcessReport> {
        self.processes.iter().filter(|p| p.drifted()).collect()
    }
}

/// Result of `launch` or `start`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchReport {
    pub dir: PathBuf,
    pub kind: TopologyKind,
    pub processes: Vec<ProcessReport>,
    /// Replica sets configured during this run.
    pub replica_sets: Vec<(String, ConfigureOutcome)>,
    /// Shards registered during this run.
    pub shards: Vec<String>,
    /// Nodes spawned during this run.
    pub spawned: Vec<String>,
}

/// Result of `stop` or `kill`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub signal: Signal,
    /// Nodes that received the signal.
    pub signalled: Vec<String>,
    /// Nodes still alive afterwards.
    pub still_alive: Vec<String>,
}

impl ShutdownReport {
    /// Nothing was running.
    pub fn was_noop(&self) -> bool {
        self.signalled.is_empty() && self.still_alive.is_empty()
    }
}

/// Drives cluster lifecycles.
pub struct ClusterSupervisor {
    collaborators: Collaborators,
    policies: Policies,
    state: LaunchState,
    history: Vec<LaunchState>,
}

impl ClusterSupervisor {
    pub fn new(collaborators: Collaborators, policies: Policies) -> Self {
        Self {
            collaborators,
            policies,
            state: LaunchState::Planned,
            history: vec![LaunchState::Planned],
        }
    }

    pub fn state(&self) -> &LaunchState {
        &self.state
    }

    /// Every state this supervisor has been in, oldest first.
    pub fn history(&self) -> &[LaunchState] {
        &self.history
    }

    fn launcher(&self) -> Launcher<'_> {
        Launcher::new(
            self.collaborators.spawner.as_ref(),
            self.collaborators.probe.as_ref(),
        )
    }

    fn transition(&mut self, next: LaunchState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(Error::InvalidTransition {
                from: self.state.name().to_string(),
                to: next.name().to_string(),
            });
        }
        debug!(from = %self.state, to = %next, "lifecycle transition");
        self.state = next.clone();
        self.history.push(next);
        Ok(())
    }

    /// Adopts a persisted state without a transition check.
    fn resume(&mut self, state: LaunchState) {
        if self.state != state {
            self.state = state.clone();
            self.history.push(state);
        }
    }

    /// Brings up every process of `plan` and persists the result.
    pub async fn launch(&mut self, plan: &ClusterPlan, store: &StateStore) -> Result<LaunchReport> {
        plan.verify_ports()?;
        if store.exists() {
            return Err(Error::AlreadyInitialized(store.dir().to_path_buf()));
        }
        // Nothing touches the filesystem until the ports are known to be free.
        self.check_ports_free(plan).await?;
        let _lock = store.lock()?;
        if store.exists() {
            return Err(Error::AlreadyInitialized(store.dir().to_path_buf()));
        }

        info!(
            kind = %plan.kind,
            processes = plan.process_count(),
            dir = %store.dir().display(),
            "launching cluster"
        );
        self.transition(LaunchState::Launching)?;

        let mut processes = Vec::with_capacity(plan.process_count());
        let mut report = LaunchReport {
            dir: store.dir().to_path_buf(),
            kind: plan.kind,
            processes: Vec::new(),
            replica_sets: Vec::new(),
            shards: Vec::new(),
            spawned: Vec::new(),
        };

        if let Err(e) = self.bring_up(plan, &mut processes, &mut report).await {
            let survivors = self.fail(&e, &processes).await;
            if !survivors.is_empty() {
                // Leave a record so stop and kill can still reach them.
                let persisted = PersistedState::new(plan.clone(), survivors, self.state.clone());
                if let Err(save) = store.save(&persisted) {
                    error!(error = %save, "failed to record processes that survived teardown");
                }
            }
            return Err(e);
        }

        self.transition(LaunchState::Running)?;
        let persisted = PersistedState::new(plan.clone(), processes, LaunchState::Running);
        if let Err(e) = store.save(&persisted) {
            error!(error = %e, "failed to persist startup state");
            self.teardown(&persisted.processes).await;
            return Err(e);
        }

        report.processes = self.reports(&persisted.processes);
        info!(processes = report.processes.len(), "cluster running");
        Ok(report)
    }

    /// Spawns, waits, configures and registers. Every spawned process is
    /// pushed to `processes` before anything else can fail.
    async fn bring_up(
        &mut self,
        plan: &ClusterPlan,
        processes: &mut Vec<RuntimeProcess>,
        report: &mut LaunchReport,
    ) -> Result<()> {
        let backend = plan.backend_nodes();
        self.spawn_all(&backend, processes, report).await?;

        self.transition(LaunchState::AwaitingReadiness)?;
        self.launcher()
            .await_all_ready(&backend, &self.policies.readiness)
            .await?;
        mark_ready(processes);

        self.transition(LaunchState::ConfiguringReplicaSets)?;
        let admin = Arc::clone(&self.collaborators.admin);
        report.replica_sets = ReplicaSetConfigurator::new(admin.as_ref(), self.policies.convergence)
            .configure_all(plan.replica_groups())
            .await?;

        if plan.is_sharded() {
            self.transition(LaunchState::RegisteringShards)?;
            let routers: Vec<&NodeSpec> = plan.routers.iter().collect();
            self.spawn_all(&routers, processes, report).await?;
            self.launcher()
                .await_all_ready(&routers, &self.policies.readiness)
                .await?;
            mark_ready(processes);

            let front = routers.first().map(|r| r.host_port()).ok_or_else(|| {
                Error::ShardRegistration {
                    shard: "shard01".to_string(),
                    reason: "plan has no router".to_string(),
                }
            })?;
            report.shards = ShardRegistrator::new(admin.as_ref(), self.policies.registration)
                .register_all(&front, &plan.shards)
                .await?;
        }

        Ok(())
    }

    async fn spawn_all(
        &self,
        nodes: &[&NodeSpec],
        processes: &mut Vec<RuntimeProcess>,
        report: &mut LaunchReport,
    ) -> Result<()> {
        let launcher = self.launcher();
        for node in nodes {
            let process = launcher.spawn(node).await?;
            report.spawned.push(process.node.id.clone());
            processes.push(process);
        }
        Ok(())
    }

    /// Refuses to launch onto ports something is already listening on.
    async fn check_ports_free(&self, plan: &ClusterPlan) -> Result<()> {
        for node in plan.nodes() {
            if self.collaborators.probe.is_ready(&node.host, node.port).await {
                return Err(Error::PortConflict(format!(
                    "port {} for {} is already in use",
                    node.port, node.id
                )));
            }
        }
        Ok(())
    }

    /// Moves to `Failed` and tears down `processes`. Returns the ones
    /// still alive afterwards.
    async fn fail(&mut self, cause: &Error, processes: &[RuntimeProcess]) -> Vec<RuntimeProcess> {
        error!(error = %cause, spawned = processes.len(), "launch failed, tearing down");
        if let Err(e) = self.transition(LaunchState::Failed(cause.to_string())) {
            warn!(error = %e, "could not record failure");
        }
        self.teardown(processes).await
    }

    /// Terminates `processes` in reverse spawn order, best effort. Returns
    /// the survivors in spawn order.
    async fn teardown(&self, processes: &[RuntimeProcess]) -> Vec<RuntimeProcess> {
        let launcher = self.launcher();
        let mut survivors = Vec::new();
        for process in processes.iter().rev() {
            match launcher
                .terminate(process, Signal::Terminate, &self.policies.shutdown)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(node = %process.id(), pid = process.pid, "survived teardown");
                    survivors.push(process.clone());
                }
                Err(e) => {
                    warn!(node = %process.id(), error = %e, "teardown failed");
                    survivors.push(process.clone());
                }
            }
        }
        survivors.reverse();
        survivors
    }

    /// Re-spawns every recorded process that is not running and waits for
    /// the whole cluster to be ready.
    pub async fn start(&mut self, store: &StateStore) -> Result<LaunchReport> {
        let _lock = store.lock()?;
        let mut persisted = store.load()?;
        self.resume(persisted.state.clone());
        self.transition(LaunchState::Launching)?;

        let mut report = LaunchReport {
            dir: store.dir().to_path_buf(),
            kind: persisted.plan.kind,
            processes: Vec::new(),
            replica_sets: Vec::new(),
            shards: Vec::new(),
            spawned: Vec::new(),
        };

        let mut respawned = Vec::new();
        if let Err(e) = self
            .restart_dead(&mut persisted, &mut respawned, &mut report)
            .await
        {
            let survivors = self.fail(&e, &respawned).await;
            if !survivors.is_empty() {
                // The record already holds the fresh pids of respawned nodes.
                if let Err(save) = store.save(&persisted) {
                    error!(error = %save, "failed to record processes that survived teardown");
                }
            }
            return Err(e);
        }

        self.transition(LaunchState::Running)?;
        persisted.state = LaunchState::Running;
        persisted.refresh_startup_info();
        persisted.touch();
        store.save(&persisted)?;

        report.processes = self.reports(&persisted.processes);
        info!(restarted = report.spawned.len(), "cluster running");
        Ok(report)
    }

    async fn restart_dead(
        &mut self,
        persisted: &mut PersistedState,
        respawned: &mut Vec<RuntimeProcess>,
        report: &mut LaunchReport,
    ) -> Result<()> {
        let launcher = self.launcher();
        for process in &mut persisted.processes {
            if launcher.is_alive(process) {
                debug!(node = %process.id(), pid = process.pid, "already running");
                continue;
            }
            let fresh = launcher.spawn(&process.node).await?;
            report.spawned.push(fresh.node.id.clone());
            respawned.push(fresh.clone());
            *process = fresh;
        }

        self.transition(LaunchState::AwaitingReadiness)?;
        let nodes: Vec<&NodeSpec> = persisted.processes.iter().map(|p| &p.node).collect();
        self.launcher()
            .await_all_ready(&nodes, &self.policies.readiness)
            .await?;
        mark_ready(&mut persisted.processes);
        Ok(())
    }

    /// Stops the cluster gracefully. Running it again does nothing.
    pub async fn stop(&mut self, store: &StateStore) -> Result<ShutdownReport> {
        self.shut_down(store, Signal::Terminate).await
    }

    /// Sends `signal` to every running process of the cluster.
    pub async fn kill(&mut self, store: &StateStore, signal: Signal) -> Result<ShutdownReport> {
        self.shut_down(store, signal).await
    }

    async fn shut_down(&mut self, store: &StateStore, signal: Signal) -> Result<ShutdownReport> {
        let _lock = store.lock()?;
        let mut persisted = store.load()?;
        self.resume(persisted.state.clone());

        let spawner = Arc::clone(&self.collaborators.spawner);
        let probe = Arc::clone(&self.collaborators.probe);
        let launcher = Launcher::new(spawner.as_ref(), probe.as_ref());
        let mut report = ShutdownReport {
            signal,
            signalled: Vec::new(),
            still_alive: Vec::new(),
        };

        let failed_launch = matches!(persisted.state, LaunchState::Failed(_));

        if persisted.processes.iter().all(|p| !launcher.is_alive(p)) {
            info!(dir = %store.dir().display(), "nothing running");
            if failed_launch {
                // A failed launch has nothing to restart.
                store.remove()?;
            } else if persisted.state == LaunchState::Running {
                self.transition(LaunchState::Stopping)?;
                self.transition(LaunchState::Stopped)?;
                mark_stopped(&mut persisted.processes);
                persisted.state = LaunchState::Stopped;
                persisted.touch();
                store.save(&persisted)?;
            }
            return Ok(report);
        }

        if self.state != LaunchState::Running && !failed_launch {
            // Recorded as stopped but something came back; treat it as running.
            self.resume(LaunchState::Running);
        }
        self.transition(LaunchState::Stopping)?;
        info!(dir = %store.dir().display(), %signal, "stopping cluster");

        for process in persisted.processes.iter_mut().rev() {
            if !launcher.is_alive(process) {
                process.status = ProcessStatus::Stopped;
                continue;
            }
            report.signalled.push(process.id().to_string());

            let gone = if signal == Signal::Terminate {
                launcher
                    .terminate(process, signal, &self.policies.shutdown)
                    .await?
            } else {
                launcher.signal(process, signal)?;
                signal.ends_process()
                    && launcher
                        .wait_for_exit(process.pid, &self.policies.shutdown)
                        .await
            };

            if gone {
                process.status = ProcessStatus::Stopped;
            } else {
                report.still_alive.push(process.id().to_string());
            }
        }

        if !report.still_alive.is_empty() {
            warn!(alive = ?report.still_alive, "processes still alive after {signal}");
            // A failed launch keeps its failure on record.
            if !failed_launch {
                persisted.state = LaunchState::Running;
            }
            self.resume(persisted.state.clone());
        } else if failed_launch {
            self.transition(LaunchState::Stopped)?;
            store.remove()?;
            return Ok(report);
        } else {
            self.transition(LaunchState::Stopped)?;
            persisted.state = LaunchState::Stopped;
        }
        persisted.touch();
        store.save(&persisted)?;
        Ok(report)
    }

    /// Recorded processes with their current liveness.
    pub fn list(&self, store: &StateStore) -> Result<ClusterReport> {
        let persisted = store.load()?;
        Ok(ClusterReport {
            dir: store.dir().to_path_buf(),
            kind: persisted.plan.kind,
            state: persisted.state.clone(),
            created_at: persisted.created_at,
            processes: self.reports(&persisted.processes),
        })
    }

    /// Reports for every cluster below `root`. Directories whose state
    /// cannot be read are returned with their error.
    pub fn list_all(&self, root: &Path) -> Result<Vec<(PathBuf, Result<ClusterReport>)>> {
        Ok(StateStore::discover(root)?
            .into_iter()
            .map(|dir| {
                let report = self.list(&StateStore::new(&dir));
                (dir, report)
            })
            .collect())
    }

    fn reports(&self, processes: &[RuntimeProcess]) -> Vec<ProcessReport> {
        let launcher = self.launcher();
        processes
            .iter()
            .map(|p| ProcessReport::new(p, launcher.is_alive(p)))
            .collect()
    }
}

fn mark_ready(processes: &mut [RuntimeProcess]) {
    for process in processes {
        if process.status == ProcessStatus::Starting {
            process.status = ProcessStatus::Ready;
        }
    }
}

fn mark_stopped(processes: &mut [RuntimeProcess]) {
    for process in processes {
        process.status = ProcessStatus::Stopped;
    }
}
