//! Local database cluster planning and lifecycle management.
//!
//! Turns a topology request into a concrete process plan and runs it:
//! - Topology normalization and deterministic port assignment
//! - Process plans with fully resolved command lines
//! - Spawning, readiness, replica set configuration and shard registration
//! - Persisted startup state for later start, stop, kill and list

pub mod client;
pub mod error;
pub mod node;
pub mod plan;
pub mod ports;
pub mod replset;
pub mod retry;
pub mod shards;
pub mod state;
pub mod supervisor;
pub mod topology;

pub use client::{AdminClient, HostPort, ReplSetConfig, ReplSetMember, ShellAdminClient};
pub use error::{ClientError, Error, Result};
pub use node::{
    ForkingSpawner, Launcher, ProcessSpawner, ProcessStatus, ReadinessProbe, RuntimeProcess,
    Signal, TcpProbe,
};
pub use plan::{
    ClusterPlan, CommandLine, ConfigGroupSpec, FileProbe, LocalFiles, NodeRole, NodeSpec,
    ShardSpec, TopologyKind, build_plan,
};
pub use replset::{ConfigureOutcome, ReplicaSetConfigurator};
pub use retry::RetryPolicy;
pub use shards::ShardRegistrator;
pub use state::{PersistedState, STATE_FILE, StateStore};
pub use supervisor::{
    ClusterReport, ClusterSupervisor, Collaborators, LaunchReport, LaunchState, Policies,
    ProcessReport, ShutdownReport,
};
pub use topology::{SslBundle, TopologyRequest, TopologySpec};

use std::path::Path;

/// Normalizes a request and builds its plan against the local filesystem.
pub fn plan_cluster(request: &TopologyRequest) -> Result<ClusterPlan> {
    let spec = request.normalize()?;
    build_plan(&spec, &LocalFiles)
}

/// Plans and launches a new cluster in the request's data directory.
pub async fn init_cluster(
    request: &TopologyRequest,
    collaborators: Collaborators,
    policies: Policies,
) -> Result<LaunchReport> {
    let plan = plan_cluster(request)?;
    let store = StateStore::new(&plan.data_dir);
    if store.exists() {
        return Err(Error::AlreadyInitialized(plan.data_dir.clone()));
    }
    ClusterSupervisor::new(collaborators, policies)
        .launch(&plan, &store)
        .await
}

/// Restarts every stopped process of an existing cluster.
pub async fn start_cluster(
    dir: &Path,
    collaborators: Collaborators,
    policies: Policies,
) -> Result<LaunchReport> {
    ClusterSupervisor::new(collaborators, policies)
        .start(&StateStore::new(dir))
        .await
}

/// Stops a running cluster gracefully.
pub async fn stop_cluster(
    dir: &Path,
    collaborators: Collaborators,
    policies: Policies,
) -> Result<ShutdownReport> {
    ClusterSupervisor::new(collaborators, policies)
        .stop(&StateStore::new(dir))
        .await
}

/// Sends `signal` to every process of a cluster.
pub async fn kill_cluster(
    dir: &Path,
    signal: Signal,
    collaborators: Collaborators,
    policies: Policies,
) -> Result<ShutdownReport> {
    ClusterSupervisor::new(collaborators, policies)
        .kill(&StateStore::new(dir), signal)
        .await
}

/// Reports the recorded processes of one cluster and whether each is alive.
pub fn list_cluster(dir: &Path, collaborators: Collaborators) -> Result<ClusterReport> {
    ClusterSupervisor::new(collaborators, Policies::default()).list(&StateStore::new(dir))
}

/// Reports every cluster found below `root`.
pub fn list_clusters(
    root: &Path,
    collaborators: Collaborators,
) -> Result<Vec<(std::path::PathBuf, Result<ClusterReport>)>> {
    ClusterSupervisor::new(collaborators, Policies::default()).list_all(root)
}
