//! Lifecycle tests against simulated processes.
//!
//! `SimWorld` stands in for the operating system and the database servers:
//! spawned commands become entries in a pid table, a port is "listening"
//! while its process is alive, and replica set configs and shard
//! registrations live in memory. Faults are injected per port or shard.

use async_trait::async_trait;
use mlaunch_cluster::{
    AdminClient, ClientError, ClusterSupervisor, CommandLine, Collaborators, ConfigureOutcome,
    Error, HostPort, LaunchState, NodeRole, Policies, ProcessSpawner, ProcessStatus,
    ReadinessProbe, ReplSetConfig, Signal, StateStore, TopologyRequest, plan_cluster,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct SimState {
    next_pid: u32,
    /// pid -> port of every live process.
    alive: BTreeMap<u32, u16>,
    /// Ports in spawn order.
    spawn_log: Vec<u16>,
    signals: Vec<(u32, Signal)>,
    replsets: HashMap<String, ReplSetConfig>,
    initiated: Vec<String>,
    shards: Vec<(String, String)>,
    /// Ports already taken by something outside the cluster.
    foreign_ports: HashSet<u16>,
    never_ready: HashSet<u16>,
    fail_spawn: HashSet<u16>,
    /// Ports whose processes ignore every signal.
    unkillable: HashSet<u16>,
    reject_shard: Option<String>,
}

#[derive(Default)]
struct SimWorld {
    state: Mutex<SimState>,
}

impl SimWorld {
    fn with<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    fn alive_count(&self) -> usize {
        self.with(|s| s.alive.len())
    }

    fn crash_port(&self, port: u16) {
        self.with(|s| s.alive.retain(|_, p| *p != port));
    }
}

struct SimSpawner(Arc<SimWorld>);
struct SimProbe(Arc<SimWorld>);
struct SimAdmin(Arc<SimWorld>);

#[async_trait]
impl ProcessSpawner for SimSpawner {
    async fn spawn(&self, command: &CommandLine, working_dir: &Path) -> io::Result<u32> {
        assert!(working_dir.is_dir(), "working dir {} missing", working_dir.display());
        let port: u16 = command
            .value_of("--port")
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| io::Error::other("no --port"))?;
        self.0.with(|s| {
            if s.fail_spawn.contains(&port) {
                return Err(io::Error::other(format!("child process failed, port {port}")));
            }
            s.next_pid += 1;
            let pid = 1000 + s.next_pid;
            s.alive.insert(pid, port);
            s.spawn_log.push(port);
            Ok(pid)
        })
    }

    fn terminate(&self, pid: u32, signal: Signal) -> io::Result<()> {
        self.0.with(|s| {
            s.signals.push((pid, signal));
            let stuck = s.alive.get(&pid).is_some_and(|port| s.unkillable.contains(port));
            if signal.ends_process() && !stuck {
                s.alive.remove(&pid);
            }
        });
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.0.with(|s| s.alive.contains_key(&pid))
    }
}

#[async_trait]
impl ReadinessProbe for SimProbe {
    async fn is_ready(&self, _host: &str, port: u16) -> bool {
        self.0.with(|s| {
            s.foreign_ports.contains(&port)
                || (!s.never_ready.contains(&port) && s.alive.values().any(|p| *p == port))
        })
    }
}

#[async_trait]
impl AdminClient for SimAdmin {
    async fn replset_get_config(
        &self,
        seed: &HostPort,
    ) -> Result<Option<ReplSetConfig>, ClientError> {
        Ok(self.0.with(|s| s.replsets.get(&seed.to_string()).cloned()))
    }

    async fn replset_initiate(
        &self,
        seed: &HostPort,
        config: &ReplSetConfig,
    ) -> Result<(), ClientError> {
        self.0.with(|s| {
            s.initiated.push(config.name.clone());
            s.replsets.insert(seed.to_string(), config.clone());
        });
        Ok(())
    }

    async fn add_shard(
        &self,
        router: &HostPort,
        connection: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        self.0.with(|s| {
            if s.reject_shard.as_deref() == Some(name) {
                return Err(ClientError::Command {
                    command: "addShard".to_string(),
                    target: router.to_string(),
                    message: "E11000 duplicate key".to_string(),
                });
            }
            s.shards.push((name.to_string(), connection.to_string()));
            Ok(())
        })
    }
}

fn collaborators(world: &Arc<SimWorld>) -> Collaborators {
    Collaborators {
        spawner: Arc::new(SimSpawner(Arc::clone(world))),
        probe: Arc::new(SimProbe(Arc::clone(world))),
        admin: Arc::new(SimAdmin(Arc::clone(world))),
    }
}

fn supervisor(world: &Arc<SimWorld>) -> ClusterSupervisor {
    ClusterSupervisor::new(collaborators(world), Policies::immediate(3))
}

fn request(dir: &Path, request: TopologyRequest) -> TopologyRequest {
    TopologyRequest {
        data_dir: Some(dir.to_path_buf()),
        ..request
    }
}

#[tokio::test]
async fn single_node_launch() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            single: true,
            ..Default::default()
        },
    ))
    .unwrap();
    let store = StateStore::new(temp.path());

    let mut supervisor = supervisor(&world);
    let report = supervisor.launch(&plan, &store).await.unwrap();

    assert_eq!(report.processes.len(), 1);
    assert_eq!(report.processes[0].role, NodeRole::Standalone);
    assert!(!report.processes[0].command_line.contains("--replSet"));
    assert!(report.replica_sets.is_empty());
    assert!(store.exists());
    assert_eq!(supervisor.state(), &LaunchState::Running);
    assert_eq!(
        supervisor.history(),
        &[
            LaunchState::Planned,
            LaunchState::Launching,
            LaunchState::AwaitingReadiness,
            LaunchState::ConfiguringReplicaSets,
            LaunchState::Running,
        ]
    );
}

#[tokio::test]
async fn replica_set_launch_converges() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            replicaset: true,
            ..Default::default()
        },
    ))
    .unwrap();

    let report = supervisor(&world)
        .launch(&plan, &StateStore::new(temp.path()))
        .await
        .unwrap();

    assert_eq!(report.processes.len(), 3);
    assert_eq!(
        report.replica_sets,
        vec![("replset".to_string(), ConfigureOutcome::Initiated)]
    );
    let config = world.with(|s| s.replsets["localhost:27017"].clone());
    assert_eq!(config.member_count(), 3);
    assert_eq!(config.arbiter_count(), 0);
}

#[tokio::test]
async fn replica_set_with_arbiter() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            replicaset: true,
            nodes: Some(2),
            arbiter: true,
            ..Default::default()
        },
    ))
    .unwrap();

    supervisor(&world)
        .launch(&plan, &StateStore::new(temp.path()))
        .await
        .unwrap();

    let config = world.with(|s| s.replsets["localhost:27017"].clone());
    assert_eq!(config.member_count(), 3);
    assert_eq!(config.arbiter_count(), 1);
    assert!(config.members[2].arbiter_only);
}

#[tokio::test]
async fn sharded_single_spawn_order_and_flags() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            single: true,
            sharded: Some(2),
            storage_engine: Some("mmapv1".to_string()),
            ..Default::default()
        },
    ))
    .unwrap();

    let report = supervisor(&world)
        .launch(&plan, &StateStore::new(temp.path()))
        .await
        .unwrap();

    assert_eq!(report.processes.len(), 4);
    // Config server, shards, then the router that owns the base port.
    assert_eq!(world.with(|s| s.spawn_log.clone()), vec![27020, 27018, 27019, 27017]);

    for process in &report.processes {
        let has_engine = process.command_line.contains("--storageEngine mmapv1");
        match process.role {
            NodeRole::ShardMember => assert!(has_engine, "{}", process.id),
            _ => assert!(!has_engine, "{}", process.id),
        }
    }
    assert_eq!(
        world.with(|s| s.shards.clone()),
        vec![
            ("shard01".to_string(), "localhost:27018".to_string()),
            ("shard02".to_string(), "localhost:27019".to_string()),
        ]
    );
}

#[tokio::test]
async fn sharded_replica_sets_with_csrs() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            replicaset: true,
            sharded: Some(2),
            config_servers: Some(3),
            csrs: true,
            ..Default::default()
        },
    ))
    .unwrap();

    let mut supervisor = supervisor(&world);
    let report = supervisor
        .launch(&plan, &StateStore::new(temp.path()))
        .await
        .unwrap();

    assert_eq!(report.processes.len(), 10);
    let mut sets: Vec<&str> = report
        .processes
        .iter()
        .filter(|p| p.role == NodeRole::ShardMember)
        .filter_map(|p| p.replica_set.as_deref())
        .collect();
    sets.dedup();
    assert_eq!(sets, vec!["shard01", "shard02"]);

    assert_eq!(report.shards, vec!["shard01", "shard02"]);
    assert_eq!(
        world.with(|s| s.shards.clone()),
        vec![
            (
                "shard01".to_string(),
                "shard01/localhost:27018,localhost:27019,localhost:27020".to_string()
            ),
            (
                "shard02".to_string(),
                "shard02/localhost:27021,localhost:27022,localhost:27023".to_string()
            ),
        ]
    );
    assert!(world.with(|s| s.replsets["localhost:27024"].configsvr));
    assert!(supervisor.history().contains(&LaunchState::RegisteringShards));
}

#[tokio::test]
async fn sharded_replica_sets_with_arbiters() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            replicaset: true,
            sharded: Some(2),
            nodes: Some(2),
            arbiter: true,
            ..Default::default()
        },
    ))
    .unwrap();

    let report = supervisor(&world)
        .launch(&plan, &StateStore::new(temp.path()))
        .await
        .unwrap();

    assert_eq!(report.processes.len(), 8);
    let arbiters: Vec<_> = report
        .processes
        .iter()
        .filter(|p| p.role == NodeRole::Arbiter)
        .collect();
    assert_eq!(arbiters.len(), 2);
    for arbiter in arbiters {
        assert!(arbiter.command_line.contains("--shardsvr"), "{}", arbiter.command_line);
        assert!(arbiter.replica_set.as_deref().is_some_and(|set| set.starts_with("shard")));
    }

    let shard01 = world.with(|s| s.replsets["localhost:27018"].clone());
    assert_eq!(shard01.member_count(), 3);
    assert_eq!(shard01.arbiter_count(), 1);
    assert_eq!(
        world.with(|s| s.shards.clone()),
        vec![
            (
                "shard01".to_string(),
                "shard01/localhost:27018,localhost:27019".to_string()
            ),
            (
                "shard02".to_string(),
                "shard02/localhost:27021,localhost:27022".to_string()
            ),
        ]
    );
}

#[tokio::test]
async fn readiness_failure_tears_everything_down() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    world.with(|s| {
        s.never_ready.insert(27019);
    });
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            replicaset: true,
            sharded: Some(2),
            ..Default::default()
        },
    ))
    .unwrap();
    let store = StateStore::new(temp.path());

    let mut supervisor = supervisor(&world);
    let err = supervisor.launch(&plan, &store).await.unwrap_err();

    assert!(matches!(err, Error::ReadinessTimeout { port: 27019, .. }));
    assert_eq!(world.alive_count(), 0);
    assert!(!store.exists());
    assert!(matches!(supervisor.state(), LaunchState::Failed(_)));

    // Teardown runs in reverse spawn order.
    let spawned: Vec<u16> = world.with(|s| s.spawn_log.clone());
    let pids_by_signal: Vec<u32> = world.with(|s| s.signals.iter().map(|(pid, _)| *pid).collect());
    assert_eq!(pids_by_signal.len(), spawned.len());
    assert!(pids_by_signal.windows(2).all(|w| w[0] > w[1]));
}

#[tokio::test]
async fn spawn_failure_tears_down_earlier_nodes() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    world.with(|s| {
        s.fail_spawn.insert(27019);
    });
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            replicaset: true,
            ..Default::default()
        },
    ))
    .unwrap();
    let store = StateStore::new(temp.path());

    let err = supervisor(&world).launch(&plan, &store).await.unwrap_err();

    assert!(matches!(err, Error::ProcessSpawn { ref node, .. } if node == "replset-rs3"));
    assert_eq!(world.with(|s| s.signals.len()), 2);
    assert_eq!(world.alive_count(), 0);
    assert!(!store.exists());
}

#[tokio::test]
async fn shard_rejection_tears_down_routers_too() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    world.with(|s| s.reject_shard = Some("shard02".to_string()));
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            single: true,
            sharded: Some(3),
            ..Default::default()
        },
    ))
    .unwrap();
    let store = StateStore::new(temp.path());

    let err = supervisor(&world).launch(&plan, &store).await.unwrap_err();

    assert!(matches!(err, Error::ShardRegistration { ref shard, .. } if shard == "shard02"));
    assert_eq!(world.with(|s| s.shards.len()), 1);
    assert_eq!(world.alive_count(), 0);
    assert!(!store.exists());
}

#[tokio::test]
async fn busy_port_is_rejected_before_spawning() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    world.with(|s| {
        s.foreign_ports.insert(27018);
    });
    let dir = temp.path().join("cluster");
    let plan = plan_cluster(&request(
        &dir,
        TopologyRequest {
            replicaset: true,
            ..Default::default()
        },
    ))
    .unwrap();

    let err = supervisor(&world)
        .launch(&plan, &StateStore::new(&dir))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PortConflict(_)));
    assert!(world.with(|s| s.spawn_log.is_empty()));
    assert!(!dir.exists());
}

#[tokio::test]
async fn teardown_survivors_stay_on_record() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    world.with(|s| {
        s.never_ready.insert(27019);
        s.unkillable.insert(27017);
    });
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            replicaset: true,
            ..Default::default()
        },
    ))
    .unwrap();
    let store = StateStore::new(temp.path());

    let err = supervisor(&world).launch(&plan, &store).await.unwrap_err();
    assert!(matches!(err, Error::ReadinessTimeout { port: 27019, .. }));
    assert_eq!(world.alive_count(), 1);

    let persisted = store.load().unwrap();
    assert!(matches!(persisted.state, LaunchState::Failed(_)));
    let recorded: Vec<u16> = persisted.processes.iter().map(|p| p.node.port).collect();
    assert_eq!(recorded, vec![27017]);

    let listed = supervisor(&world).list(&store).unwrap();
    assert_eq!(listed.alive_count(), 1);

    // Once the process can be signalled again, stop clears the failed record.
    world.with(|s| s.unkillable.clear());
    let report = supervisor(&world).stop(&store).await.unwrap();
    assert_eq!(report.signalled, vec![persisted.processes[0].node.id.clone()]);
    assert!(report.still_alive.is_empty());
    assert_eq!(world.alive_count(), 0);
    assert!(!store.exists());
}

#[tokio::test]
async fn stop_keeps_failed_record_while_survivors_remain() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    world.with(|s| {
        s.fail_spawn.insert(27018);
        s.unkillable.insert(27017);
    });
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            replicaset: true,
            ..Default::default()
        },
    ))
    .unwrap();
    let store = StateStore::new(temp.path());

    supervisor(&world).launch(&plan, &store).await.unwrap_err();
    let survivor = store.load().unwrap().processes[0].node.id.clone();
    let report = supervisor(&world).stop(&store).await.unwrap();

    assert_eq!(report.still_alive, vec![survivor]);
    assert!(matches!(store.load().unwrap().state, LaunchState::Failed(_)));
    assert_eq!(world.alive_count(), 1);
}

#[tokio::test]
async fn launch_refuses_initialized_directory() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            single: true,
            ..Default::default()
        },
    ))
    .unwrap();
    let store = StateStore::new(temp.path());

    supervisor(&world).launch(&plan, &store).await.unwrap();
    let err = supervisor(&world).launch(&plan, &store).await.unwrap_err();

    assert!(matches!(err, Error::AlreadyInitialized(_)));
    assert_eq!(world.alive_count(), 1);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            replicaset: true,
            ..Default::default()
        },
    ))
    .unwrap();
    let store = StateStore::new(temp.path());
    supervisor(&world).launch(&plan, &store).await.unwrap();

    let first = supervisor(&world).stop(&store).await.unwrap();
    assert_eq!(first.signalled, vec!["replset-rs3", "replset-rs2", "replset-rs1"]);
    assert!(first.still_alive.is_empty());
    assert_eq!(world.alive_count(), 0);

    let persisted = store.load().unwrap();
    assert_eq!(persisted.state, LaunchState::Stopped);
    assert!(persisted.all_stopped());

    let signals_before = world.with(|s| s.signals.len());
    let second = supervisor(&world).stop(&store).await.unwrap();
    assert!(second.was_noop());
    assert_eq!(world.with(|s| s.signals.len()), signals_before);
    assert_eq!(store.load().unwrap().state, LaunchState::Stopped);
}

#[tokio::test]
async fn start_relaunches_stopped_processes() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            replicaset: true,
            ..Default::default()
        },
    ))
    .unwrap();
    let store = StateStore::new(temp.path());
    supervisor(&world).launch(&plan, &store).await.unwrap();
    supervisor(&world).stop(&store).await.unwrap();

    let report = supervisor(&world).start(&store).await.unwrap();

    assert_eq!(report.spawned.len(), 3);
    assert_eq!(world.alive_count(), 3);
    let persisted = store.load().unwrap();
    assert_eq!(persisted.state, LaunchState::Running);
    assert!(
        persisted
            .processes
            .iter()
            .all(|p| p.status == ProcessStatus::Ready)
    );
    // The replica set keeps its config across restarts.
    assert_eq!(world.with(|s| s.initiated.clone()), vec!["replset".to_string()]);

    let again = supervisor(&world).start(&store).await.unwrap();
    assert!(again.spawned.is_empty());
}

#[tokio::test]
async fn start_respawns_only_crashed_nodes() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            replicaset: true,
            ..Default::default()
        },
    ))
    .unwrap();
    let store = StateStore::new(temp.path());
    supervisor(&world).launch(&plan, &store).await.unwrap();
    world.crash_port(27018);

    let report = supervisor(&world).start(&store).await.unwrap();

    assert_eq!(report.spawned, vec!["replset-rs2"]);
    assert_eq!(world.alive_count(), 3);
}

#[tokio::test]
async fn kill_sends_the_requested_signal() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            single: true,
            sharded: Some(1),
            ..Default::default()
        },
    ))
    .unwrap();
    let store = StateStore::new(temp.path());
    supervisor(&world).launch(&plan, &store).await.unwrap();

    let report = supervisor(&world).kill(&store, Signal::Kill).await.unwrap();

    assert_eq!(report.signalled.len(), 3);
    assert!(world.with(|s| s.signals.iter().all(|(_, sig)| *sig == Signal::Kill)));
    assert_eq!(world.alive_count(), 0);
    assert_eq!(store.load().unwrap().state, LaunchState::Stopped);
}

#[tokio::test]
async fn hangup_leaves_cluster_running() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            single: true,
            ..Default::default()
        },
    ))
    .unwrap();
    let store = StateStore::new(temp.path());
    supervisor(&world).launch(&plan, &store).await.unwrap();

    let report = supervisor(&world)
        .kill(&store, Signal::Hangup)
        .await
        .unwrap();

    assert_eq!(report.still_alive, vec!["standalone"]);
    assert_eq!(store.load().unwrap().state, LaunchState::Running);
}

#[tokio::test]
async fn list_reports_drift() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    let plan = plan_cluster(&request(
        temp.path(),
        TopologyRequest {
            replicaset: true,
            nodes: Some(2),
            arbiter: true,
            ..Default::default()
        },
    ))
    .unwrap();
    let store = StateStore::new(temp.path());
    supervisor(&world).launch(&plan, &store).await.unwrap();
    world.crash_port(27019);

    let report = supervisor(&world).list(&store).unwrap();

    assert_eq!(report.alive_count(), 2);
    let drifted = report.drifted();
    assert_eq!(drifted.len(), 1);
    assert_eq!(drifted[0].role, NodeRole::Arbiter);
}

#[tokio::test]
async fn list_all_discovers_clusters() {
    let temp = TempDir::new().unwrap();
    let world = Arc::new(SimWorld::default());
    for (name, port) in [("one", 30000), ("two", 31000)] {
        let dir = temp.path().join(name);
        let plan = plan_cluster(&request(
            &dir,
            TopologyRequest {
                single: true,
                base_port: Some(port),
                ..Default::default()
            },
        ))
        .unwrap();
        supervisor(&world)
            .launch(&plan, &StateStore::new(&dir))
            .await
            .unwrap();
    }

    let found = supervisor(&world).list_all(temp.path()).unwrap();

    assert_eq!(found.len(), 2);
    assert_eq!(found[0].0, temp.path().join("one"));
    let report = found[1].1.as_ref().unwrap();
    assert_eq!(report.processes[0].port, 31000);
}
