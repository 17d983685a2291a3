//! Concrete process plans.
//!
//! [`build_plan`] turns a [`TopologySpec`] into a [`ClusterPlan`]: one
//! [`NodeSpec`] per process, each carrying its fully resolved command line.
//! The plan is immutable once built and is persisted verbatim in the
//! startup state so later invocations never re-derive it.

use crate::client::HostPort;
use crate::ports::{self, PortAssignment};
use crate::topology::{
    CONFIG_REPLSET_NAME, ConfigKind, DEFAULT_CACHE_SIZE_GB, GroupShape, Layout, NodeOptions,
    SslBundle, TopologySpec,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Role a process plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    Standalone,
    ReplicaMember,
    Arbiter,
    ConfigServerMember,
    ShardMember,
    Router,
}

impl NodeRole {
    /// Whether the role runs the router binary instead of the data server.
    pub fn is_router(self) -> bool {
        matches!(self, NodeRole::Router)
    }

    /// Whether the role stores user data.
    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            NodeRole::Standalone | NodeRole::ReplicaMember | NodeRole::ShardMember
        )
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::Standalone => "standalone",
            NodeRole::ReplicaMember => "replica member",
            NodeRole::Arbiter => "arbiter",
            NodeRole::ConfigServerMember => "config server",
            NodeRole::ShardMember => "shard member",
            NodeRole::Router => "router",
        };
        f.write_str(name)
    }
}

/// Role-dependent options for one process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFlags {
    pub storage_engine: Option<String>,
    pub cache_size_gb: Option<f64>,
    pub oplog_size_mb: Option<u32>,
    pub ssl: Option<SslBundle>,
}

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Whether `flag` appears among the arguments.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|arg| arg == flag)
    }

    /// The argument following `flag`, if any.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|arg| arg == flag)
            .and_then(|idx| self.args.get(idx + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// One planned process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Stable identifier, unique within the plan.
    pub id: String,
    pub role: NodeRole,
    pub host: String,
    pub port: u16,
    /// Database path; routers hold no data.
    pub data_dir: Option<PathBuf>,
    pub log_path: PathBuf,
    pub replica_set: Option<String>,
    /// Zero-based shard index for shard members.
    pub shard_index: Option<u32>,
    pub flags: NodeFlags,
    pub command: CommandLine,
}

impl NodeSpec {
    pub fn host_port(&self) -> HostPort {
        HostPort::new(&self.host, self.port)
    }

    /// Directory the process is started from.
    pub fn working_dir(&self) -> &Path {
        self.data_dir
            .as_deref()
            .or_else(|| self.log_path.parent())
            .unwrap_or_else(|| Path::new("."))
    }
}

/// One shard of a sharded cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSpec {
    /// `shard01`, `shard02`, ...
    pub name: String,
    pub index: u32,
    /// Replica set name for replica-set shards.
    pub replica_set: Option<String>,
    pub members: Vec<NodeSpec>,
}

impl ShardSpec {
    /// Seed string handed to `addShard`.
    pub fn connection_string(&self) -> String {
        match &self.replica_set {
            Some(set) => format!("{set}/{}", join_hosts(self.members.iter())),
            None => join_hosts(self.members.iter().take(1)),
        }
    }
}

/// The config server group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigGroupSpec {
    pub kind: ConfigKind,
    pub members: Vec<NodeSpec>,
}

impl ConfigGroupSpec {
    /// Value of the router's `--configdb` flag.
    pub fn connection_string(&self) -> String {
        let hosts = join_hosts(self.members.iter());
        match self.kind {
            ConfigKind::Csrs => format!("{CONFIG_REPLSET_NAME}/{hosts}"),
            ConfigKind::Legacy => hosts,
        }
    }
}

/// Joins data-bearing members as `host:port,host:port`.
fn join_hosts<'a>(members: impl Iterator<Item = &'a NodeSpec>) -> String {
    members
        .filter(|node| node.role != NodeRole::Arbiter)
        .map(|node| node.host_port().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// A replica-set-backed group the configurator brings up.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaGroup<'a> {
    pub name: &'a str,
    pub members: &'a [NodeSpec],
    pub configsvr: bool,
}

impl ReplicaGroup<'_> {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn arbiter_count(&self) -> usize {
        self.members
            .iter()
            .filter(|node| node.role == NodeRole::Arbiter)
            .count()
    }
}

/// Kind of cluster a plan describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyKind {
    Single,
    ReplicaSet,
    Sharded,
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TopologyKind::Single => "single",
            TopologyKind::ReplicaSet => "replica set",
            TopologyKind::Sharded => "sharded",
        })
    }
}

/// Every process of a cluster, with resolved command lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPlan {
    pub kind: TopologyKind,
    pub data_dir: PathBuf,
    /// SSL material, kept for the launcher's admin connections.
    pub ssl: Option<SslBundle>,
    /// Non-sharded standalone or replica set members.
    pub main: Vec<NodeSpec>,
    pub main_set: Option<String>,
    pub config: Option<ConfigGroupSpec>,
    pub shards: Vec<ShardSpec>,
    pub routers: Vec<NodeSpec>,
}

impl ClusterPlan {
    pub fn is_sharded(&self) -> bool {
        self.kind == TopologyKind::Sharded
    }

    /// Data-bearing and config processes in spawn order: main members,
    /// config servers, then shards.
    pub fn backend_nodes(&self) -> Vec<&NodeSpec> {
        let mut nodes: Vec<&NodeSpec> = self.main.iter().collect();
        if let Some(config) = &self.config {
            nodes.extend(config.members.iter());
        }
        nodes.extend(self.shards.iter().flat_map(|shard| shard.members.iter()));
        nodes
    }

    /// Every process in spawn order; routers come last.
    pub fn nodes(&self) -> Vec<&NodeSpec> {
        let mut nodes = self.backend_nodes();
        nodes.extend(self.routers.iter());
        nodes
    }

    pub fn process_count(&self) -> usize {
        self.nodes().len()
    }

    /// Every port of the plan, in spawn order.
    pub fn ports(&self) -> Vec<u16> {
        self.nodes().iter().map(|node| node.port).collect()
    }

    /// Replica-set-backed groups: the main set, the CSRS group, and every
    /// replica-set shard.
    pub fn replica_groups(&self) -> Vec<ReplicaGroup<'_>> {
        let mut groups = Vec::new();
        if let Some(name) = &self.main_set {
            groups.push(ReplicaGroup {
                name,
                members: &self.main,
                configsvr: false,
            });
        }
        if let Some(config) = &self.config {
            if config.kind == ConfigKind::Csrs {
                groups.push(ReplicaGroup {
                    name: CONFIG_REPLSET_NAME,
                    members: &config.members,
                    configsvr: true,
                });
            }
        }
        for shard in &self.shards {
            if let Some(name) = &shard.replica_set {
                groups.push(ReplicaGroup {
                    name,
                    members: &shard.members,
                    configsvr: false,
                });
            }
        }
        groups
    }

    /// Checks that no two processes share a port.
    pub fn verify_ports(&self) -> Result<()> {
        let mut seen: HashMap<u16, &str> = HashMap::new();
        for node in self.nodes() {
            if let Some(other) = seen.insert(node.port, &node.id) {
                return Err(Error::PortConflict(format!(
                    "{} and {} both use port {}",
                    other, node.id, node.port
                )));
            }
        }
        Ok(())
    }
}

/// Filesystem existence checks used while planning.
pub trait FileProbe {
    fn exists(&self, path: &Path) -> bool;
}

/// [`FileProbe`] backed by the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFiles;

impl FileProbe for LocalFiles {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Builds the process plan for a normalized topology.
pub fn build_plan(spec: &TopologySpec, files: &dyn FileProbe) -> Result<ClusterPlan> {
    let ports = ports::allocate(spec)?;
    let builder = PlanBuilder {
        spec,
        files,
        ports: &ports,
    };
    let plan = builder.build()?;
    plan.verify_ports()?;
    Ok(plan)
}

struct PlanBuilder<'a> {
    spec: &'a TopologySpec,
    files: &'a dyn FileProbe,
    ports: &'a PortAssignment,
}

/// Placement of a node before its command line exists.
struct Slot {
    id: String,
    role: NodeRole,
    port: u16,
    dir: PathBuf,
    replica_set: Option<String>,
    shard_index: Option<u32>,
    /// `--configdb` value, routers only.
    configdb: Option<String>,
}

impl PlanBuilder<'_> {
    fn build(&self) -> Result<ClusterPlan> {
        let root = &self.spec.data_dir;
        let mut plan = ClusterPlan {
            kind: TopologyKind::Single,
            data_dir: root.clone(),
            ssl: self.spec.options.ssl.clone(),
            main: Vec::new(),
            main_set: None,
            config: None,
            shards: Vec::new(),
            routers: Vec::new(),
        };

        match &self.spec.layout {
            Layout::Single => {
                plan.main.push(self.node(Slot {
                    id: "standalone".to_string(),
                    role: NodeRole::Standalone,
                    port: self.ports.main[0],
                    dir: root.clone(),
                    replica_set: None,
                    shard_index: None,
                    configdb: None,
                })?);
            }
            Layout::ReplicaSet {
                name,
                nodes,
                arbiter,
            } => {
                plan.kind = TopologyKind::ReplicaSet;
                plan.main_set = Some(name.clone());
                plan.main = self.replica_members(
                    name,
                    &root.join(name),
                    *nodes,
                    *arbiter,
                    &self.ports.main,
                    NodeRole::ReplicaMember,
                    None,
                )?;
            }
            Layout::Sharded {
                shards,
                shape,
                config,
                ..
            } => {
                plan.kind = TopologyKind::Sharded;
                for index in 0..*shards {
                    plan.shards.push(self.shard(index, *shape)?);
                }
                let config = self.config_group(config.kind)?;
                for port in &self.ports.routers {
                    plan.routers.push(self.router(*port, &config)?);
                }
                plan.config = Some(config);
            }
        }

        Ok(plan)
    }

    fn replica_members(
        &self,
        set: &str,
        dir: &Path,
        nodes: u32,
        arbiter: bool,
        ports: &[u16],
        role: NodeRole,
        shard_index: Option<u32>,
    ) -> Result<Vec<NodeSpec>> {
        let prefix = dir
            .file_name()
            .map_or_else(|| set.to_string(), |name| name.to_string_lossy().into_owned());
        let total = nodes + u32::from(arbiter);
        (1..=total)
            .zip(ports.iter().copied())
            .map(|(n, port)| {
                let role = if arbiter && n == total {
                    NodeRole::Arbiter
                } else {
                    role
                };
                self.node(Slot {
                    id: format!("{prefix}-rs{n}"),
                    role,
                    port,
                    dir: dir.join(format!("rs{n}")),
                    replica_set: Some(set.to_string()),
                    shard_index,
                    configdb: None,
                })
            })
            .collect()
    }

    fn shard(&self, index: u32, shape: GroupShape) -> Result<ShardSpec> {
        let name = format!("shard{:02}", index + 1);
        let dir = self.spec.data_dir.join(&name);
        let ports = &self.ports.shards[index as usize];

        let (replica_set, members) = match shape {
            GroupShape::Single => {
                let member = self.node(Slot {
                    id: name.clone(),
                    role: NodeRole::ShardMember,
                    port: ports[0],
                    dir,
                    replica_set: None,
                    shard_index: Some(index),
                    configdb: None,
                })?;
                (None, vec![member])
            }
            GroupShape::ReplicaSet { nodes, arbiter } => {
                let members = self.replica_members(
                    &name,
                    &dir,
                    nodes,
                    arbiter,
                    ports,
                    NodeRole::ShardMember,
                    Some(index),
                )?;
                (Some(name.clone()), members)
            }
        };

        Ok(ShardSpec {
            name,
            index,
            replica_set,
            members,
        })
    }

    fn config_group(&self, kind: ConfigKind) -> Result<ConfigGroupSpec> {
        let root = &self.spec.data_dir;

        let members = match kind {
            ConfigKind::Csrs => self
                .ports
                .config
                .iter()
                .enumerate()
                .map(|(n, port)| {
                    self.node(Slot {
                        id: format!("{CONFIG_REPLSET_NAME}-rs{}", n + 1),
                        role: NodeRole::ConfigServerMember,
                        port: *port,
                        dir: root.join(CONFIG_REPLSET_NAME).join(format!("rs{}", n + 1)),
                        replica_set: Some(CONFIG_REPLSET_NAME.to_string()),
                        shard_index: None,
                        configdb: None,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            ConfigKind::Legacy => {
                let single = self.ports.config.len() == 1;
                self.ports
                    .config
                    .iter()
                    .enumerate()
                    .map(|(n, port)| {
                        let id = if single {
                            "config".to_string()
                        } else {
                            format!("config{}", n + 1)
                        };
                        self.node(Slot {
                            dir: root.join(&id),
                            id,
                            role: NodeRole::ConfigServerMember,
                            port: *port,
                            replica_set: None,
                            shard_index: None,
                            configdb: None,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?
            }
        };

        Ok(ConfigGroupSpec { kind, members })
    }

    /// Routers depend on the resolved config group for `--configdb`.
    fn router(&self, port: u16, config: &ConfigGroupSpec) -> Result<NodeSpec> {
        self.node(Slot {
            id: format!("mongos-{port}"),
            role: NodeRole::Router,
            port,
            dir: self.spec.data_dir.join("mongos"),
            replica_set: None,
            shard_index: None,
            configdb: Some(config.connection_string()),
        })
    }

    fn node(&self, slot: Slot) -> Result<NodeSpec> {
        self.check_ssl(&slot.id)?;
        let flags = role_flags(slot.role, slot.replica_set.is_some(), &self.spec.options);

        let (program, data_dir, log_path, mut args) = if slot.role.is_router() {
            let configdb = slot.configdb.clone().ok_or_else(|| Error::PlanBuild {
                node: slot.id.clone(),
                reason: "router planned without a config server group".to_string(),
            })?;
            let log_path = slot.dir.join(format!("mongos_{}.log", slot.port));
            let args = vec![
                "--logpath".to_string(),
                log_path.display().to_string(),
                "--port".to_string(),
                slot.port.to_string(),
                "--fork".to_string(),
                "--logappend".to_string(),
                "--configdb".to_string(),
                configdb,
            ];
            (self.program("mongos"), None, log_path, args)
        } else {
            let data_dir = slot.dir.join("db");
            let log_path = slot.dir.join("mongod.log");
            let args = vec![
                "--dbpath".to_string(),
                data_dir.display().to_string(),
                "--port".to_string(),
                slot.port.to_string(),
                "--logpath".to_string(),
                log_path.display().to_string(),
                "--fork".to_string(),
                "--logappend".to_string(),
            ];
            (self.program("mongod"), Some(data_dir), log_path, args)
        };

        if let Some(set) = &slot.replica_set {
            args.push("--replSet".to_string());
            args.push(set.clone());
        }
        // Shard arbiters still join the set as shard servers.
        match slot.role {
            NodeRole::ShardMember => args.push("--shardsvr".to_string()),
            NodeRole::Arbiter if slot.shard_index.is_some() => {
                args.push("--shardsvr".to_string());
            }
            NodeRole::ConfigServerMember => args.push("--configsvr".to_string()),
            NodeRole::Standalone | NodeRole::ReplicaMember | NodeRole::Arbiter | NodeRole::Router => {}
        }
        args.extend(flag_args(&flags));
        args.extend(self.bind_args());

        tracing::debug!(node = %slot.id, role = %slot.role, port = slot.port, "planned node");
        Ok(NodeSpec {
            id: slot.id,
            role: slot.role,
            host: self.spec.hostname.clone(),
            port: slot.port,
            data_dir,
            log_path,
            replica_set: slot.replica_set,
            shard_index: slot.shard_index,
            flags,
            command: CommandLine { program, args },
        })
    }

    fn program(&self, binary: &str) -> PathBuf {
        match &self.spec.binary_path {
            Some(dir) => dir.join(binary),
            None => PathBuf::from(binary),
        }
    }

    /// Non-local hostnames need the server to listen beyond loopback.
    fn bind_args(&self) -> Vec<String> {
        match self.spec.hostname.as_str() {
            "localhost" | "127.0.0.1" => Vec::new(),
            _ => vec!["--bind_ip_all".to_string()],
        }
    }

    fn check_ssl(&self, node: &str) -> Result<()> {
        let Some(ssl) = &self.spec.options.ssl else {
            return Ok(());
        };
        for file in ssl.files() {
            if !self.files.exists(file) {
                return Err(Error::PlanBuild {
                    node: node.to_string(),
                    reason: format!("SSL file {} does not exist", file.display()),
                });
            }
        }
        Ok(())
    }
}

/// Flags for a role. Config servers never receive the storage engine
/// override and arbiters only ever get the default cache size.
fn role_flags(role: NodeRole, in_replica_set: bool, options: &NodeOptions) -> NodeFlags {
    let oplog_size_mb = if in_replica_set {
        options.oplog_size_mb
    } else {
        None
    };
    let ssl = options.ssl.clone();

    match role {
        NodeRole::Standalone | NodeRole::ReplicaMember | NodeRole::ShardMember => NodeFlags {
            storage_engine: options.storage_engine.clone(),
            cache_size_gb: options.data_cache_size_gb(),
            oplog_size_mb,
            ssl,
        },
        NodeRole::Arbiter => NodeFlags {
            storage_engine: None,
            cache_size_gb: Some(DEFAULT_CACHE_SIZE_GB),
            oplog_size_mb,
            ssl,
        },
        NodeRole::ConfigServerMember => NodeFlags {
            storage_engine: None,
            cache_size_gb: Some(options.cache_size_gb.unwrap_or(DEFAULT_CACHE_SIZE_GB)),
            oplog_size_mb,
            ssl,
        },
        NodeRole::Router => NodeFlags {
            ssl,
            ..NodeFlags::default()
        },
    }
}

fn flag_args(flags: &NodeFlags) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(engine) = &flags.storage_engine {
        args.push("--storageEngine".to_string());
        args.push(engine.clone());
    }
    if let Some(size) = flags.cache_size_gb {
        args.push("--wiredTigerCacheSizeGB".to_string());
        args.push(size.to_string());
    }
    if let Some(size) = flags.oplog_size_mb {
        args.push("--oplogSize".to_string());
        args.push(size.to_string());
    }
    if let Some(ssl) = &flags.ssl {
        args.extend(ssl.server_args());
    }
    args
}
