//! Topology requests and their canonical, validated form.
//!
//! A [`TopologyRequest`] carries whatever the caller supplied; every field is
//! optional. [`TopologyRequest::normalize`] fills in defaults and rejects
//! requests that cannot describe a cluster, producing a [`TopologySpec`]
//! that the port allocator and plan builder consume without further checks.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Port the first process binds when no base port is given.
pub const DEFAULT_BASE_PORT: u16 = 27017;

/// Data-bearing members in a replica set when no count is given.
pub const DEFAULT_NODE_COUNT: u32 = 3;

/// Replica set name for non-sharded replica sets.
pub const DEFAULT_REPLSET_NAME: &str = "replset";

/// Replica set name of a CSRS config server group.
pub const CONFIG_REPLSET_NAME: &str = "configRepl";

/// WiredTiger cache size given to every node that runs WiredTiger.
pub const DEFAULT_CACHE_SIZE_GB: f64 = 1.0;

/// Storage engine that honours `--wiredTigerCacheSizeGB`.
pub const WIRED_TIGER: &str = "wiredTiger";

/// Raw topology request, as produced by the CLI layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyRequest {
    /// Standalone data nodes.
    pub single: bool,
    /// Replica-set data nodes.
    pub replicaset: bool,
    /// Number of shards; `None` for a non-sharded cluster.
    pub sharded: Option<u32>,
    /// Data-bearing members per replica set.
    pub nodes: Option<u32>,
    /// Add one arbiter to every replica set.
    pub arbiter: bool,
    /// Name of the non-sharded replica set.
    pub name: Option<String>,
    /// Config server count.
    pub config_servers: Option<u32>,
    /// Run the config servers as a replica set.
    pub csrs: bool,
    /// Router (mongos) count.
    pub routers: Option<u32>,
    pub storage_engine: Option<String>,
    pub cache_size_gb: Option<f64>,
    pub oplog_size_mb: Option<u32>,
    pub ssl_mode: Option<String>,
    pub ssl_ca_file: Option<PathBuf>,
    pub ssl_pem_key_file: Option<PathBuf>,
    pub ssl_client_certificate: Option<PathBuf>,
    pub base_port: Option<u16>,
    pub hostname: Option<String>,
    pub binary_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

/// Shape of one group of data-bearing nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum GroupShape {
    /// One standalone process.
    Single,
    /// A replica set of `nodes` data members plus an optional arbiter.
    ReplicaSet { nodes: u32, arbiter: bool },
}

impl GroupShape {
    /// Total processes in the group, arbiters included.
    pub fn member_count(&self) -> u32 {
        match self {
            GroupShape::Single => 1,
            GroupShape::ReplicaSet { nodes, arbiter } => nodes.saturating_add(u32::from(*arbiter)),
        }
    }

    /// Arbiters in the group.
    pub fn arbiter_count(&self) -> u32 {
        match self {
            GroupShape::Single => 0,
            GroupShape::ReplicaSet { arbiter, .. } => u32::from(*arbiter),
        }
    }
}

/// How config servers are deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigKind {
    /// Mirrored standalone config servers (1 or 3).
    Legacy,
    /// Config server replica set.
    Csrs,
}

/// Config server group layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigLayout {
    pub kind: ConfigKind,
    pub count: u32,
}

/// Canonical cluster layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Layout {
    Single,
    ReplicaSet {
        name: String,
        nodes: u32,
        arbiter: bool,
    },
    Sharded {
        shards: u32,
        shape: GroupShape,
        config: ConfigLayout,
        routers: u32,
    },
}

impl Layout {
    /// Number of processes the layout needs.
    pub fn process_count(&self) -> u32 {
        match self {
            Layout::Single => 1,
            Layout::ReplicaSet { nodes, arbiter, .. } => nodes.saturating_add(u32::from(*arbiter)),
            Layout::Sharded {
                shards,
                shape,
                config,
                routers,
            } => shards
                .saturating_mul(shape.member_count())
                .saturating_add(config.count)
                .saturating_add(*routers),
        }
    }
}

/// SSL material threaded through to every process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslBundle {
    pub mode: String,
    pub ca_file: Option<PathBuf>,
    pub pem_key_file: PathBuf,
    /// Used only by the launcher's own admin connections.
    pub client_certificate: Option<PathBuf>,
}

impl SslBundle {
    /// Server-side flags, identical for every process.
    pub fn server_args(&self) -> Vec<String> {
        let mut args = vec!["--sslMode".to_string(), self.mode.clone()];
        if let Some(ca) = &self.ca_file {
            args.push("--sslCAFile".to_string());
            args.push(ca.display().to_string());
        }
        args.push("--sslPEMKeyFile".to_string());
        args.push(self.pem_key_file.display().to_string());
        args
    }

    /// Every file the bundle references.
    pub fn files(&self) -> Vec<&Path> {
        let mut files = vec![self.pem_key_file.as_path()];
        files.extend(self.ca_file.as_deref());
        files.extend(self.client_certificate.as_deref());
        files
    }
}

/// Options shared by every process of the cluster.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeOptions {
    pub storage_engine: Option<String>,
    pub cache_size_gb: Option<f64>,
    pub oplog_size_mb: Option<u32>,
    pub ssl: Option<SslBundle>,
}

impl NodeOptions {
    /// Whether data-bearing nodes run WiredTiger.
    pub fn runs_wired_tiger(&self) -> bool {
        self.storage_engine
            .as_deref()
            .is_none_or(|engine| engine.eq_ignore_ascii_case(WIRED_TIGER))
    }

    /// Cache size for data-bearing nodes, `None` when the engine has no
    /// WiredTiger cache.
    pub fn data_cache_size_gb(&self) -> Option<f64> {
        self.runs_wired_tiger()
            .then(|| self.cache_size_gb.unwrap_or(DEFAULT_CACHE_SIZE_GB))
    }
}

/// Canonical, fully defaulted topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySpec {
    pub layout: Layout,
    pub options: NodeOptions,
    pub base_port: u16,
    pub hostname: String,
    pub binary_path: Option<PathBuf>,
    pub data_dir: PathBuf,
}

impl TopologySpec {
    pub fn is_sharded(&self) -> bool {
        matches!(self.layout, Layout::Sharded { .. })
    }
}

impl TopologyRequest {
    /// Validates the request and fills in every default.
    pub fn normalize(&self) -> Result<TopologySpec> {
        let shape = self.group_shape()?;

        let layout = match self.sharded {
            Some(shards) => {
                if shards < 1 {
                    return Err(invalid(format!(
                        "a sharded cluster needs at least one shard, got {shards}"
                    )));
                }
                let routers = self.routers.unwrap_or(1);
                if routers < 1 {
                    return Err(invalid("a sharded cluster needs at least one router"));
                }
                Layout::Sharded {
                    shards,
                    shape,
                    config: self.config_layout()?,
                    routers,
                }
            }
            None => {
                if self.config_servers.is_some() || self.csrs {
                    return Err(invalid("config servers only apply to sharded clusters"));
                }
                if self.routers.is_some() {
                    return Err(invalid("routers only apply to sharded clusters"));
                }
                match shape {
                    GroupShape::Single => Layout::Single,
                    GroupShape::ReplicaSet { nodes, arbiter } => Layout::ReplicaSet {
                        name: self.replset_name()?,
                        nodes,
                        arbiter,
                    },
                }
            }
        };

        let base_port = self.base_port.unwrap_or(DEFAULT_BASE_PORT);
        let last = u64::from(base_port) + u64::from(layout.process_count()) - 1;
        if last > u64::from(u16::MAX) {
            return Err(Error::PortConflict(format!(
                "{} processes starting at port {base_port} overflow the port range",
                layout.process_count()
            )));
        }

        let hostname = self
            .hostname
            .clone()
            .unwrap_or_else(|| "localhost".to_string());
        if hostname.trim().is_empty() {
            return Err(invalid("hostname must not be empty"));
        }

        Ok(TopologySpec {
            layout,
            options: self.node_options()?,
            base_port,
            hostname,
            binary_path: self.binary_path.clone(),
            data_dir: self
                .data_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("data")),
        })
    }

    fn group_shape(&self) -> Result<GroupShape> {
        if let Some(nodes) = self.nodes {
            if nodes < 1 {
                return Err(invalid(format!("node count must be >= 1, got {nodes}")));
            }
        }

        match (self.single, self.replicaset) {
            (true, true) => Err(invalid("--single and --replicaset are mutually exclusive")),
            (false, false) => Err(invalid("one of --single or --replicaset is required")),
            (true, false) => {
                if self.arbiter {
                    return Err(invalid("an arbiter needs a replica set"));
                }
                Ok(GroupShape::Single)
            }
            (false, true) => Ok(GroupShape::ReplicaSet {
                nodes: self.nodes.unwrap_or(DEFAULT_NODE_COUNT),
                arbiter: self.arbiter,
            }),
        }
    }

    fn config_layout(&self) -> Result<ConfigLayout> {
        let count = self.config_servers.unwrap_or(1);
        if self.csrs {
            if count < 1 {
                return Err(invalid("a config server replica set needs at least one member"));
            }
            return Ok(ConfigLayout {
                kind: ConfigKind::Csrs,
                count,
            });
        }
        if count != 1 && count != 3 {
            return Err(invalid(format!(
                "legacy config servers must number 1 or 3, got {count} (use --csrs for other sizes)"
            )));
        }
        Ok(ConfigLayout {
            kind: ConfigKind::Legacy,
            count,
        })
    }

    fn replset_name(&self) -> Result<String> {
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| DEFAULT_REPLSET_NAME.to_string());
        if name.is_empty() || name.contains(['/', ' ', ',']) {
            return Err(invalid(format!("invalid replica set name {name:?}")));
        }
        Ok(name)
    }

    fn node_options(&self) -> Result<NodeOptions> {
        if let Some(size) = self.cache_size_gb {
            if size.is_nan() || size <= 0.0 {
                return Err(invalid(format!("cache size must be positive, got {size}")));
            }
            if let Some(engine) = &self.storage_engine {
                if !engine.eq_ignore_ascii_case(WIRED_TIGER) {
                    return Err(invalid(format!(
                        "--wiredTigerCacheSizeGB requires the {WIRED_TIGER} storage engine, not {engine}"
                    )));
                }
            }
        }
        if let Some(0) = self.oplog_size_mb {
            return Err(invalid("oplog size must be positive"));
        }

        Ok(NodeOptions {
            storage_engine: self.storage_engine.clone(),
            cache_size_gb: self.cache_size_gb,
            oplog_size_mb: self.oplog_size_mb,
            ssl: self.ssl_bundle()?,
        })
    }

    fn ssl_bundle(&self) -> Result<Option<SslBundle>> {
        let mode = match self.ssl_mode.as_deref() {
            None | Some("disabled") => {
                if self.ssl_pem_key_file.is_some() || self.ssl_ca_file.is_some() {
                    return Err(invalid("SSL files given without an --sslMode"));
                }
                return Ok(None);
            }
            Some(mode) => mode.to_string(),
        };
        let pem_key_file = self
            .ssl_pem_key_file
            .clone()
            .ok_or_else(|| invalid(format!("--sslMode {mode} requires --sslPEMKeyFile")))?;
        Ok(Some(SslBundle {
            mode,
            ca_file: self.ssl_ca_file.clone(),
            pem_key_file,
            client_certificate: self.ssl_client_certificate.clone(),
        }))
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidTopologySpec(reason.into())
}
