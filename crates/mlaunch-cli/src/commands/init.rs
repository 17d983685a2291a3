//! Init command - plans and launches a new cluster.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use mlaunch_cluster::{Collaborators, TopologyRequest, init_cluster, plan_cluster};

use super::Session;
use crate::style::{
    colors::SemanticStyle, create_spinner, finish_error, finish_success, print_launch_summary,
    print_next_steps, print_plan, print_spacer,
};

/// Topology and node options for a new cluster.
#[derive(Args, Debug, Clone, Default)]
pub struct InitArgs {
    /// Launch a standalone server (or standalone shards).
    #[arg(long, conflicts_with = "replicaset")]
    pub single: bool,

    /// Launch a replica set (or replica set shards).
    #[arg(long)]
    pub replicaset: bool,

    /// Data-bearing members per replica set.
    #[arg(long, requires = "replicaset")]
    pub nodes: Option<u32>,

    /// Add an arbiter to every replica set.
    #[arg(long, requires = "replicaset")]
    pub arbiter: bool,

    /// Replica set name.
    #[arg(long, requires = "replicaset")]
    pub name: Option<String>,

    /// Number of shards.
    #[arg(long)]
    pub sharded: Option<u32>,

    /// Number of config servers.
    #[arg(long = "config", requires = "sharded")]
    pub config_servers: Option<u32>,

    /// Run the config servers as a replica set.
    #[arg(long, requires = "sharded")]
    pub csrs: bool,

    /// Number of routers.
    #[arg(long = "mongos", requires = "sharded")]
    pub routers: Option<u32>,

    /// Storage engine for data-bearing nodes.
    #[arg(long = "storageEngine")]
    pub storage_engine: Option<String>,

    /// WiredTiger cache size in GB for data-bearing nodes.
    #[arg(long = "wiredTigerCacheSizeGB")]
    pub cache_size_gb: Option<f64>,

    /// Oplog size in MB for replica set members.
    #[arg(long = "oplogSize")]
    pub oplog_size_mb: Option<u32>,

    /// SSL mode passed to every process.
    #[arg(long = "sslMode")]
    pub ssl_mode: Option<String>,

    #[arg(long = "sslCAFile")]
    pub ssl_ca_file: Option<PathBuf>,

    #[arg(long = "sslPEMKeyFile")]
    pub ssl_pem_key_file: Option<PathBuf>,

    /// Client certificate the launcher connects with.
    #[arg(long = "sslClientCertificate")]
    pub ssl_client_certificate: Option<PathBuf>,

    /// First port of the cluster.
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding the server binaries.
    #[arg(long = "binarypath")]
    pub binary_path: Option<PathBuf>,

    /// Hostname used in replica set and shard connection strings.
    #[arg(long)]
    pub hostname: Option<String>,

    /// Print the planned command lines without launching anything.
    #[arg(long)]
    pub dry_run: bool,
}

impl InitArgs {
    /// Merges the flags over the configured launch defaults.
    pub fn to_request(&self, session: &Session) -> TopologyRequest {
        let launch = &session.config.launch;
        TopologyRequest {
            single: self.single,
            replicaset: self.replicaset,
            sharded: self.sharded,
            nodes: self.nodes,
            arbiter: self.arbiter,
            name: self.name.clone(),
            config_servers: self.config_servers,
            csrs: self.csrs,
            routers: self.routers,
            storage_engine: self.storage_engine.clone(),
            cache_size_gb: self.cache_size_gb,
            oplog_size_mb: self.oplog_size_mb,
            ssl_mode: self.ssl_mode.clone(),
            ssl_ca_file: self.ssl_ca_file.clone(),
            ssl_pem_key_file: self.ssl_pem_key_file.clone(),
            ssl_client_certificate: self.ssl_client_certificate.clone(),
            base_port: Some(self.port.unwrap_or(launch.base_port)),
            hostname: Some(
                self.hostname
                    .clone()
                    .unwrap_or_else(|| launch.hostname.clone()),
            ),
            binary_path: self.binary_path.clone().or_else(|| launch.binary_path.clone()),
            data_dir: Some(session.dir.clone()),
        }
    }
}

pub async fn run(session: &Session, args: &InitArgs) -> Result<()> {
    let request = args.to_request(session);
    let plan = plan_cluster(&request).context("Invalid cluster topology")?;

    if args.dry_run {
        print_plan(&plan);
        return Ok(());
    }

    print_spacer();
    println!(
        "Launching {} cluster in {}...",
        plan.kind,
        session.dir().display().to_string().code()
    );
    print_spacer();

    let collaborators = Collaborators::local(&session.config.client.shell, plan.ssl.as_ref());
    let sp = create_spinner(&format!("Starting {} processes...", plan.process_count()));
    let report = match init_cluster(&request, collaborators, session.policies()).await {
        Ok(report) => {
            finish_success(&sp, &format!("{} processes running", report.processes.len()));
            report
        }
        Err(e) => {
            finish_error(&sp, "Launch failed, cluster torn down");
            return Err(e).context("Failed to launch cluster");
        }
    };

    print_launch_summary(&report);
    print_next_steps(session.dir());
    Ok(())
}
