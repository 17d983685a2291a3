//! mlaunch: launch local database test clusters.
//!
//! # Quick Start
//!
//! ```bash
//! # Three-member replica set on ports 27017-27019
//! mlaunch init --replicaset
//!
//! # Two sharded replica sets behind one router
//! mlaunch init --sharded 2 --replicaset --dir ./shards
//!
//! # Inspect, stop and restart
//! mlaunch list
//! mlaunch stop
//! mlaunch start
//! ```

mod commands;
mod style;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mlaunch_cluster::Signal;
use mlaunch_config::ConfigLoader;

use crate::commands::Session;
use crate::commands::init::InitArgs;

/// mlaunch - local standalone, replica set and sharded cluster launcher.
#[derive(Parser)]
#[command(name = "mlaunch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Cluster directory (default: launch.data_dir from configuration).
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version information.
    Version,

    /// Plan and launch a new cluster.
    Init(InitArgs),

    /// Restart the stopped processes of an existing cluster.
    Start,

    /// Stop every process of a cluster gracefully.
    Stop,

    /// Send a signal to every process of a cluster.
    Kill {
        /// Signal to send (SIGTERM, SIGKILL, SIGINT, SIGHUP or its number).
        #[arg(default_value = "SIGKILL")]
        signal: Signal,
    },

    /// Show the processes of a cluster and whether they are alive.
    List {
        /// List every cluster found below the directory.
        #[arg(long)]
        all: bool,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    style::init_color(cli.no_color);

    if let Commands::Version = cli.command {
        commands::version::run();
        return Ok(());
    }

    let mut loader = ConfigLoader::new();
    if let Some(dir) = &cli.dir {
        loader = loader.with_project_dir(dir);
    }
    let config = loader.load().context("Failed to load configuration")?;
    let dir = cli
        .dir
        .clone()
        .unwrap_or_else(|| config.launch.data_dir.clone());
    let session = Session::new(config, dir);

    match cli.command {
        Commands::Version => Ok(()),
        Commands::Init(args) => commands::init::run(&session, &args).await,
        Commands::Start => commands::start::run(&session).await,
        Commands::Stop => commands::stop::run(&session).await,
        Commands::Kill { signal } => commands::stop::kill(&session, signal).await,
        Commands::List { all, json } => commands::list::run(&session, all, json),
    }
}
