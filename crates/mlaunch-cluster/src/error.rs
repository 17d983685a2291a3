//! Error types for cluster planning and lifecycle management.

use std::path::PathBuf;
use thiserror::Error;

/// Cluster planning and lifecycle errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The topology request cannot describe a valid cluster.
    #[error("Invalid topology: {0}")]
    InvalidTopologySpec(String),

    /// Two nodes would bind the same port, or the port range overflows.
    #[error("Port conflict: {0}")]
    PortConflict(String),

    /// A node's command line could not be built.
    #[error("Cannot build plan for {node}: {reason}")]
    PlanBuild { node: String, reason: String },

    /// The process spawning collaborator failed.
    #[error("Failed to spawn {node}: {reason}")]
    ProcessSpawn { node: String, reason: String },

    /// A node never started accepting connections.
    #[error("Node {node} on port {port} not ready after {attempts} attempts")]
    ReadinessTimeout {
        node: String,
        port: u16,
        attempts: u32,
    },

    /// A replica set never reported the requested membership.
    #[error("Replica set {set} did not converge after {attempts} attempts: {last}")]
    ReplicaSetConvergenceTimeout {
        set: String,
        attempts: u32,
        last: String,
    },

    /// The router rejected a shard.
    #[error("Failed to register shard {shard}: {reason}")]
    ShardRegistration { shard: String, reason: String },

    /// The startup state file exists but cannot be used.
    #[error("Startup state at {path} is corrupt: {reason}")]
    PersistedStateCorrupt { path: PathBuf, reason: String },

    /// No startup state in the directory.
    #[error("No cluster initialized at {0}")]
    NotInitialized(PathBuf),

    /// The directory already holds a cluster.
    #[error("A cluster is already initialized at {0}")]
    AlreadyInitialized(PathBuf),

    /// Another lifecycle operation holds the state lock.
    #[error("Another mlaunch operation holds {0}")]
    StateLocked(PathBuf),

    /// An admin command failed outside a bounded wait.
    #[error("Admin command failed: {0}")]
    Admin(#[from] ClientError),

    /// Illegal lifecycle state change.
    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true for errors detected before any process is spawned.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidTopologySpec(_) | Error::PortConflict(_) | Error::PlanBuild { .. }
        )
    }
}

/// Errors reported by the database admin client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The target could not be reached.
    #[error("{target} unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    /// The server answered with an error.
    #[error("{command} failed on {target}: {message}")]
    Command {
        command: String,
        target: String,
        message: String,
    },

    /// The response could not be understood.
    #[error("Unexpected response from {target}: {reason}")]
    Response { target: String, reason: String },
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;
