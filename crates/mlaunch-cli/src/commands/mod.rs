//! CLI command implementations.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mlaunch_cluster::{Collaborators, Policies, RetryPolicy, StateStore};
use mlaunch_config::{MlaunchConfig, TimeoutConfig};

pub mod init;
pub mod list;
pub mod start;
pub mod stop;
pub mod version;

/// Resolved configuration and cluster directory shared by every command.
pub struct Session {
    pub config: MlaunchConfig,
    pub dir: PathBuf,
}

impl Session {
    pub fn new(config: MlaunchConfig, dir: PathBuf) -> Self {
        Self { config, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policies(&self) -> Policies {
        policies(&self.config.timeouts)
    }

    /// Collaborators for an existing cluster, configured with the TLS
    /// settings it was launched with.
    pub fn existing_collaborators(&self) -> Result<Collaborators> {
        let persisted = StateStore::new(&self.dir).load().with_context(|| {
            format!(
                "No cluster found in {}. Run: mlaunch init",
                self.dir.display()
            )
        })?;
        Ok(Collaborators::local(
            &self.config.client.shell,
            persisted.plan.ssl.as_ref(),
        ))
    }
}

/// Retry policies built from the configured attempt budgets.
pub fn policies(timeouts: &TimeoutConfig) -> Policies {
    Policies {
        readiness: RetryPolicy::fixed(timeouts.readiness_attempts, timeouts.readiness_interval()),
        convergence: RetryPolicy::fixed(
            timeouts.convergence_attempts,
            timeouts.convergence_interval(),
        ),
        registration: RetryPolicy::fixed(
            timeouts.registration_attempts,
            timeouts.registration_interval(),
        ),
        shutdown: RetryPolicy::fixed(timeouts.shutdown_attempts, timeouts.shutdown_interval()),
    }
}
