//! Configuration management for mlaunch
//!
//! Launcher defaults are merged from several sources:
//! 1. CLI arguments (highest precedence, applied by the binary)
//! 2. Environment variables (MLAUNCH_* prefix, `__` between section and key)
//! 3. mlaunch.toml in the cluster directory
//! 4. ~/.config/mlaunch/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main mlaunch configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlaunchConfig {
    pub launch: LaunchConfig,
    pub timeouts: TimeoutConfig,
    pub client: ClientConfig,
}

/// Defaults for new clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Directory holding `mongod` and `mongos`; `PATH` lookup when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<PathBuf>,
    pub hostname: String,
    pub base_port: u16,
    pub data_dir: PathBuf,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            hostname: "localhost".to_string(),
            base_port: 27017,
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Attempt budgets and intervals for every bounded wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub readiness_attempts: u32,
    pub readiness_interval_ms: u64,
    pub convergence_attempts: u32,
    pub convergence_interval_ms: u64,
    pub registration_attempts: u32,
    pub registration_interval_ms: u64,
    pub shutdown_attempts: u32,
    pub shutdown_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            readiness_attempts: 120,
            readiness_interval_ms: 500,
            convergence_attempts: 120,
            convergence_interval_ms: 1000,
            registration_attempts: 30,
            registration_interval_ms: 1000,
            shutdown_attempts: 60,
            shutdown_interval_ms: 500,
        }
    }
}

impl TimeoutConfig {
    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn convergence_interval(&self) -> Duration {
        Duration::from_millis(self.convergence_interval_ms)
    }

    pub fn registration_interval(&self) -> Duration {
        Duration::from_millis(self.registration_interval_ms)
    }

    pub fn shutdown_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_interval_ms)
    }
}

/// Admin shell used for replica set and shard commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub shell: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("mongosh"),
        }
    }
}

impl MlaunchConfig {
    /// Rejects values no launch can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.launch.hostname.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "launch.hostname must not be empty".to_string(),
            ));
        }
        if self.launch.base_port == 0 {
            return Err(ConfigError::ValidationError(
                "launch.base_port must be greater than 0".to_string(),
            ));
        }
        let budgets = [
            ("readiness_attempts", self.timeouts.readiness_attempts),
            ("convergence_attempts", self.timeouts.convergence_attempts),
            ("registration_attempts", self.timeouts.registration_attempts),
            ("shutdown_attempts", self.timeouts.shutdown_attempts),
        ];
        if let Some((name, _)) = budgets.iter().find(|(_, attempts)| *attempts == 0) {
            return Err(ConfigError::ValidationError(format!(
                "timeouts.{name} must be at least 1"
            )));
        }
        if self.client.shell.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "client.shell must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
