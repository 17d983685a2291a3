//! Node process management.
//!
//! The [`Launcher`] spawns planned nodes through a [`ProcessSpawner`], waits
//! for them through a [`ReadinessProbe`], and tears them down again. Servers
//! daemonize themselves (`--fork`), so the launcher never owns a child
//! handle: everything after spawn goes through the recorded pid.

use crate::plan::{CommandLine, NodeSpec};
use crate::retry::{Attempt, RetryPolicy};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use nix::errno::Errno;
use nix::sys::signal::{self as nix_signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Signals the launcher sends to cluster processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Terminate,
    Kill,
    Interrupt,
    Hangup,
}

impl Signal {
    /// Whether the signal's default action ends the process. Servers treat
    /// `SIGHUP` as a log rotation request.
    pub fn ends_process(self) -> bool {
        !matches!(self, Signal::Hangup)
    }

    fn as_nix(self) -> nix_signal::Signal {
        match self {
            Signal::Terminate => nix_signal::Signal::SIGTERM,
            Signal::Kill => nix_signal::Signal::SIGKILL,
            Signal::Interrupt => nix_signal::Signal::SIGINT,
            Signal::Hangup => nix_signal::Signal::SIGHUP,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_nix().as_str())
    }
}

impl FromStr for Signal {
    type Err = String;

    /// Accepts `SIGKILL`, `KILL`, `kill` or `9` and the same forms for the
    /// other supported signals.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "TERM" | "15" => Ok(Signal::Terminate),
            "KILL" | "9" => Ok(Signal::Kill),
            "INT" | "2" => Ok(Signal::Interrupt),
            "HUP" | "1" => Ok(Signal::Hangup),
            _ => Err(format!(
                "unsupported signal '{s}' (expected SIGTERM, SIGKILL, SIGINT or SIGHUP)"
            )),
        }
    }
}

/// OS process spawning and signalling.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Runs `command` from `working_dir` and returns the pid of the server
    /// it started.
    async fn spawn(&self, command: &CommandLine, working_dir: &Path) -> io::Result<u32>;

    /// Sends `signal`. A process that is already gone is not an error.
    fn terminate(&self, pid: u32, signal: Signal) -> io::Result<()>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Connection readiness checks.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self, host: &str, port: u16) -> bool;
}

/// [`ProcessSpawner`] for servers that daemonize with `--fork`.
///
/// The command must exit with status 0 after printing
/// `forked process: <pid>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForkingSpawner;

#[async_trait]
impl ProcessSpawner for ForkingSpawner {
    async fn spawn(&self, command: &CommandLine, working_dir: &Path) -> io::Result<u32> {
        let output = Command::new(&command.program)
            .args(&command.args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("cannot run {}: {e}", command.program.display()),
                )
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr
                .lines()
                .chain(stdout.lines())
                .map(str::trim)
                .rfind(|line| !line.is_empty())
                .unwrap_or("no output");
            return Err(io::Error::other(format!(
                "{} exited with {}: {detail}",
                command.program.display(),
                output.status
            )));
        }

        parse_forked_pid(&stdout).ok_or_else(|| {
            io::Error::other(format!(
                "{} did not report a forked process id",
                command.program.display()
            ))
        })
    }

    fn terminate(&self, pid: u32, signal: Signal) -> io::Result<()> {
        match kill(to_pid(pid)?, signal.as_nix()) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = to_pid(pid) else {
            return false;
        };
        matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM))
    }
}

fn to_pid(pid: u32) -> io::Result<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {pid}"),
        )),
    }
}

/// Extracts the pid from a forking server's startup output.
pub fn parse_forked_pid(stdout: &str) -> Option<u32> {
    stdout.lines().find_map(|line| {
        let (_, rest) = line.split_once("forked process:")?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

/// [`ReadinessProbe`] that attempts a TCP connection.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    pub connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn is_ready(&self, host: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }
}

/// Status of a launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessStatus {
    /// Spawned, not yet accepting connections.
    Starting,

    /// Accepting connections.
    Ready,

    /// Terminated by the launcher.
    Stopped,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Ready => "ready",
            ProcessStatus::Stopped => "stopped",
        })
    }
}

/// A spawned node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeProcess {
    pub node: NodeSpec,
    pub pid: u32,
    /// Command line exactly as it was run.
    pub command_line: String,
    pub status: ProcessStatus,
}

impl RuntimeProcess {
    pub fn id(&self) -> &str {
        &self.node.id
    }

    pub fn port(&self) -> u16 {
        self.node.port
    }
}

/// Spawns, probes and stops nodes.
#[derive(Clone, Copy)]
pub struct Launcher<'a> {
    spawner: &'a dyn ProcessSpawner,
    probe: &'a dyn ReadinessProbe,
}

impl<'a> Launcher<'a> {
    pub fn new(spawner: &'a dyn ProcessSpawner, probe: &'a dyn ReadinessProbe) -> Self {
        Self { spawner, probe }
    }

    /// Creates the node's directories and runs its command line.
    pub async fn spawn(&self, node: &NodeSpec) -> Result<RuntimeProcess> {
        let spawn_error = |reason: String| Error::ProcessSpawn {
            node: node.id.clone(),
            reason,
        };

        if let Some(dir) = &node.data_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| spawn_error(format!("cannot create {}: {e}", dir.display())))?;
        }
        if let Some(dir) = node.log_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| spawn_error(format!("cannot create {}: {e}", dir.display())))?;
        }

        let command_line = node.command.to_string();
        debug!(node = %node.id, command = %command_line, "spawning");
        let pid = self
            .spawner
            .spawn(&node.command, node.working_dir())
            .await
            .map_err(|e| spawn_error(e.to_string()))?;

        info!(node = %node.id, port = node.port, pid, "node spawned");
        Ok(RuntimeProcess {
            node: node.clone(),
            pid,
            command_line,
            status: ProcessStatus::Starting,
        })
    }

    /// Waits until the node accepts connections.
    pub async fn await_ready(&self, node: &NodeSpec, policy: &RetryPolicy) -> Result<()> {
        policy
            .poll(move |_| async move {
                if self.probe.is_ready(&node.host, node.port).await {
                    Attempt::Done(())
                } else {
                    Attempt::Retry(format!("{} not accepting connections", node.host_port()))
                }
            })
            .await
            .map_err(|exhausted| Error::ReadinessTimeout {
                node: node.id.clone(),
                port: node.port,
                attempts: exhausted.attempts,
            })?;

        info!(node = %node.id, port = node.port, "node ready");
        Ok(())
    }

    /// Waits for every node concurrently; the first timeout wins.
    pub async fn await_all_ready(&self, nodes: &[&NodeSpec], policy: &RetryPolicy) -> Result<()> {
        try_join_all(nodes.iter().map(|node| self.await_ready(node, policy))).await?;
        Ok(())
    }

    /// Sends `signal` and waits for the process to exit under `policy`.
    ///
    /// A graceful termination that outlives the policy escalates to
    /// `SIGKILL`. Returns whether the process is gone.
    pub async fn terminate(
        &self,
        process: &RuntimeProcess,
        signal: Signal,
        policy: &RetryPolicy,
    ) -> Result<bool> {
        if !self.spawner.is_alive(process.pid) {
            debug!(node = %process.id(), pid = process.pid, "already exited");
            return Ok(true);
        }

        self.signal(process, signal)?;
        if self.wait_for_exit(process.pid, policy).await {
            info!(node = %process.id(), pid = process.pid, "node stopped");
            return Ok(true);
        }

        if signal != Signal::Kill {
            warn!(
                node = %process.id(),
                pid = process.pid,
                "did not exit after {signal}, sending SIGKILL"
            );
            self.spawner.terminate(process.pid, Signal::Kill)?;
            if self.wait_for_exit(process.pid, policy).await {
                return Ok(true);
            }
        }

        warn!(node = %process.id(), pid = process.pid, "process still alive");
        Ok(false)
    }

    /// Sends `signal` without waiting.
    pub fn signal(&self, process: &RuntimeProcess, signal: Signal) -> Result<()> {
        self.spawner.terminate(process.pid, signal)?;
        debug!(node = %process.id(), pid = process.pid, %signal, "signal sent");
        Ok(())
    }

    /// Waits under `policy` for `pid` to exit. Returns whether it did.
    pub async fn wait_for_exit(&self, pid: u32, policy: &RetryPolicy) -> bool {
        policy
            .poll(move |_| async move {
                if self.spawner.is_alive(pid) {
                    Attempt::Retry(format!("pid {pid} alive"))
                } else {
                    Attempt::Done(())
                }
            })
            .await
            .is_ok()
    }

    pub fn is_alive(&self, process: &RuntimeProcess) -> bool {
        self.spawner.is_alive(process.pid)
    }
}
