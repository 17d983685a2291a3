//! Database admin client boundary.
//!
//! The launcher issues three administrative commands: `replSetGetConfig`,
//! `replSetInitiate` and `addShard`. [`AdminClient`] is the seam; the local
//! implementation [`ShellAdminClient`] drives the `mongosh` shell and reads
//! back a single line of JSON per command.

use crate::ClientError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Server error code for a member that has no replica set config yet.
const NOT_YET_INITIALIZED: i64 = 94;

/// Server error code for `replSetInitiate` against an initiated set.
const ALREADY_INITIALIZED: i64 = 23;

/// A `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One member entry of a replica set config document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplSetMember {
    #[serde(rename = "_id")]
    pub id: u32,
    pub host: String,
    #[serde(rename = "arbiterOnly", default)]
    pub arbiter_only: bool,
}

/// The parts of a replica set config document the launcher reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplSetConfig {
    #[serde(rename = "_id")]
    pub name: String,
    pub members: Vec<ReplSetMember>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub configsvr: bool,
}

impl ReplSetConfig {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn arbiter_count(&self) -> usize {
        self.members.iter().filter(|m| m.arbiter_only).count()
    }
}

/// Administrative commands against a running server or router.
#[async_trait]
pub trait AdminClient: Send + Sync {
    /// Current replica set config, `None` when the set is not initiated.
    async fn replset_get_config(
        &self,
        seed: &HostPort,
    ) -> Result<Option<ReplSetConfig>, ClientError>;

    /// Initiates a replica set through `seed`.
    async fn replset_initiate(
        &self,
        seed: &HostPort,
        config: &ReplSetConfig,
    ) -> Result<(), ClientError>;

    /// Registers a shard with a router.
    async fn add_shard(
        &self,
        router: &HostPort,
        connection: &str,
        name: &str,
    ) -> Result<(), ClientError>;
}

/// TLS settings for the shell's own connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellTls {
    pub ca_file: Option<PathBuf>,
    pub certificate_key_file: Option<PathBuf>,
}

/// [`AdminClient`] that runs each command through the `mongosh` shell.
#[derive(Debug, Clone)]
pub struct ShellAdminClient {
    shell: PathBuf,
    tls: Option<ShellTls>,
}

/// Reply line printed by every shell script.
#[derive(Debug, Deserialize)]
struct ShellReply {
    ok: f64,
    #[serde(default)]
    errmsg: Option<String>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    config: Option<ReplSetConfig>,
}

impl ShellAdminClient {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: ShellTls) -> Self {
        self.tls = Some(tls);
        self
    }

    async fn run(
        &self,
        target: &HostPort,
        command: &str,
        script: &str,
    ) -> Result<ShellReply, ClientError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("--quiet")
            .arg("--host")
            .arg(&target.host)
            .arg("--port")
            .arg(target.port.to_string());
        if let Some(tls) = &self.tls {
            cmd.arg("--tls");
            if let Some(ca) = &tls.ca_file {
                cmd.arg("--tlsCAFile").arg(ca);
            }
            if let Some(cert) = &tls.certificate_key_file {
                cmd.arg("--tlsCertificateKeyFile").arg(cert);
            }
        }
        cmd.arg("--eval").arg(script).stdin(Stdio::null());

        tracing::debug!(target_addr = %target, command, "running admin command");
        let output = cmd.output().await.map_err(|e| ClientError::Unreachable {
            target: target.to_string(),
            reason: format!("cannot run {}: {e}", self.shell.display()),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClientError::Unreachable {
                target: target.to_string(),
                reason: last_line(&stderr).unwrap_or("shell exited with an error").to_string(),
            });
        }

        parse_reply(&stdout).map_err(|reason| ClientError::Response {
            target: target.to_string(),
            reason,
        })
    }

    fn failure(target: &HostPort, command: &str, reply: &ShellReply) -> ClientError {
        ClientError::Command {
            command: command.to_string(),
            target: target.to_string(),
            message: reply
                .errmsg
                .clone()
                .unwrap_or_else(|| format!("error code {:?}", reply.code)),
        }
    }
}

#[async_trait]
impl AdminClient for ShellAdminClient {
    async fn replset_get_config(
        &self,
        seed: &HostPort,
    ) -> Result<Option<ReplSetConfig>, ClientError> {
        let script = admin_script(
            &json!({ "replSetGetConfig": 1 }),
            "{ok: 1, config: {_id: r.config._id, configsvr: !!r.config.configsvr, \
             members: r.config.members.map(m => ({_id: m._id, host: m.host, arbiterOnly: !!m.arbiterOnly}))}}",
        );
        let reply = self.run(seed, "replSetGetConfig", &script).await?;

        if reply.ok >= 1.0 {
            return reply.config.map(Some).ok_or_else(|| ClientError::Response {
                target: seed.to_string(),
                reason: "replSetGetConfig reply has no config".to_string(),
            });
        }
        if reply.code == Some(NOT_YET_INITIALIZED) {
            return Ok(None);
        }
        Err(Self::failure(seed, "replSetGetConfig", &reply))
    }

    async fn replset_initiate(
        &self,
        seed: &HostPort,
        config: &ReplSetConfig,
    ) -> Result<(), ClientError> {
        let config = serde_json::to_value(config).map_err(|e| ClientError::Response {
            target: seed.to_string(),
            reason: e.to_string(),
        })?;
        let script = admin_script(&json!({ "replSetInitiate": config }), STATUS_PROJECTION);
        let reply = self.run(seed, "replSetInitiate", &script).await?;

        if reply.ok >= 1.0 || reply.code == Some(ALREADY_INITIALIZED) {
            Ok(())
        } else {
            Err(Self::failure(seed, "replSetInitiate", &reply))
        }
    }

    async fn add_shard(
        &self,
        router: &HostPort,
        connection: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        let script = admin_script(
            &json!({ "addShard": connection, "name": name }),
            STATUS_PROJECTION,
        );
        let reply = self.run(router, "addShard", &script).await?;

        if reply.ok >= 1.0 {
            Ok(())
        } else {
            Err(Self::failure(router, "addShard", &reply))
        }
    }
}

const STATUS_PROJECTION: &str = "{ok: r.ok, errmsg: r.errmsg, code: r.code}";

/// Wraps an admin command so the shell prints exactly one JSON line, even
/// when the driver throws.
fn admin_script(command: &Value, projection: &str) -> String {
    format!(
        "try {{ const r = db.adminCommand({command}); \
         if (r.ok) {{ print(JSON.stringify({projection})); }} \
         else {{ print(JSON.stringify({{ok: 0, errmsg: r.errmsg, code: r.code}})); }} }} \
         catch (e) {{ print(JSON.stringify({{ok: 0, errmsg: e.message, code: e.code}})); }}"
    )
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|line| !line.is_empty())
}

fn parse_reply(stdout: &str) -> Result<ShellReply, String> {
    let line = last_line(stdout).ok_or_else(|| "empty shell output".to_string())?;
    serde_json::from_str(line).map_err(|e| format!("{e} in {line:?}"))
}
