//! Startup-state persistence.
//!
//! A launched cluster is described by one JSON file, `.mlaunch_startup`, in
//! its data directory. It holds the immutable plan plus what was actually
//! spawned, and is the only record later invocations trust.

use crate::node::{ProcessStatus, RuntimeProcess};
use crate::plan::ClusterPlan;
use crate::supervisor::LaunchState;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the state file inside a cluster directory.
pub const STATE_FILE: &str = ".mlaunch_startup";

/// Current on-disk format.
pub const STATE_VERSION: u32 = 1;

const LOCK_FILE: &str = ".mlaunch_startup.lock";
const TEMP_FILE: &str = ".mlaunch_startup.tmp";

/// Everything recorded about a launched cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: LaunchState,
    pub plan: ClusterPlan,
    /// Spawned processes in spawn order.
    pub processes: Vec<RuntimeProcess>,
    /// Node id to the command line that started it.
    pub startup_info: BTreeMap<String, String>,
}

impl PersistedState {
    pub fn new(plan: ClusterPlan, processes: Vec<RuntimeProcess>, state: LaunchState) -> Self {
        let now = Utc::now();
        let mut persisted = Self {
            version: STATE_VERSION,
            created_at: now,
            updated_at: now,
            state,
            plan,
            processes,
            startup_info: BTreeMap::new(),
        };
        persisted.refresh_startup_info();
        persisted
    }

    /// Rebuilds `startup_info` from the process list.
    pub fn refresh_startup_info(&mut self) {
        self.startup_info = self
            .processes
            .iter()
            .map(|p| (p.node.id.clone(), p.command_line.clone()))
            .collect();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether every recorded process was stopped by the launcher.
    pub fn all_stopped(&self) -> bool {
        self.processes
            .iter()
            .all(|p| p.status == ProcessStatus::Stopped)
    }
}

/// State file access for one cluster directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    pub fn load(&self) -> Result<PersistedState> {
        let path = self.path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotInitialized(self.dir.clone()));
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let corrupt = |reason: String| Error::PersistedStateCorrupt {
            path: path.clone(),
            reason,
        };

        // Version first, so a newer format reports as unsupported rather
        // than as a field mismatch.
        let raw: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;
        let version = raw
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| corrupt("missing format version".to_string()))?;
        if version != u64::from(STATE_VERSION) {
            return Err(corrupt(format!(
                "unsupported format version {version} (expected {STATE_VERSION})"
            )));
        }

        let state: PersistedState =
            serde_json::from_value(raw).map_err(|e| corrupt(e.to_string()))?;
        debug!(path = %path.display(), processes = state.processes.len(), "state loaded");
        Ok(state)
    }

    /// Writes the state through a temporary file and a rename, so readers
    /// never see a partial file.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let temp = self.dir.join(TEMP_FILE);
        let mut file = File::create(&temp)?;
        serde_json::to_writer_pretty(&mut file, state)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&temp, self.path())?;
        debug!(path = %self.path().display(), "state saved");
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Takes the directory's lifecycle lock.
    ///
    /// A lock left behind by a process that no longer exists is reclaimed.
    pub fn lock(&self) -> Result<StateLock> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(LOCK_FILE);
        match create_lock(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if let Some(pid) = read_pid(&path)
                    && process_exists(pid)
                {
                    return Err(Error::StateLocked(path));
                }
                warn!(file = %path.display(), "reclaiming stale lock");
                remove_if_present(&path)?;
                create_lock(&path).map_err(|e| match e.kind() {
                    io::ErrorKind::AlreadyExists => Error::StateLocked(path.clone()),
                    _ => Error::Io(e),
                })
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Every directory below `root` (including `root`) holding a state file,
    /// sorted. Cluster directories are not searched further.
    pub fn discover(root: &Path) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            if dir.join(STATE_FILE).is_file() {
                found.push(dir);
                continue;
            }
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if dir == root => return Err(Error::Io(e)),
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                    continue;
                }
            };
            for entry in entries.flatten() {
                if entry.file_type().is_ok_and(|t| t.is_dir()) {
                    pending.push(entry.path());
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

/// Exclusive access to a cluster directory. Released on drop.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
    _file: File,
}

impl StateLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(error) = remove_if_present(&self.path) {
            warn!(file = %self.path.display(), error = %error, "failed to remove lock file");
        }
    }
}

fn create_lock(path: &Path) -> io::Result<StateLock> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(StateLock {
        path: path.to_path_buf(),
        _file: file,
    })
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn process_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}
