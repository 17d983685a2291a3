//! Integration tests for CLI commands.
//!
//! Launching needs real server binaries, so these tests stick to dry runs,
//! validation failures and commands against directories with no cluster.

#![allow(deprecated)] // Command::cargo_bin is deprecated but replacement requires newer assert_cmd

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// An `mlaunch` invocation isolated from the user's configuration.
fn mlaunch(temp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("mlaunch").unwrap();
    cmd.env("HOME", temp.path())
        .env("XDG_CONFIG_HOME", temp.path().join("xdg"))
        .env("NO_COLOR", "1")
        .env_remove("MLAUNCH_LAUNCH__BASE_PORT")
        .arg("--dir")
        .arg(temp.path().join("cluster"));
    cmd
}

// ============================================================================
// Dry Runs
// ============================================================================

#[test]
fn dry_run_single_prints_one_process() {
    let temp = TempDir::new().unwrap();

    mlaunch(&temp)
        .args(["init", "--single", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 processes"))
        .stdout(predicate::str::contains("--port 27017"))
        .stdout(predicate::str::contains("--fork"))
        .stdout(predicate::str::contains("--replSet").not());

    assert!(!temp.path().join("cluster").join(".mlaunch_startup").exists());
}

#[test]
fn dry_run_sharded_puts_router_on_base_port() {
    let temp = TempDir::new().unwrap();

    mlaunch(&temp)
        .args(["init", "--sharded", "2", "--single", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("4 processes"))
        .stdout(predicate::str::contains("mongos-27017:"))
        .stdout(predicate::str::contains("--configsvr"));
}

#[test]
fn dry_run_csrs_prints_every_process() {
    let temp = TempDir::new().unwrap();

    mlaunch(&temp)
        .args([
            "init",
            "--sharded",
            "2",
            "--replicaset",
            "--config",
            "3",
            "--csrs",
            "--dry-run",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("10 processes"))
        .stdout(predicate::str::contains("--replSet shard01"))
        .stdout(predicate::str::contains("--replSet shard02"))
        .stdout(predicate::str::contains("--replSet configRepl"));
}

// ============================================================================
// Configuration Layering
// ============================================================================

#[test]
fn env_overrides_base_port() {
    let temp = TempDir::new().unwrap();

    mlaunch(&temp)
        .env("MLAUNCH_LAUNCH__BASE_PORT", "30000")
        .args(["init", "--single", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--port 30000"));
}

#[test]
fn project_config_sets_defaults_and_flags_win() {
    let temp = TempDir::new().unwrap();
    let cluster = temp.path().join("cluster");
    fs::create_dir_all(&cluster).unwrap();
    fs::write(
        cluster.join("mlaunch.toml"),
        "[launch]\nbase_port = 31000\nbinary_path = \"/opt/mongodb/bin\"\n",
    )
    .unwrap();

    mlaunch(&temp)
        .args(["init", "--single", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/opt/mongodb/bin/mongod"))
        .stdout(predicate::str::contains("--port 31000"));

    mlaunch(&temp)
        .args(["init", "--single", "--port", "32000", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--port 32000"));
}

#[test]
fn invalid_project_config_fails() {
    let temp = TempDir::new().unwrap();
    let cluster = temp.path().join("cluster");
    fs::create_dir_all(&cluster).unwrap();
    fs::write(cluster.join("mlaunch.toml"), "[timeouts]\nreadiness_attempts = 0\n").unwrap();

    mlaunch(&temp)
        .args(["init", "--single", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}

// ============================================================================
// Topology Validation
// ============================================================================

#[test]
fn init_requires_a_topology() {
    let temp = TempDir::new().unwrap();

    mlaunch(&temp)
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid cluster topology"));
}

#[test]
fn cache_size_requires_wired_tiger() {
    let temp = TempDir::new().unwrap();

    mlaunch(&temp)
        .args([
            "init",
            "--single",
            "--storageEngine",
            "inMemory",
            "--wiredTigerCacheSizeGB",
            "2",
            "--dry-run",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid cluster topology"));
}

#[test]
fn missing_ssl_file_fails_before_launch() {
    let temp = TempDir::new().unwrap();

    mlaunch(&temp)
        .args([
            "init",
            "--single",
            "--sslMode",
            "requireSSL",
            "--sslPEMKeyFile",
            "/nonexistent/server.pem",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));

    assert!(!temp.path().join("cluster").join(".mlaunch_startup").exists());
}

// ============================================================================
// Commands Against Missing Clusters
// ============================================================================

#[test]
fn stop_without_cluster_fails() {
    let temp = TempDir::new().unwrap();

    mlaunch(&temp)
        .arg("stop")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No cluster found"));
}

#[test]
fn start_without_cluster_fails() {
    let temp = TempDir::new().unwrap();

    mlaunch(&temp)
        .arg("start")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No cluster found"));
}

#[test]
fn kill_without_cluster_fails() {
    let temp = TempDir::new().unwrap();

    mlaunch(&temp)
        .args(["kill", "SIGTERM"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No cluster found"));
}

#[test]
fn list_without_cluster_fails() {
    let temp = TempDir::new().unwrap();

    mlaunch(&temp)
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No cluster found"));
}

#[test]
fn list_all_on_empty_root() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("cluster")).unwrap();

    mlaunch(&temp)
        .args(["list", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No clusters found"));
}

#[test]
fn list_all_json_on_empty_root() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("cluster")).unwrap();

    mlaunch(&temp)
        .args(["list", "--all", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}
