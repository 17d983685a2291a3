//! Messages and cluster summaries printed by the commands.

use std::fmt::Display;
use std::path::Path;

use mlaunch_cluster::{
    ClusterPlan, ClusterReport, ConfigureOutcome, LaunchReport, ProcessReport, ShutdownReport,
};

use super::colors::{SemanticStyle, Tone};
use super::table::print_process_table;

pub fn print_success(msg: &str) {
    println!("{} {msg}", "✓".success());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {msg}", "✗".error());
}

pub fn print_warn(msg: &str) {
    println!("{} {msg}", "⚠".warning());
}

/// Prints an indented `key: value` line.
pub fn print_labeled(key: &str, value: impl Display) {
    println!("  {}: {value}", key.muted());
}

pub fn print_spacer() {
    println!();
}

/// `host:port` as it appears in connection strings.
pub fn endpoint(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// How a process is shown, combining the OS view with the recorded status.
pub fn health(process: &ProcessReport) -> (&'static str, Tone) {
    match (process.alive, process.drifted()) {
        (true, false) => ("running", Tone::Success),
        (false, false) => ("stopped", Tone::Muted),
        (true, true) => ("running (recorded stopped)", Tone::Warning),
        (false, true) => ("dead", Tone::Error),
    }
}

fn replica_set_label(name: &str, outcome: &ConfigureOutcome) -> String {
    let outcome = match outcome {
        ConfigureOutcome::Initiated => "initiated",
        ConfigureOutcome::AlreadyConverged => "already configured",
    };
    format!("{name} ({outcome})")
}

/// Prints every planned process with its command line.
pub fn print_plan(plan: &ClusterPlan) {
    let summary = format!("{} cluster, {} processes", plan.kind, plan.process_count());
    println!("{}", summary.header());
    print_spacer();
    for node in plan.nodes() {
        println!(
            "{} {}",
            format!("{}:", node.id).muted(),
            node.command.to_string().code()
        );
    }
}

/// Prints what a launch or start did.
pub fn print_launch_summary(report: &LaunchReport) {
    print_spacer();
    print_process_table(&report.processes);
    print_spacer();

    for (name, outcome) in &report.replica_sets {
        print_labeled("Replica set", replica_set_label(name, outcome));
    }
    for shard in &report.shards {
        print_labeled("Shard", shard);
    }
    print_success(&format!(
        "{} cluster ready in {}",
        report.kind,
        report.dir.display()
    ));
}

/// Points at the commands that manage a freshly launched cluster.
pub fn print_next_steps(dir: &Path) {
    print_spacer();
    println!("{} {}", "→".muted(), "Inspect or stop the cluster with:".muted());
    for command in ["list", "stop"] {
        println!("  {}", format!("mlaunch {command} --dir {}", dir.display()).code());
    }
}

/// Prints one recorded cluster as `list` shows it.
pub fn print_cluster(report: &ClusterReport) {
    print_spacer();
    println!("{}", report.dir.display().to_string().header());
    print_labeled("Topology", report.kind);
    print_labeled("State", &report.state);
    print_labeled("Created", report.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    print_labeled(
        "Alive",
        format!("{}/{}", report.alive_count(), report.processes.len()),
    );
    print_spacer();
    print_process_table(&report.processes);

    let drifted = report.drifted();
    if !drifted.is_empty() {
        let ids: Vec<&str> = drifted.iter().map(|p| p.id.as_str()).collect();
        print_warn(&format!(
            "Recorded status differs from the OS for: {}",
            ids.join(", ")
        ));
    }
}

/// Warns about processes a stop or kill left running.
pub fn print_leftovers(report: &ShutdownReport) {
    if !report.still_alive.is_empty() {
        print_warn(&format!(
            "Still alive: {}",
            report.still_alive.join(", ").warning()
        ));
    }
}
