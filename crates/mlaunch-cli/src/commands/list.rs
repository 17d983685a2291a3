//! List command - shows recorded processes and their liveness.

use anyhow::{Context, Result};
use mlaunch_cluster::{ClusterReport, Collaborators, list_cluster, list_clusters};

use super::Session;
use crate::style::{colors::SemanticStyle, print_cluster, print_error};

pub fn run(session: &Session, all: bool, json: bool) -> Result<()> {
    // Liveness checks never talk to the servers, so TLS settings are irrelevant.
    let collaborators = || Collaborators::local(&session.config.client.shell, None);

    if !all {
        let report = list_cluster(session.dir(), collaborators()).with_context(|| {
            format!(
                "No cluster found in {}. Run: mlaunch init",
                session.dir().display()
            )
        })?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_cluster(&report);
        }
        return Ok(());
    }

    let clusters = list_clusters(session.dir(), collaborators())
        .with_context(|| format!("Failed to scan {}", session.dir().display()))?;

    if json {
        let reports: Vec<&ClusterReport> =
            clusters.iter().filter_map(|(_, r)| r.as_ref().ok()).collect();
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    if clusters.is_empty() {
        println!(
            "{}",
            format!("No clusters found below {}", session.dir().display()).muted()
        );
        return Ok(());
    }

    for (dir, report) in &clusters {
        match report {
            Ok(report) => print_cluster(report),
            Err(e) => print_error(&format!("{}: {e}", dir.display())),
        }
    }
    Ok(())
}
