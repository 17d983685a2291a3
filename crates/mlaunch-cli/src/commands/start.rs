//! Start command - relaunches the stopped processes of a cluster.

use anyhow::{Context, Result};
use mlaunch_cluster::start_cluster;

use super::Session;
use crate::style::{
    colors::SemanticStyle, create_spinner, finish_error, finish_success, print_launch_summary,
    print_spacer,
};

pub async fn run(session: &Session) -> Result<()> {
    let collaborators = session.existing_collaborators()?;

    print_spacer();
    println!(
        "Starting cluster in {}...",
        session.dir().display().to_string().code()
    );
    print_spacer();

    let sp = create_spinner("Starting stopped processes...");
    let report = match start_cluster(session.dir(), collaborators, session.policies()).await {
        Ok(report) => {
            let message = if report.spawned.is_empty() {
                "All processes already running".to_string()
            } else {
                format!("Started {}", report.spawned.join(", "))
            };
            finish_success(&sp, &message);
            report
        }
        Err(e) => {
            finish_error(&sp, "Start failed");
            return Err(e).context("Failed to start cluster");
        }
    };

    print_launch_summary(&report);
    Ok(())
}
