//! Stop and kill commands.

use anyhow::{Context, Result};
use mlaunch_cluster::{Signal, kill_cluster, stop_cluster};

use super::Session;
use crate::style::{
    create_spinner, finish_error, finish_success, print_leftovers, print_success,
};

/// Stops every process gracefully, escalating to SIGKILL when needed.
pub async fn run(session: &Session) -> Result<()> {
    let collaborators = session.existing_collaborators()?;

    let sp = create_spinner("Stopping cluster...");
    let report = match stop_cluster(session.dir(), collaborators, session.policies()).await {
        Ok(report) => report,
        Err(e) => {
            finish_error(&sp, "Stop failed");
            return Err(e).context("Failed to stop cluster");
        }
    };

    if report.was_noop() {
        finish_success(&sp, "Nothing running");
    } else {
        finish_success(&sp, &format!("Stopped {} processes", report.signalled.len()));
    }
    print_leftovers(&report);
    Ok(())
}

/// Sends `signal` to every process.
pub async fn kill(session: &Session, signal: Signal) -> Result<()> {
    let collaborators = session.existing_collaborators()?;

    let sp = create_spinner(&format!("Sending {signal}..."));
    let report =
        match kill_cluster(session.dir(), signal, collaborators, session.policies()).await {
            Ok(report) => report,
            Err(e) => {
                finish_error(&sp, &format!("Failed to send {signal}"));
                return Err(e).with_context(|| format!("Failed to send {signal} to cluster"));
            }
        };

    if report.was_noop() {
        finish_success(&sp, "Nothing running");
    } else {
        finish_success(
            &sp,
            &format!("Sent {signal} to {} processes", report.signalled.len()),
        );
    }
    if signal.ends_process() {
        print_leftovers(&report);
    } else if !report.still_alive.is_empty() {
        print_success(&format!(
            "{} processes still running",
            report.still_alive.len()
        ));
    }
    Ok(())
}
