//! CLI command implementations

pub mod simulate;
pub mod validate;

use std::collections::BTreeMap;

use colored::Colorize;
use fleetwatch_core::types::{ClusterStatus, PipelinePhase};

/// Print one row per cluster
pub fn print_status(statuses: &BTreeMap<String, ClusterStatus>) {
    println!(
        "{:<20} {:<10} {:<8} {:<8} {:<9} {}",
        "CLUSTER".bold(),
        "PHASE".bold(),
        "SYNCED".bold(),
        "LEADER".bold(),
        "RESTARTS".bold(),
        "LAST ERROR".bold()
    );

    for status in statuses.values() {
        let phase = format!("{:?}", status.phase).to_lowercase();
        let phase = match status.phase {
            PipelinePhase::Running => phase.green(),
            PipelinePhase::Failed => phase.red(),
            PipelinePhase::Stopped => phase.dimmed(),
            _ => phase.yellow(),
        };
        println!(
            "{:<20} {:<10} {:<8} {:<8} {:<9} {}",
            status.name,
            phase,
            yes_no(status.cache_synced),
            yes_no(status.is_leader),
            status.restarts,
            status.last_error.as_deref().unwrap_or("-")
        );
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
