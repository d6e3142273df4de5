//! validate command - check and print the fleet configuration

use anyhow::{bail, Result};
use colored::Colorize;
use fleetwatch_core::FleetConfig;

pub fn execute(config: &FleetConfig) -> Result<()> {
    config.validate()?;
    if config.enabled_clusters().next().is_none() {
        bail!(fleetwatch_core::Error::NoEnabledClusters);
    }

    println!("{}", "Clusters".bold());
    for cluster in &config.clusters {
        let mut flags = Vec::new();
        if cluster.primary {
            flags.push("primary".cyan().to_string());
        }
        if !cluster.enabled {
            flags.push("disabled".dimmed().to_string());
        }
        println!(
            "  {:<20} context={:<16} namespace={:<12} {}",
            cluster.name,
            cluster.context,
            cluster.namespace.as_deref().unwrap_or("*"),
            flags.join(" ")
        );
    }

    println!("{}", "Cache".bold());
    println!(
        "  resync={}s initial_list_attempts={} initial_list_timeout={}s backoff={}..{}ms",
        config.cache.resync_period_secs,
        config.cache.initial_list_attempts,
        config.cache.initial_list_timeout_secs,
        config.cache.backoff_initial_ms,
        config.cache.backoff_max_ms
    );

    println!("{}", "Leader election".bold());
    println!(
        "  lease={} identity={} duration={}ms renew_deadline={}ms retry_period={}ms",
        config.leader.lease_name,
        config
            .leader
            .identity
            .as_deref()
            .unwrap_or("<generated>"),
        config.leader.lease_duration_ms,
        config.leader.renew_deadline_ms,
        config.leader.retry_period_ms
    );

    println!("{} configuration is valid", "✓".green());
    Ok(())
}
