//! Pipeline metrics
//!
//! Emitted through the `metrics` facade; installing an exporter is left to
//! the embedding process.

use metrics::{counter, gauge};

use fleetwatch_core::types::EventKind;

/// Metric names
pub mod names {
    // Cache metrics
    pub const CACHE_EVENTS_APPLIED_TOTAL: &str = "fleetwatch_cache_events_applied_total";
    pub const CACHE_EVENTS_DROPPED_TOTAL: &str = "fleetwatch_cache_events_dropped_total";
    pub const CACHE_RELISTS_TOTAL: &str = "fleetwatch_cache_relists_total";
    pub const CACHE_OBJECTS: &str = "fleetwatch_cache_objects";

    // Change metrics
    pub const CHANGES_EMITTED_TOTAL: &str = "fleetwatch_changes_emitted_total";

    // Leadership metrics
    pub const LEADER: &str = "fleetwatch_leader";
    pub const LEADER_TRANSITIONS_TOTAL: &str = "fleetwatch_leader_transitions_total";

    // Fleet metrics
    pub const PIPELINE_RESTARTS_TOTAL: &str = "fleetwatch_pipeline_restarts_total";
}

pub fn record_applied(cluster: &str, event: &'static str) {
    counter!(names::CACHE_EVENTS_APPLIED_TOTAL, "cluster" => cluster.to_string(), "event" => event)
        .increment(1);
}

pub fn record_dropped(cluster: &str, reason: &'static str) {
    counter!(names::CACHE_EVENTS_DROPPED_TOTAL, "cluster" => cluster.to_string(), "reason" => reason)
        .increment(1);
}

pub fn record_relist(cluster: &str) {
    counter!(names::CACHE_RELISTS_TOTAL, "cluster" => cluster.to_string()).increment(1);
}

pub fn set_object_count(cluster: &str, count: usize) {
    gauge!(names::CACHE_OBJECTS, "cluster" => cluster.to_string()).set(count as f64);
}

pub fn record_change(cluster: &str, kind: EventKind) {
    counter!(names::CHANGES_EMITTED_TOTAL, "cluster" => cluster.to_string(), "kind" => kind.as_str())
        .increment(1);
}

pub fn set_leader(cluster: &str, leader: bool) {
    gauge!(names::LEADER, "cluster" => cluster.to_string()).set(if leader { 1.0 } else { 0.0 });
    counter!(names::LEADER_TRANSITIONS_TOTAL, "cluster" => cluster.to_string()).increment(1);
}

pub fn record_restart(cluster: &str) {
    counter!(names::PIPELINE_RESTARTS_TOTAL, "cluster" => cluster.to_string()).increment(1);
}
