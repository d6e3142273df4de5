//! Leader election lease types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lease object as stored by the cluster API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub name: String,
    /// Current holder; `None` when released
    pub holder_identity: Option<String>,
    pub lease_duration_ms: u64,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_transitions: u32,
    /// Optimistic concurrency token; 0 means "not yet stored"
    pub resource_version: u64,
}

impl LeaseRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            holder_identity: None,
            lease_duration_ms: 0,
            acquire_time: None,
            renew_time: None,
            lease_transitions: 0,
            resource_version: 0,
        }
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder_identity.as_deref() == Some(identity)
    }

    pub fn is_released(&self) -> bool {
        self.holder_identity.as_deref().map_or(true, str::is_empty)
    }
}

/// Leader election state machine role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeaderRole {
    #[default]
    Follower,
    Acquiring,
    Leader,
}

impl fmt::Display for LeaderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaderRole::Follower => write!(f, "follower"),
            LeaderRole::Acquiring => write!(f, "acquiring"),
            LeaderRole::Leader => write!(f, "leader"),
        }
    }
}

/// Leadership view of one replica for one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseState {
    pub cluster_name: String,
    pub holder_identity: String,
    pub lease_duration_ms: u64,
    pub renew_deadline_ms: u64,
    pub retry_period_ms: u64,
    /// Holder last observed in the lease record
    pub current_holder: Option<String>,
    pub role: LeaderRole,
    pub is_leader: bool,
}

impl LeaseState {
    pub fn new(
        cluster_name: impl Into<String>,
        holder_identity: impl Into<String>,
        lease_duration_ms: u64,
        renew_deadline_ms: u64,
        retry_period_ms: u64,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            holder_identity: holder_identity.into(),
            lease_duration_ms,
            renew_deadline_ms,
            retry_period_ms,
            current_holder: None,
            role: LeaderRole::Follower,
            is_leader: false,
        }
    }
}
