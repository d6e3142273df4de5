//! Cluster fleet types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One administered cluster in the fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Unique cluster name
    pub name: String,
    /// API endpoint reference handed to the client factory
    #[serde(default)]
    pub api_endpoint: String,
    /// Credential context reference handed to the client factory
    #[serde(default)]
    pub context: String,
    /// Restrict list/watch to one namespace; `None` watches all namespaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub primary: bool,
}

fn default_enabled() -> bool {
    true
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            api_endpoint: String::new(),
            context: name.clone(),
            name,
            namespace: None,
            enabled: true,
            primary: false,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// Lifecycle phase of one cluster pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelinePhase {
    /// Registered but not started yet
    #[default]
    Pending,
    /// Initial list in progress
    Starting,
    /// Cache synced and watching
    Running,
    /// Startup failed; a restart is scheduled
    Failed,
    /// Stopped
    Stopped,
}

/// Point-in-time health of one cluster pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub name: String,
    pub phase: PipelinePhase,
    pub cache_synced: bool,
    pub is_leader: bool,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// Number of startup attempts after the first
    pub restarts: u32,
}

impl ClusterStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: PipelinePhase::Pending,
            cache_synced: false,
            is_leader: false,
            last_error: None,
            started_at: None,
            restarts: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.phase == PipelinePhase::Running && self.cache_synced && self.last_error.is_none()
    }
}
