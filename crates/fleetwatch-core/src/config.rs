//! Configuration for Fleetwatch

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::types::ClusterConfig;
use crate::utils::is_valid_cluster_name;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FleetConfig {
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub leader: LeaderConfig,

    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FleetConfig {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::ConfigParse(e.to_string()))
    }

    /// Overlay `FLEETWATCH_*` environment variables on top of `self`
    pub fn apply_env(mut self) -> Self {
        if let Ok(level) = std::env::var("FLEETWATCH_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("FLEETWATCH_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(identity) = std::env::var("FLEETWATCH_IDENTITY") {
            self.leader.identity = Some(identity);
        }
        if let Ok(name) = std::env::var("FLEETWATCH_LEASE_NAME") {
            self.leader.lease_name = name;
        }
        if let Ok(secs) = std::env::var("FLEETWATCH_RESYNC_PERIOD_SECS") {
            if let Ok(s) = secs.parse() {
                self.cache.resync_period_secs = s;
            }
        }
        if let Ok(secs) = std::env::var("FLEETWATCH_SHUTDOWN_TIMEOUT_SECS") {
            if let Ok(s) = secs.parse() {
                self.manager.shutdown_timeout_secs = s;
            }
        }
        self
    }

    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    pub fn validate(&self) -> crate::Result<()> {
        validate_clusters(&self.clusters)?;
        self.cache.validate()?;
        self.leader.validate()?;
        Ok(())
    }

    pub fn enabled_clusters(&self) -> impl Iterator<Item = &ClusterConfig> {
        self.clusters.iter().filter(|c| c.enabled)
    }
}

/// Check names are valid and unique and that at most one cluster is primary
pub fn validate_clusters(clusters: &[ClusterConfig]) -> crate::Result<()> {
    let mut seen = HashSet::new();
    let mut primary: Option<&str> = None;

    for cluster in clusters {
        if !is_valid_cluster_name(&cluster.name) {
            return Err(crate::Error::InvalidClusterName(cluster.name.clone()));
        }
        if !seen.insert(cluster.name.as_str()) {
            return Err(crate::Error::DuplicateCluster(cluster.name.clone()));
        }
        if cluster.primary {
            if let Some(first) = primary {
                return Err(crate::Error::MultiplePrimaries {
                    first: first.to_string(),
                    second: cluster.name.clone(),
                });
            }
            primary = Some(&cluster.name);
        }
    }
    Ok(())
}

/// Object cache tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Interval between resync replays; 0 disables resync
    pub resync_period_secs: u64,
    /// Attempts for the initial list before startup fails
    pub initial_list_attempts: u32,
    /// Timeout of each initial list attempt
    pub initial_list_timeout_secs: u64,
    /// First relist backoff delay
    pub backoff_initial_ms: u64,
    /// Relist backoff cap
    pub backoff_max_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            resync_period_secs: 30,
            initial_list_attempts: 3,
            initial_list_timeout_secs: 10,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

impl CacheConfig {
    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_period_secs > 0).then(|| Duration::from_secs(self.resync_period_secs))
    }

    pub fn initial_list_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_list_timeout_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.initial_list_attempts == 0 {
            return Err(crate::Error::InvalidArgument(
                "initial_list_attempts must be at least 1".into(),
            ));
        }
        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_max_ms {
            return Err(crate::Error::InvalidArgument(format!(
                "backoff must satisfy 0 < initial ({}ms) <= max ({}ms)",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }
}

/// Leader election tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderConfig {
    /// Name of the lease object in each cluster
    pub lease_name: String,
    /// Holder identity; generated from hostname when unset
    pub identity: Option<String>,
    pub lease_duration_ms: u64,
    pub renew_deadline_ms: u64,
    pub retry_period_ms: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease_name: crate::DEFAULT_LEASE_NAME.to_string(),
            identity: None,
            lease_duration_ms: 60_000,
            renew_deadline_ms: 15_000,
            retry_period_ms: 5_000,
        }
    }
}

impl LeaderConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn renew_deadline(&self) -> Duration {
        Duration::from_millis(self.renew_deadline_ms)
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.retry_period_ms)
    }

    pub fn resolve_identity(&self) -> String {
        self.identity
            .clone()
            .unwrap_or_else(crate::utils::generate_identity)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.lease_name.is_empty() {
            return Err(crate::Error::InvalidArgument(
                "lease_name must not be empty".into(),
            ));
        }
        if self.retry_period_ms == 0
            || self.retry_period_ms >= self.renew_deadline_ms
            || self.renew_deadline_ms >= self.lease_duration_ms
        {
            return Err(crate::Error::InvalidLeaseTimings(format!(
                "expected 0 < retry_period ({}ms) < renew_deadline ({}ms) < lease_duration ({}ms)",
                self.retry_period_ms, self.renew_deadline_ms, self.lease_duration_ms
            )));
        }
        Ok(())
    }
}

/// Fleet manager tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Upper bound on graceful shutdown of all pipelines
    pub shutdown_timeout_secs: u64,
    /// Capacity of the change event broadcast channels
    pub change_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: 30,
            change_buffer: 1024,
        }
    }
}

impl ManagerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
