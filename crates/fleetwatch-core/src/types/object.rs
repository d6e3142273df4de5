//! Cached object types
//!
//! A `CachedObject` is the subset of a Deployment-like resource that the
//! watch pipeline keeps in memory: identity, versioning metadata, labels,
//! the spec fields the change analyzer compares and a status summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::DEFAULT_REPLICAS;

/// Identity of a cached object within one cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Deployment rollout strategy type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StrategyKind {
    #[default]
    RollingUpdate,
    Recreate,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::RollingUpdate => write!(f, "RollingUpdate"),
            StrategyKind::Recreate => write!(f, "Recreate"),
        }
    }
}

/// Rollout strategy; an absent strategy means `RolloutStrategy::default()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    #[serde(rename = "type", default)]
    pub kind: StrategyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<String>,
}

impl RolloutStrategy {
    pub fn same_as(&self, other: &RolloutStrategy) -> bool {
        self.kind == other.kind
            && self.max_surge == other.max_surge
            && self.max_unavailable == other.max_unavailable
    }

    pub fn summary(&self) -> String {
        match (&self.max_surge, &self.max_unavailable) {
            (None, None) => self.kind.to_string(),
            (surge, unavailable) => format!(
                "{}(maxSurge={}, maxUnavailable={})",
                self.kind,
                surge.as_deref().unwrap_or("-"),
                unavailable.as_deref().unwrap_or("-")
            ),
        }
    }
}

/// Per-container resource requests and limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

impl ResourceRequirements {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }

    pub fn same_as(&self, other: &ResourceRequirements) -> bool {
        self.requests == other.requests && self.limits == other.limits
    }
}

/// Container template fields of interest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            resources: None,
        }
    }
}

/// Spec fields of interest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeploymentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RolloutStrategy>,
}

impl DeploymentSpec {
    /// Replica count, falling back to `DEFAULT_REPLICAS` when unset
    pub fn effective_replicas(&self) -> i32 {
        self.replicas.unwrap_or(DEFAULT_REPLICAS)
    }

    pub fn effective_strategy(&self) -> RolloutStrategy {
        self.strategy.clone().unwrap_or_default()
    }
}

/// Status fields of interest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
    #[serde(default)]
    pub available_replicas: i32,
}

/// In-memory copy of one observed object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedObject {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub spec: DeploymentSpec,
    #[serde(default)]
    pub status: DeploymentStatus,
    #[serde(default = "Utc::now")]
    pub creation_timestamp: DateTime<Utc>,
}

impl CachedObject {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            generation: 1,
            observed_generation: 0,
            resource_version: String::new(),
            labels: None,
            annotations: None,
            spec: DeploymentSpec::default(),
            status: DeploymentStatus::default(),
            creation_timestamp: Utc::now(),
        }
    }

    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.spec.replicas = Some(replicas);
        self
    }

    pub fn with_container(mut self, name: impl Into<String>, image: impl Into<String>) -> Self {
        self.spec.containers.push(ContainerSpec::new(name, image));
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Whether the controller has observed the latest spec generation
    pub fn is_rollout_observed(&self) -> bool {
        self.observed_generation >= self.generation
    }

    /// Order this object's resource version against another's
    pub fn compare_version(&self, other: &CachedObject) -> Option<Ordering> {
        compare_resource_versions(&self.resource_version, &other.resource_version)
    }
}

/// Compare two resource versions.
///
/// Numeric versions compare numerically and identical strings are equal.
/// Any other pair is incomparable and yields `None`.
pub fn compare_resource_versions(a: &str, b: &str) -> Option<Ordering> {
    if a == b {
        return Some(Ordering::Equal);
    }
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => Some(a.cmp(&b)),
        _ => None,
    }
}

/// Whether `candidate` is strictly newer than `current`; incomparable counts as newer
pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    !matches!(
        compare_resource_versions(candidate, current),
        Some(Ordering::Less | Ordering::Equal)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_display() {
        let key = ObjectKey::new("default", "web");
        assert_eq!(key.to_string(), "default/web");
    }

    #[test]
    fn test_resource_version_ordering() {
        assert_eq!(compare_resource_versions("9", "10"), Some(Ordering::Less));
        assert_eq!(compare_resource_versions("10", "10"), Some(Ordering::Equal));
        assert_eq!(compare_resource_versions("abc", "abc"), Some(Ordering::Equal));
        assert_eq!(compare_resource_versions("abc", "10"), None);

        assert!(is_newer_version("11", "10"));
        assert!(!is_newer_version("10", "10"));
        assert!(!is_newer_version("9", "10"));
        assert!(is_newer_version("opaque", "10"));
    }

    #[test]
    fn test_effective_defaults() {
        let obj = CachedObject::new("default", "web");
        assert_eq!(obj.spec.effective_replicas(), DEFAULT_REPLICAS);
        assert_eq!(obj.spec.effective_strategy().kind, StrategyKind::RollingUpdate);

        let obj = obj.with_replicas(0);
        assert_eq!(obj.spec.effective_replicas(), 0);
    }

    #[test]
    fn test_deserialize_from_fixture() {
        let json = r#"{
            "namespace": "default",
            "name": "web",
            "generation": 2,
            "resourceVersion": "7",
            "labels": {"app": "web"},
            "spec": {
                "replicas": 2,
                "containers": [{"name": "app", "image": "app:1.0"}],
                "strategy": {"type": "Recreate"}
            }
        }"#;
        let obj: CachedObject = serde_json::from_str(json).unwrap();
        assert_eq!(obj.key(), ObjectKey::new("default", "web"));
        assert_eq!(obj.spec.replicas, Some(2));
        assert_eq!(obj.spec.containers[0].image, "app:1.0");
        assert_eq!(obj.spec.effective_strategy().kind, StrategyKind::Recreate);
        assert_eq!(obj.observed_generation, 0);
        assert!(!obj.is_rollout_observed());
    }
}
