//! Change analysis
//!
//! Classifies cache events and, for spec updates, derives an ordered list of
//! field-level `ChangeRecord`s. Record order is fixed: replicas, container
//! images, labels, annotations, strategy, container resources.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use fleetwatch_core::types::{
    CachedObject, ChangeCategory, ChangeRecord, ContainerSpec, EventKind, ResourceRequirements,
};

use crate::cache::CacheEvent;

/// Classification of one cache event plus its field changes
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub kind: EventKind,
    /// Non-empty only for `EventKind::Update`
    pub changes: Vec<ChangeRecord>,
}

/// Stateless event classifier and differ
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeAnalyzer;

impl ChangeAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Classify a transition by generation.
    ///
    /// Same generation on both sides means only status or metadata moved.
    pub fn classify(&self, old: Option<&CachedObject>, new: Option<&CachedObject>) -> EventKind {
        match (old, new) {
            (None, Some(_)) => EventKind::Create,
            (Some(_), None) => EventKind::Delete,
            (None, None) => EventKind::Resync,
            (Some(old), Some(new)) if old.generation == new.generation => EventKind::Resync,
            (Some(_), Some(_)) => EventKind::Update,
        }
    }

    /// Spec and metadata differences between two versions of an object
    pub fn diff(&self, old: &CachedObject, new: &CachedObject) -> Vec<ChangeRecord> {
        let mut changes = Vec::new();

        let (old_replicas, new_replicas) = (
            old.spec.effective_replicas(),
            new.spec.effective_replicas(),
        );
        if old_replicas != new_replicas {
            changes.push(ChangeRecord::new(
                ChangeCategory::Spec,
                "replicas",
                old_replicas,
                new_replicas,
                format!("Replicas changed from {} to {}", old_replicas, new_replicas),
            ));
        }

        // Containers are compared by position up to the shorter list
        let paired = || old.spec.containers.iter().zip(new.spec.containers.iter()).enumerate();

        for (index, (before, after)) in paired() {
            if before.image != after.image {
                changes.push(ChangeRecord::new(
                    ChangeCategory::Spec,
                    format!("containers[{}].image", index),
                    before.image.as_str(),
                    after.image.as_str(),
                    format!(
                        "Container '{}' image changed from {} to {}",
                        after.name, before.image, after.image
                    ),
                ));
            }
        }

        if let Some(record) = map_change("labels", "Labels changed", &old.labels, &new.labels) {
            changes.push(record);
        }
        if let Some(record) = map_change(
            "annotations",
            "Annotations changed",
            &old.annotations,
            &new.annotations,
        ) {
            changes.push(record);
        }

        let (old_strategy, new_strategy) = (
            old.spec.effective_strategy(),
            new.spec.effective_strategy(),
        );
        if !old_strategy.same_as(&new_strategy) {
            let (before, after) = (old_strategy.summary(), new_strategy.summary());
            changes.push(ChangeRecord::new(
                ChangeCategory::Spec,
                "strategy",
                before.as_str(),
                after.as_str(),
                format!("Strategy changed from {} to {}", before, after),
            ));
        }

        for (index, (before, after)) in paired() {
            let (old_resources, new_resources) = (resources_of(before), resources_of(after));
            if !old_resources.same_as(&new_resources) {
                changes.push(ChangeRecord::new(
                    ChangeCategory::Spec,
                    format!("containers[{}].resources", index),
                    resources_value(&old_resources),
                    resources_value(&new_resources),
                    format!("Container '{}' resources changed", after.name),
                ));
            }
        }

        changes
    }

    /// Status differences, reported for status-only syncs
    pub fn status_changes(&self, old: &CachedObject, new: &CachedObject) -> Vec<ChangeRecord> {
        let fields = [
            ("status.replicas", "Replicas", old.status.replicas, new.status.replicas),
            (
                "status.readyReplicas",
                "Ready replicas",
                old.status.ready_replicas,
                new.status.ready_replicas,
            ),
            (
                "status.updatedReplicas",
                "Updated replicas",
                old.status.updated_replicas,
                new.status.updated_replicas,
            ),
            (
                "status.availableReplicas",
                "Available replicas",
                old.status.available_replicas,
                new.status.available_replicas,
            ),
        ];

        let mut changes: Vec<ChangeRecord> = fields
            .into_iter()
            .filter(|(_, _, before, after)| before != after)
            .map(|(field, label, before, after)| {
                ChangeRecord::new(
                    ChangeCategory::Status,
                    field,
                    before,
                    after,
                    format!("{} changed from {} to {}", label, before, after),
                )
            })
            .collect();

        if old.observed_generation != new.observed_generation {
            changes.push(ChangeRecord::new(
                ChangeCategory::Status,
                "status.observedGeneration",
                old.observed_generation,
                new.observed_generation,
                format!(
                    "Observed generation changed from {} to {}",
                    old.observed_generation, new.observed_generation
                ),
            ));
        }
        changes
    }

    /// Classify a cache event and diff it when it is a spec update
    pub fn analyze(&self, event: &CacheEvent) -> Analysis {
        match event {
            CacheEvent::Added { object, .. } => Analysis {
                kind: self.classify(None, Some(object.as_ref())),
                changes: Vec::new(),
            },
            CacheEvent::Deleted { object } => Analysis {
                kind: self.classify(Some(object.as_ref()), None),
                changes: Vec::new(),
            },
            CacheEvent::Updated { resync: true, .. } => Analysis {
                kind: EventKind::Resync,
                changes: Vec::new(),
            },
            CacheEvent::Updated { old, new, .. } => {
                let kind = self.classify(Some(old.as_ref()), Some(new.as_ref()));
                let changes = match kind {
                    EventKind::Update => self.diff(old, new),
                    _ => Vec::new(),
                };
                Analysis { kind, changes }
            }
        }
    }
}

/// Coarse record for a string map; absent and empty maps are equal
fn map_change(
    field: &str,
    description: &str,
    old: &Option<BTreeMap<String, String>>,
    new: &Option<BTreeMap<String, String>>,
) -> Option<ChangeRecord> {
    let empty = BTreeMap::new();
    let before = old.as_ref().unwrap_or(&empty);
    let after = new.as_ref().unwrap_or(&empty);
    if before == after {
        return None;
    }
    Some(ChangeRecord::new(
        ChangeCategory::Metadata,
        field,
        map_value(before),
        map_value(after),
        description,
    ))
}

fn map_value(map: &BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<Map<String, Value>>(),
    )
}

fn resources_of(container: &ContainerSpec) -> ResourceRequirements {
    container.resources.clone().unwrap_or_default()
}

fn resources_value(resources: &ResourceRequirements) -> Value {
    json!({
        "requests": map_value(&resources.requests),
        "limits": map_value(&resources.limits),
    })
}
