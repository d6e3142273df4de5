//! Change classification types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Classification of one observed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Object appeared
    Create,
    /// Spec generation changed
    Update,
    /// Object disappeared
    Delete,
    /// Same generation: status-only change or periodic replay
    Resync,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Resync => "resync",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Part of the object a change belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeCategory {
    Metadata,
    Spec,
    Status,
}

impl fmt::Display for ChangeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeCategory::Metadata => write!(f, "metadata"),
            ChangeCategory::Spec => write!(f, "spec"),
            ChangeCategory::Status => write!(f, "status"),
        }
    }
}

/// One field-level difference between two versions of an object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub category: ChangeCategory,
    /// Field path, e.g. `replicas` or `containers[0].image`
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
    pub description: String,
}

impl ChangeRecord {
    pub fn new(
        category: ChangeCategory,
        field: impl Into<String>,
        old_value: impl Into<Value>,
        new_value: impl Into<Value>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            category,
            field: field.into(),
            old_value: old_value.into(),
            new_value: new_value.into(),
            description: description.into(),
        }
    }
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.category, self.field, self.description)
    }
}
