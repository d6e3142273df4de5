//! Cluster API client seam
//!
//! The pipeline never talks to a cluster directly. Everything it needs from
//! the cluster API (list, watch and a compare-and-swap lease primitive) goes
//! through `ClusterClient`; `ClientFactory` turns a `ClusterConfig` into a
//! connected client.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use fleetwatch_core::types::{CachedObject, ClusterConfig, LeaseRecord, ObjectKey};

use crate::error::ClusterResult;

/// Result of a full list
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<CachedObject>,
    /// Collection resource version to resume watching from
    pub resource_version: String,
}

/// Final state of a deleted object
#[derive(Debug, Clone)]
pub enum Tombstone {
    /// The delete carried the object's last state
    Final(CachedObject),
    /// The delete was inferred without the final state
    FinalStateUnknown {
        key: ObjectKey,
        last_known: Option<CachedObject>,
    },
}

impl Tombstone {
    pub fn key(&self) -> ObjectKey {
        match self {
            Tombstone::Final(obj) => obj.key(),
            Tombstone::FinalStateUnknown { key, .. } => key.clone(),
        }
    }
}

/// One notification of a watch stream
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(CachedObject),
    Modified(CachedObject),
    Deleted(Tombstone),
    /// Progress marker carrying only a resource version
    Bookmark(String),
}

impl WatchEvent {
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => Some(&obj.resource_version),
            WatchEvent::Deleted(Tombstone::Final(obj)) => Some(&obj.resource_version),
            WatchEvent::Deleted(Tombstone::FinalStateUnknown { last_known, .. }) => {
                last_known.as_ref().map(|o| o.resource_version.as_str())
            }
            WatchEvent::Bookmark(rv) => Some(rv),
        }
    }
}

/// Stream of watch notifications; it ends when the server closes the watch
pub type WatchStream = BoxStream<'static, ClusterResult<WatchEvent>>;

/// Access to one cluster's API
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List all objects, optionally restricted to one namespace
    async fn list(&self, namespace: Option<&str>) -> ClusterResult<ObjectList>;

    /// Watch for changes after `resource_version`
    async fn watch(&self, namespace: Option<&str>, resource_version: &str)
        -> ClusterResult<WatchStream>;

    /// Read the current lease record, if one exists
    async fn get_lease(&self, name: &str) -> ClusterResult<Option<LeaseRecord>>;

    /// Store `lease` if its resource version matches the stored one (0 creates).
    ///
    /// Returns the accepted record with its new resource version, or
    /// `ClusterError::LeaseConflict` when another writer got there first.
    async fn try_acquire_or_renew(&self, lease: LeaseRecord) -> ClusterResult<LeaseRecord>;
}

/// Builds clients from cluster configuration
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, cluster: &ClusterConfig) -> ClusterResult<Arc<dyn ClusterClient>>;
}
