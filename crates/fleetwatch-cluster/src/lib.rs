//! Fleetwatch Cluster - Multi-cluster watch, change analysis and leadership
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    MultiClusterManager                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌───────────────────────┐   ┌───────────────────────┐      │
//! │  │ ClusterPipeline (prod)│   │ ClusterPipeline (dr)  │ ...  │
//! │  │                       │   │                       │      │
//! │  │  ObjectCache          │   │  ObjectCache          │      │
//! │  │   - list/watch/resync │   │   - list/watch/resync │      │
//! │  │  LeadershipGate       │   │  LeadershipGate       │      │
//! │  │   - lease renewal     │   │   - lease renewal     │      │
//! │  │  ChangeAnalyzer       │   │  ChangeAnalyzer       │      │
//! │  │   - classify + diff   │   │   - classify + diff   │      │
//! │  └───────────┬───────────┘   └───────────┬───────────┘      │
//! │              │                           │                  │
//! │              └─────────────┬─────────────┘                  │
//! │                            │                                │
//! │                 ┌──────────┴──────────┐                     │
//! │                 │   ClusterRegistry   │                     │
//! │                 │  (ClusterClient per │                     │
//! │                 │      cluster)       │                     │
//! │                 └─────────────────────┘                     │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Consistent caches**: list + watch with relist on stream loss and
//!   periodic resync
//! - **Ordered diffs**: field-level change records in a fixed order
//! - **Leader gating**: only the lease holder forwards changes to sinks
//! - **Fleet isolation**: one unreachable cluster never stops the others
//! - **Graceful shutdown**: leases are released before caches stop

pub mod analyzer;
pub mod cache;
pub mod client;
mod error;
pub mod leader;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod registry;
mod retry;

#[cfg(test)]
mod test_support;

pub use analyzer::{Analysis, ChangeAnalyzer};
pub use cache::{CacheEvent, CacheEventHandler, CacheSettings, ObjectCache};
pub use client::{ClientFactory, ClusterClient, ObjectList, Tombstone, WatchEvent, WatchStream};
pub use error::{ClusterError, ClusterResult};
pub use leader::{LeaseTimings, LeadershipGate};
pub use manager::{ManagerSettings, MultiClusterManager};
pub use memory::{InMemoryCluster, InMemoryFactory};
pub use pipeline::{ChangeEvent, ChangeSink, ClusterPipeline, LoggingSink, PipelineSettings};
pub use registry::ClusterRegistry;

// Re-export types from core
pub use fleetwatch_core::types::{
    CachedObject, ChangeCategory, ChangeRecord, ClusterConfig, ClusterStatus, EventKind,
    LeaderRole, LeaseRecord, LeaseState, ObjectKey, PipelinePhase,
};
