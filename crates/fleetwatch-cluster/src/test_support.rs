//! Shared helpers for unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use fleetwatch_core::types::{ClusterConfig, LeaseRecord};

use crate::cache::{CacheEvent, CacheEventHandler, CacheSettings, ObjectCache};
use crate::client::{ClientFactory, ClusterClient, ObjectList, WatchStream};
use crate::error::{ClusterError, ClusterResult};
use crate::leader::LeaseTimings;
use crate::memory::InMemoryCluster;

/// Poll `condition` until it holds, panicking after two seconds
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within 2s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Start `cache` and wait until its watch stream is open, so events sent
/// only to live watchers are not missed
pub async fn start_watching(cache: &ObjectCache, cluster: &InMemoryCluster) {
    let watchers = cluster.watchers();
    cache.start(&CancellationToken::new()).await.unwrap();
    eventually(|| cluster.watchers() > watchers).await;
}

pub fn fast_cache_settings() -> CacheSettings {
    CacheSettings {
        resync_period: None,
        initial_list_attempts: 3,
        list_timeout: Duration::from_secs(1),
        backoff_initial: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
    }
}

pub fn fast_lease_timings() -> LeaseTimings {
    LeaseTimings {
        lease_name: fleetwatch_core::DEFAULT_LEASE_NAME.to_string(),
        lease_duration: Duration::from_millis(400),
        renew_deadline: Duration::from_millis(200),
        retry_period: Duration::from_millis(40),
    }
}

/// Cache subscriber that keeps every event
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<CacheEvent>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().clone()
    }
}

impl CacheEventHandler for Recorder {
    fn on_event(&self, event: &CacheEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Wraps an in-memory cluster; lease calls hang forever while stalled
pub struct StallingLeases {
    inner: Arc<InMemoryCluster>,
    stalled: AtomicBool,
}

impl StallingLeases {
    pub fn new(inner: Arc<InMemoryCluster>, stalled: bool) -> Arc<Self> {
        Arc::new(Self {
            inner,
            stalled: AtomicBool::new(stalled),
        })
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    async fn maybe_stall(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl ClusterClient for StallingLeases {
    async fn list(&self, namespace: Option<&str>) -> ClusterResult<ObjectList> {
        self.inner.list(namespace).await
    }

    async fn watch(&self, namespace: Option<&str>, resource_version: &str) -> ClusterResult<WatchStream> {
        self.inner.watch(namespace, resource_version).await
    }

    async fn get_lease(&self, name: &str) -> ClusterResult<Option<LeaseRecord>> {
        self.maybe_stall().await;
        self.inner.get_lease(name).await
    }

    async fn try_acquire_or_renew(&self, lease: LeaseRecord) -> ClusterResult<LeaseRecord> {
        self.maybe_stall().await;
        self.inner.try_acquire_or_renew(lease).await
    }
}

/// Factory serving fixed clients; connects to `held` wait until `release` fires
pub struct HeldFactory {
    clients: HashMap<String, Arc<dyn ClusterClient>>,
    held: Option<String>,
    pub release: CancellationToken,
    entered: AtomicU64,
}

impl HeldFactory {
    pub fn new(clients: Vec<(&str, Arc<dyn ClusterClient>)>, held: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            clients: clients
                .into_iter()
                .map(|(name, client)| (name.to_string(), client))
                .collect(),
            held: held.map(str::to_string),
            release: CancellationToken::new(),
            entered: AtomicU64::new(0),
        })
    }

    /// Connect calls started so far
    pub fn entered(&self) -> u64 {
        self.entered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for HeldFactory {
    async fn connect(&self, cluster: &ClusterConfig) -> ClusterResult<Arc<dyn ClusterClient>> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if self.held.as_deref() == Some(cluster.name.as_str()) {
            self.release.cancelled().await;
        }
        self.clients
            .get(&cluster.name)
            .cloned()
            .ok_or_else(|| ClusterError::Credentials {
                cluster: cluster.name.clone(),
                reason: "no test client".to_string(),
            })
    }
}
