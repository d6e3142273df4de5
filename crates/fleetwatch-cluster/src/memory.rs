//! In-memory cluster backend
//!
//! Simulates the parts of a cluster API the pipeline consumes: a versioned
//! object collection with list and watch, watch history compaction, and a
//! compare-and-swap lease store. Reachability can be toggled and watch
//! streams can be cut to exercise relist and failover paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fleetwatch_core::types::{CachedObject, ClusterConfig, DeploymentStatus, LeaseRecord, ObjectKey};

use crate::client::{ClientFactory, ClusterClient, ObjectList, Tombstone, WatchEvent, WatchStream};
use crate::error::{ClusterError, ClusterResult};

const DEFAULT_HISTORY_LIMIT: usize = 1_000;
const WATCH_CHANNEL_CAPACITY: usize = 1_024;

struct BackendState {
    objects: BTreeMap<ObjectKey, CachedObject>,
    revision: u64,
    history: VecDeque<(u64, WatchEvent)>,
    history_limit: usize,
    /// Watches must start after this revision
    compacted: u64,
    leases: HashMap<String, LeaseRecord>,
    lease_revision: u64,
    disconnect: CancellationToken,
}

/// A simulated cluster
pub struct InMemoryCluster {
    name: String,
    state: Mutex<BackendState>,
    events: broadcast::Sender<(u64, WatchEvent)>,
    reachable: AtomicBool,
    lease_failures: AtomicBool,
    list_calls: AtomicU64,
    watch_calls: AtomicU64,
}

impl InMemoryCluster {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(BackendState {
                objects: BTreeMap::new(),
                revision: 0,
                history: VecDeque::new(),
                history_limit: DEFAULT_HISTORY_LIMIT,
                compacted: 0,
                leases: HashMap::new(),
                lease_revision: 0,
                disconnect: CancellationToken::new(),
            }),
            events,
            reachable: AtomicBool::new(true),
            lease_failures: AtomicBool::new(false),
            list_calls: AtomicU64::new(0),
            watch_calls: AtomicU64::new(0),
        })
    }

    /// A cluster that refuses every call
    pub fn unreachable(name: impl Into<String>) -> Arc<Self> {
        let cluster = Self::new(name);
        cluster.set_reachable(false);
        cluster
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create or replace an object the way an API server would.
    ///
    /// Assigns a fresh resource version, keeps the creation timestamp of an
    /// existing object and bumps the generation only when the spec changed.
    pub fn apply(&self, mut object: CachedObject) -> CachedObject {
        let mut state = self.state.lock();
        state.revision += 1;
        object.resource_version = state.revision.to_string();

        let key = object.key();
        let event = match state.objects.get(&key) {
            Some(existing) => {
                object.creation_timestamp = existing.creation_timestamp;
                object.generation = if existing.spec != object.spec {
                    existing.generation + 1
                } else {
                    existing.generation
                };
                WatchEvent::Modified(object.clone())
            }
            None => {
                object.generation = object.generation.max(1);
                WatchEvent::Added(object.clone())
            }
        };

        state.objects.insert(key, object.clone());
        self.publish(&mut state, event);
        object
    }

    /// Update status fields and mark the current generation observed
    pub fn set_status(&self, namespace: &str, name: &str, status: DeploymentStatus) -> bool {
        let mut state = self.state.lock();
        let key = ObjectKey::new(namespace, name);
        if !state.objects.contains_key(&key) {
            return false;
        }
        state.revision += 1;
        let revision = state.revision;
        let updated = match state.objects.get_mut(&key) {
            Some(object) => {
                object.status = status;
                object.observed_generation = object.generation;
                object.resource_version = revision.to_string();
                object.clone()
            }
            None => return false,
        };
        self.publish(&mut state, WatchEvent::Modified(updated));
        true
    }

    /// Delete an object and notify watchers
    pub fn delete(&self, namespace: &str, name: &str) -> bool {
        let mut state = self.state.lock();
        let Some(mut object) = state.objects.remove(&ObjectKey::new(namespace, name)) else {
            return false;
        };
        state.revision += 1;
        object.resource_version = state.revision.to_string();
        self.publish(&mut state, WatchEvent::Deleted(Tombstone::Final(object)));
        true
    }

    /// Delete an object without telling watchers, as if the event was lost
    pub fn delete_silently(&self, namespace: &str, name: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.objects.remove(&ObjectKey::new(namespace, name)).is_some();
        if removed {
            state.revision += 1;
        }
        removed
    }

    /// Deliver a raw event to current watchers without touching the store
    pub fn inject_event(&self, event: WatchEvent) {
        let state = self.state.lock();
        let _ = self.events.send((state.revision, event));
    }

    /// Drop all watch history; watches from older versions get `Expired`
    pub fn compact(&self) {
        let mut state = self.state.lock();
        state.compacted = state.revision;
        state.history.clear();
    }

    /// Close every open watch stream
    pub fn disconnect_watchers(&self) {
        let mut state = self.state.lock();
        state.disconnect.cancel();
        state.disconnect = CancellationToken::new();
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.disconnect_watchers();
        }
    }

    /// Make lease calls fail while list and watch keep working
    pub fn set_lease_failures(&self, failing: bool) {
        self.lease_failures.store(failing, Ordering::SeqCst);
    }

    pub fn lease(&self, name: &str) -> Option<LeaseRecord> {
        self.state.lock().leases.get(name).cloned()
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<CachedObject> {
        self.state
            .lock()
            .objects
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_calls(&self) -> u64 {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Watch streams currently open
    pub fn watchers(&self) -> usize {
        self.events.receiver_count()
    }

    fn publish(&self, state: &mut BackendState, event: WatchEvent) {
        let revision = state.revision;
        state.history.push_back((revision, event.clone()));
        while state.history.len() > state.history_limit {
            if let Some((dropped, _)) = state.history.pop_front() {
                state.compacted = dropped;
            }
        }
        // No receivers is fine: nobody is watching yet
        let _ = self.events.send((revision, event));
    }

    fn check_reachable(&self) -> ClusterResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClusterError::Unreachable(self.name.clone()))
        }
    }

    fn check_lease_calls(&self) -> ClusterResult<()> {
        self.check_reachable()?;
        if self.lease_failures.load(Ordering::SeqCst) {
            return Err(ClusterError::Unreachable(format!("{} (lease API)", self.name)));
        }
        Ok(())
    }
}

fn in_namespace(event: &WatchEvent, namespace: Option<&str>) -> bool {
    let Some(ns) = namespace else {
        return true;
    };
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) => obj.namespace == ns,
        WatchEvent::Deleted(tombstone) => tombstone.key().namespace == ns,
        WatchEvent::Bookmark(_) => true,
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn list(&self, namespace: Option<&str>) -> ClusterResult<ObjectList> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;

        let state = self.state.lock();
        let items = state
            .objects
            .values()
            .filter(|o| namespace.map_or(true, |ns| o.namespace == ns))
            .cloned()
            .collect();
        Ok(ObjectList {
            items,
            resource_version: state.revision.to_string(),
        })
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: &str,
    ) -> ClusterResult<WatchStream> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;

        let from: u64 = resource_version
            .parse()
            .map_err(|_| ClusterError::Expired(resource_version.to_string()))?;
        let namespace = namespace.map(str::to_string);

        // Backlog and subscription are taken under the same lock as publish,
        // so the live stream starts exactly where the backlog ends.
        let (backlog, rx, disconnect) = {
            let state = self.state.lock();
            if from < state.compacted {
                return Err(ClusterError::Expired(resource_version.to_string()));
            }
            let backlog: Vec<ClusterResult<WatchEvent>> = state
                .history
                .iter()
                .filter(|(rev, ev)| *rev > from && in_namespace(ev, namespace.as_deref()))
                .map(|(_, ev)| Ok(ev.clone()))
                .collect();
            (backlog, self.events.subscribe(), state.disconnect.clone())
        };

        debug!(
            "Watch opened on {} from {} with {} backlog events",
            self.name,
            from,
            backlog.len()
        );

        let live = stream::unfold(
            (rx, disconnect, namespace, false),
            |(mut rx, disconnect, namespace, done)| async move {
                if done {
                    return None;
                }
                loop {
                    tokio::select! {
                        _ = disconnect.cancelled() => return None,
                        received = rx.recv() => match received {
                            Ok((_, event)) => {
                                if in_namespace(&event, namespace.as_deref()) {
                                    return Some((Ok(event), (rx, disconnect, namespace, false)));
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                let err = ClusterError::Watch(format!("watcher lagged by {} events", skipped));
                                return Some((Err(err), (rx, disconnect, namespace, true)));
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        },
                    }
                }
            },
        );

        Ok(stream::iter(backlog).chain(live).boxed())
    }

    async fn get_lease(&self, name: &str) -> ClusterResult<Option<LeaseRecord>> {
        self.check_lease_calls()?;
        Ok(self.state.lock().leases.get(name).cloned())
    }

    async fn try_acquire_or_renew(&self, lease: LeaseRecord) -> ClusterResult<LeaseRecord> {
        self.check_lease_calls()?;

        let mut state = self.state.lock();
        let stored_version = state
            .leases
            .get(&lease.name)
            .map(|l| l.resource_version)
            .unwrap_or(0);
        if stored_version != lease.resource_version {
            return Err(ClusterError::LeaseConflict(lease.name));
        }

        state.lease_revision += 1;
        let mut accepted = lease;
        accepted.resource_version = state.lease_revision;
        state.leases.insert(accepted.name.clone(), accepted.clone());
        Ok(accepted)
    }
}

/// Factory resolving cluster configs to registered in-memory clusters
#[derive(Default)]
pub struct InMemoryFactory {
    clusters: RwLock<HashMap<String, Arc<InMemoryCluster>>>,
    connects: AtomicU64,
}

impl InMemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cluster under its own name
    pub fn register(&self, cluster: Arc<InMemoryCluster>) -> Arc<InMemoryCluster> {
        self.clusters
            .write()
            .insert(cluster.name().to_string(), Arc::clone(&cluster));
        cluster
    }

    pub fn cluster(&self, name: &str) -> Option<Arc<InMemoryCluster>> {
        self.clusters.read().get(name).cloned()
    }

    /// Number of successful and failed connect calls
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for InMemoryFactory {
    async fn connect(&self, cluster: &ClusterConfig) -> ClusterResult<Arc<dyn ClusterClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.clusters.read().get(&cluster.name) {
            Some(backend) => Ok(Arc::clone(backend) as Arc<dyn ClusterClient>),
            None => Err(ClusterError::Credentials {
                cluster: cluster.name.clone(),
                reason: format!("no credentials for context '{}'", cluster.context),
            }),
        }
    }
}
