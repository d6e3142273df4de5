//! Per-cluster object cache
//!
//! Runs the list + watch + resync loop against one cluster and keeps an
//! in-memory store keyed by namespace/name:
//!
//! - Initial list seeds the store (bounded attempts, bounded per-attempt timeout)
//! - Watch events are applied in delivery order; stale or duplicate resource
//!   versions are dropped, never applied
//! - Any watch termination triggers a relist with capped exponential backoff
//! - Periodic resync replays every cached object through the update path
//!
//! Readers take the store's read lock only for the duration of a copy, so
//! `list`/`get` never wait on network I/O.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetwatch_core::config::CacheConfig;
use fleetwatch_core::types::{compare_resource_versions, is_newer_version, CachedObject, ObjectKey};

use crate::client::{ClusterClient, ObjectList, Tombstone, WatchEvent};
use crate::error::{ClusterError, ClusterResult};
use crate::metrics;
use crate::retry::Backoff;

/// Runtime settings of one cache
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Resync interval; `None` disables resync
    pub resync_period: Option<Duration>,
    pub initial_list_attempts: u32,
    /// Timeout of each list call
    pub list_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            resync_period: config.resync_period(),
            initial_list_attempts: config.initial_list_attempts.max(1),
            list_timeout: config.initial_list_timeout(),
            backoff_initial: config.backoff_initial(),
            backoff_max: config.backoff_max(),
        }
    }
}

/// Notification published to cache subscribers
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// New object; `initial` is set while the first list populates the store
    Added {
        object: Arc<CachedObject>,
        initial: bool,
    },
    /// Newer version of a known object; `resync` marks periodic replays
    Updated {
        old: Arc<CachedObject>,
        new: Arc<CachedObject>,
        resync: bool,
    },
    Deleted {
        object: Arc<CachedObject>,
    },
}

impl CacheEvent {
    /// Latest known state of the object the event is about
    pub fn object(&self) -> &Arc<CachedObject> {
        match self {
            CacheEvent::Added { object, .. } | CacheEvent::Deleted { object } => object,
            CacheEvent::Updated { new, .. } => new,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.object().key()
    }

    fn label(&self) -> &'static str {
        match self {
            CacheEvent::Added { .. } => "added",
            CacheEvent::Updated { resync: true, .. } => "resync",
            CacheEvent::Updated { .. } => "updated",
            CacheEvent::Deleted { .. } => "deleted",
        }
    }
}

/// Subscriber to cache notifications.
///
/// Called synchronously from the watch loop, so implementations must not block.
pub trait CacheEventHandler: Send + Sync {
    fn on_event(&self, event: &CacheEvent);
}

impl<F> CacheEventHandler for F
where
    F: Fn(&CacheEvent) + Send + Sync,
{
    fn on_event(&self, event: &CacheEvent) {
        self(event)
    }
}

#[derive(Default)]
struct Store {
    objects: BTreeMap<ObjectKey, Arc<CachedObject>>,
    /// Highest resource version seen; watches resume from here
    resource_version: String,
}

impl Store {
    fn advance_version(&mut self, resource_version: &str) {
        if !resource_version.is_empty() && is_newer_version(resource_version, &self.resource_version) {
            self.resource_version = resource_version.to_string();
        }
    }
}

enum Lifecycle {
    Idle,
    Starting { cancel: CancellationToken },
    Running { cancel: CancellationToken, task: JoinHandle<()> },
    Stopped,
}

/// Where an event applied to the store came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    InitialList,
    Relist,
    Watch,
}

enum WatchOutcome {
    Cancelled,
    Closed,
    Failed(ClusterError),
}

struct CacheInner {
    cluster: String,
    namespace: Option<String>,
    client: Arc<dyn ClusterClient>,
    settings: CacheSettings,
    store: RwLock<Store>,
    handlers: RwLock<Vec<Arc<dyn CacheEventHandler>>>,
    synced: watch::Sender<bool>,
    last_error: RwLock<Option<String>>,
}

/// Continuously updated copy of all objects of one kind in one cluster
pub struct ObjectCache {
    inner: Arc<CacheInner>,
    lifecycle: Mutex<Lifecycle>,
}

impl ObjectCache {
    pub fn new(
        cluster: impl Into<String>,
        namespace: Option<String>,
        client: Arc<dyn ClusterClient>,
        settings: CacheSettings,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            inner: Arc::new(CacheInner {
                cluster: cluster.into(),
                namespace,
                client,
                settings,
                store: RwLock::new(Store::default()),
                handlers: RwLock::new(Vec::new()),
                synced,
                last_error: RwLock::new(None),
            }),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Register a subscriber; it sees events applied after registration
    pub fn subscribe(&self, handler: Arc<dyn CacheEventHandler>) {
        self.inner.handlers.write().push(handler);
    }

    /// List, seed the store, then keep it current from a background watch loop.
    ///
    /// Fails only when every initial list attempt fails; later failures are
    /// retried internally and reported through `last_error`.
    pub async fn start(&self, parent: &CancellationToken) -> ClusterResult<()> {
        let cancel = parent.child_token();
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Idle => {
                    *lifecycle = Lifecycle::Starting {
                        cancel: cancel.clone(),
                    }
                }
                _ => return Err(ClusterError::AlreadyStarted(self.inner.cluster.clone())),
            }
        }

        if let Err(e) = self.inner.initial_list(&cancel).await {
            let mut lifecycle = self.lifecycle.lock();
            if matches!(*lifecycle, Lifecycle::Starting { .. }) {
                *lifecycle = Lifecycle::Idle;
            }
            return Err(e);
        }

        let inner = Arc::clone(&self.inner);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { inner.run(task_cancel).await });

        let mut lifecycle = self.lifecycle.lock();
        if matches!(*lifecycle, Lifecycle::Starting { .. }) {
            *lifecycle = Lifecycle::Running { cancel, task };
            Ok(())
        } else {
            // stop() won the race while we were listing
            cancel.cancel();
            Err(ClusterError::Cancelled)
        }
    }

    /// Cancel the watch loop and wait for it to exit. No-op unless started.
    pub async fn stop(&self) {
        let task = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running { cancel, task } => {
                    cancel.cancel();
                    Some(task)
                }
                Lifecycle::Starting { cancel } => {
                    cancel.cancel();
                    None
                }
                Lifecycle::Idle => {
                    *lifecycle = Lifecycle::Idle;
                    return;
                }
                Lifecycle::Stopped => return,
            }
        };

        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(
                    "Watch loop for cluster '{}' ended abnormally: {}",
                    self.inner.cluster, e
                );
            }
        }
        info!("Object cache for cluster '{}' stopped", self.inner.cluster);
    }

    pub fn cluster(&self) -> &str {
        &self.inner.cluster
    }

    /// True once the first full list has been applied
    pub fn has_synced(&self) -> bool {
        *self.inner.synced.borrow()
    }

    /// Wait until synced; false on timeout
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.synced.subscribe();
        let synced = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|synced| *synced)).await,
            Ok(Ok(_))
        );
        synced
    }

    /// Snapshot of all cached objects ordered by key
    pub fn list(&self) -> Vec<Arc<CachedObject>> {
        self.inner.store.read().objects.values().cloned().collect()
    }

    /// Snapshot of the objects in one namespace
    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<CachedObject>> {
        let store = self.inner.store.read();
        store
            .objects
            .range(ObjectKey::new(namespace, "")..)
            .take_while(|(key, _)| key.namespace == namespace)
            .map(|(_, object)| Arc::clone(object))
            .collect()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<CachedObject>> {
        self.inner
            .store
            .read()
            .objects
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.store.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resource version the next watch resumes from
    pub fn resource_version(&self) -> String {
        self.inner.store.read().resource_version.clone()
    }

    /// Most recent list/watch failure; cleared by the next success
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("cluster", &self.inner.cluster)
            .field("namespace", &self.inner.namespace)
            .field("synced", &self.has_synced())
            .field("objects", &self.len())
            .finish()
    }
}

impl CacheInner {
    async fn initial_list(&self, cancel: &CancellationToken) -> ClusterResult<()> {
        let attempts = self.settings.initial_list_attempts.max(1);
        let mut backoff = Backoff::new(self.settings.backoff_initial, self.settings.backoff_max);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = backoff.next_delay();
                debug!(
                    "Retrying initial list of cluster '{}' in {:?} (attempt {})",
                    self.cluster, delay, attempt
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ClusterError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ClusterError::Cancelled),
                result = self.list_once() => result,
            };

            match result {
                Ok(list) => {
                    let count = list.items.len();
                    self.reconcile(list, Origin::InitialList);
                    self.clear_error();
                    self.synced.send_replace(true);
                    info!(
                        "Object cache for cluster '{}' synced with {} objects",
                        self.cluster, count
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Initial list of cluster '{}' failed (attempt {}/{}): {}",
                        self.cluster, attempt, attempts, e
                    );
                    self.set_error(&e);
                    last_error = Some(e);
                }
            }
        }

        Err(ClusterError::InitialListFailed {
            cluster: self.cluster.clone(),
            attempts,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn list_once(&self) -> ClusterResult<ObjectList> {
        match tokio::time::timeout(
            self.settings.list_timeout,
            self.client.list(self.namespace.as_deref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout(self.settings.list_timeout)),
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.settings.backoff_initial, self.settings.backoff_max);
        let mut resync = self.settings.resync_period.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        'watch: loop {
            let from = self.store.read().resource_version.clone();
            match self.watch_once(&cancel, &from, &mut resync).await {
                WatchOutcome::Cancelled => break 'watch,
                WatchOutcome::Closed => {
                    debug!("Watch on cluster '{}' closed at {}", self.cluster, from)
                }
                WatchOutcome::Failed(e) => {
                    warn!("Watch on cluster '{}' failed: {}", self.cluster, e);
                    self.set_error(&e);
                }
            }

            loop {
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = cancel.cancelled() => break 'watch,
                    _ = tokio::time::sleep(delay) => {}
                }

                let result = tokio::select! {
                    _ = cancel.cancelled() => break 'watch,
                    result = self.list_once() => result,
                };
                match result {
                    Ok(list) => {
                        metrics::record_relist(&self.cluster);
                        self.reconcile(list, Origin::Relist);
                        self.clear_error();
                        backoff.reset();
                        break;
                    }
                    Err(e) => {
                        warn!(
                            "Relist of cluster '{}' failed (attempt {}): {}",
                            self.cluster,
                            backoff.attempts(),
                            e
                        );
                        self.set_error(&e);
                    }
                }
            }
        }

        debug!("Watch loop for cluster '{}' stopped", self.cluster);
    }

    async fn watch_once(
        &self,
        cancel: &CancellationToken,
        from: &str,
        resync: &mut Option<Interval>,
    ) -> WatchOutcome {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return WatchOutcome::Cancelled,
            opened = self.client.watch(self.namespace.as_deref(), from) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return WatchOutcome::Failed(e),
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return WatchOutcome::Cancelled,
                _ = next_resync(resync) => self.resync(),
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        if let Some(event) = self.apply(event, Origin::Watch) {
                            self.dispatch(&event);
                        }
                        self.clear_error();
                    }
                    Some(Err(e)) => return WatchOutcome::Failed(e),
                    None => return WatchOutcome::Closed,
                },
            }
        }
    }

    /// Bring the store in line with a full list.
    ///
    /// Unknown keys become adds, newer versions become updates and keys
    /// missing from the list become deletes with an unknown final state.
    fn reconcile(&self, list: ObjectList, origin: Origin) {
        let vanished: Vec<ObjectKey> = {
            let listed: std::collections::HashSet<ObjectKey> =
                list.items.iter().map(CachedObject::key).collect();
            self.store
                .read()
                .objects
                .keys()
                .filter(|key| !listed.contains(*key))
                .cloned()
                .collect()
        };

        for object in list.items {
            if let Some(event) = self.apply(WatchEvent::Modified(object), origin) {
                self.dispatch(&event);
            }
        }
        for key in vanished {
            let tombstone = Tombstone::FinalStateUnknown {
                key,
                last_known: None,
            };
            if let Some(event) = self.apply(WatchEvent::Deleted(tombstone), origin) {
                self.dispatch(&event);
            }
        }

        self.store.write().advance_version(&list.resource_version);
    }

    /// Apply one event to the store; `None` when it changed nothing.
    ///
    /// A watch event for a key the store does not hold must be newer than
    /// the store's resource version, so a replayed event cannot resurrect
    /// an object whose delete was already applied.
    fn apply(&self, event: WatchEvent, origin: Origin) -> Option<CacheEvent> {
        let mut store = self.store.write();
        if let WatchEvent::Bookmark(rv) = &event {
            store.advance_version(rv);
            return None;
        }

        let applied = match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                let key = object.key();
                if origin == Origin::Watch
                    && !store.objects.contains_key(&key)
                    && !store.resource_version.is_empty()
                    && !is_newer_version(&object.resource_version, &store.resource_version)
                {
                    debug!(
                        "Dropping stale event for unknown {} on cluster '{}' ({} <= {})",
                        key, self.cluster, object.resource_version, store.resource_version
                    );
                    metrics::record_dropped(&self.cluster, "stale");
                    return None;
                }
                store.advance_version(&object.resource_version);
                if let Some(existing) = store.objects.get(&key) {
                    if compare_resource_versions(&object.resource_version, &existing.resource_version)
                        .is_none()
                    {
                        debug!(
                            "Incomparable resource versions for {} on cluster '{}' ({} vs {}), applying",
                            key, self.cluster, object.resource_version, existing.resource_version
                        );
                    }
                }
                match store.objects.get(&key) {
                    Some(existing)
                        if !is_newer_version(&object.resource_version, &existing.resource_version) =>
                    {
                        debug!(
                            "Dropping stale event for {} on cluster '{}' ({} <= {})",
                            key, self.cluster, object.resource_version, existing.resource_version
                        );
                        metrics::record_dropped(&self.cluster, "stale");
                        return None;
                    }
                    Some(existing) => {
                        let old = Arc::clone(existing);
                        let new = Arc::new(object);
                        store.objects.insert(key, Arc::clone(&new));
                        CacheEvent::Updated {
                            old,
                            new,
                            resync: false,
                        }
                    }
                    None => {
                        let object = Arc::new(object);
                        store.objects.insert(key, Arc::clone(&object));
                        CacheEvent::Added {
                            object,
                            initial: origin == Origin::InitialList,
                        }
                    }
                }
            }
            WatchEvent::Deleted(tombstone) => {
                let key = tombstone.key();
                let Some(existing) = store.objects.get(&key).cloned() else {
                    debug!(
                        "Ignoring delete of unknown object {} on cluster '{}'",
                        key, self.cluster
                    );
                    metrics::record_dropped(&self.cluster, "unknown_delete");
                    return None;
                };
                let object = match unwrap_tombstone(tombstone, existing) {
                    Ok(object) => object,
                    Err(reason) => {
                        warn!(
                            "Dropping delete of {} on cluster '{}': {}",
                            key, self.cluster, reason
                        );
                        metrics::record_dropped(&self.cluster, reason);
                        return None;
                    }
                };
                store.advance_version(&object.resource_version);
                store.objects.remove(&key);
                CacheEvent::Deleted { object }
            }
            WatchEvent::Bookmark(_) => return None,
        };

        metrics::record_applied(&self.cluster, applied.label());
        metrics::set_object_count(&self.cluster, store.objects.len());
        Some(applied)
    }

    fn resync(&self) {
        let objects = self.store.read().objects.values().cloned().collect::<Vec<_>>();
        debug!(
            "Resyncing {} objects on cluster '{}'",
            objects.len(),
            self.cluster
        );
        for object in objects {
            self.dispatch(&CacheEvent::Updated {
                old: Arc::clone(&object),
                new: object,
                resync: true,
            });
        }
    }

    fn dispatch(&self, event: &CacheEvent) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler.on_event(event);
        }
    }

    fn set_error(&self, error: &ClusterError) {
        *self.last_error.write() = Some(error.to_string());
    }

    fn clear_error(&self) {
        if self.last_error.read().is_some() {
            *self.last_error.write() = None;
        }
    }
}

/// Resolve a delete notification to the object handed to subscribers
fn unwrap_tombstone(
    tombstone: Tombstone,
    stored: Arc<CachedObject>,
) -> Result<Arc<CachedObject>, &'static str> {
    match tombstone {
        Tombstone::Final(object) => {
            if compare_resource_versions(&object.resource_version, &stored.resource_version)
                == Some(Ordering::Less)
            {
                return Err("stale");
            }
            Ok(Arc::new(object))
        }
        Tombstone::FinalStateUnknown { key, last_known } => match last_known {
            Some(object) if object.key() != key => Err("malformed_tombstone"),
            Some(object) => Ok(Arc::new(object)),
            None => Ok(stored),
        },
    }
}

async fn next_resync(resync: &mut Option<Interval>) {
    match resync {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCluster;
    use crate::test_support::{eventually, fast_cache_settings, start_watching, Recorder};

    fn web(replicas: i32, image: &str) -> CachedObject {
        CachedObject::new("default", "web")
            .with_replicas(replicas)
            .with_container("app", image)
    }

    fn cache_for(cluster: &Arc<InMemoryCluster>) -> (ObjectCache, Arc<Recorder>) {
        let cache = ObjectCache::new(
            cluster.name(),
            None,
            Arc::clone(cluster) as Arc<dyn ClusterClient>,
            fast_cache_settings(),
        );
        let recorder = Arc::new(Recorder::default());
        cache.subscribe(recorder.clone());
        (cache, recorder)
    }

    #[tokio::test]
    async fn test_initial_list_seeds_store() {
        let cluster = InMemoryCluster::new("prod");
        cluster.apply(web(2, "app:1.0"));
        cluster.apply(CachedObject::new("kube-system", "dns"));
        let (cache, recorder) = cache_for(&cluster);

        assert!(!cache.has_synced());
        cache.start(&CancellationToken::new()).await.unwrap();
        assert!(cache.has_synced());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("default", "web").unwrap().spec.replicas, Some(2));
        assert_eq!(cache.list_namespace("kube-system").len(), 1);
        assert_eq!(cache.resource_version(), "2");

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, CacheEvent::Added { initial: true, .. })));

        cache.stop().await;
    }

    #[tokio::test]
    async fn test_watch_applies_updates_and_deletes() {
        let cluster = InMemoryCluster::new("prod");
        cluster.apply(web(2, "app:1.0"));
        let (cache, recorder) = cache_for(&cluster);
        cache.start(&CancellationToken::new()).await.unwrap();

        cluster.apply(web(3, "app:1.0"));
        eventually(|| cache.get("default", "web").map(|o| o.spec.replicas) == Some(Some(3))).await;

        cluster.delete("default", "web");
        eventually(|| cache.get("default", "web").is_none()).await;

        let events = recorder.events();
        assert!(matches!(events[1], CacheEvent::Updated { resync: false, .. }));
        assert!(matches!(events[2], CacheEvent::Deleted { .. }));
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_out_of_order_delivery_never_regresses_version() {
        let cluster = InMemoryCluster::new("prod");
        let v1 = cluster.apply(web(1, "app:1.0"));
        let (cache, recorder) = cache_for(&cluster);
        start_watching(&cache, &cluster).await;

        let mut v5 = web(5, "app:1.0");
        v5.resource_version = "5".to_string();
        let mut v3 = web(3, "app:1.0");
        v3.resource_version = "3".to_string();

        cluster.inject_event(WatchEvent::Modified(v5));
        cluster.inject_event(WatchEvent::Modified(v3));
        cluster.inject_event(WatchEvent::Modified(v1));
        let mut v6 = web(6, "app:1.0");
        v6.resource_version = "6".to_string();
        cluster.inject_event(WatchEvent::Modified(v6));

        eventually(|| cache.get("default", "web").map(|o| o.resource_version.clone()) == Some("6".into())).await;

        let versions: Vec<u64> = recorder
            .events()
            .iter()
            .map(|e| e.object().resource_version.parse().unwrap())
            .collect();
        assert_eq!(versions, vec![1, 5, 6]);
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_delete_is_ignored() {
        let cluster = InMemoryCluster::new("prod");
        cluster.apply(web(1, "app:1.0"));
        let (cache, recorder) = cache_for(&cluster);
        start_watching(&cache, &cluster).await;

        cluster.delete("default", "web");
        eventually(|| cache.is_empty()).await;
        cluster.inject_event(WatchEvent::Deleted(Tombstone::Final(web(1, "app:1.0"))));
        cluster.apply(CachedObject::new("default", "marker"));
        eventually(|| cache.get("default", "marker").is_some()).await;

        let deletes = recorder
            .events()
            .iter()
            .filter(|e| matches!(e, CacheEvent::Deleted { .. }))
            .count();
        assert_eq!(deletes, 1);
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_final_state_unknown_is_unwrapped() {
        let cluster = InMemoryCluster::new("prod");
        cluster.apply(web(4, "app:1.0"));
        let (cache, recorder) = cache_for(&cluster);
        start_watching(&cache, &cluster).await;

        cluster.inject_event(WatchEvent::Deleted(Tombstone::FinalStateUnknown {
            key: ObjectKey::new("default", "web"),
            last_known: None,
        }));
        eventually(|| cache.is_empty()).await;

        match recorder.events().last() {
            Some(CacheEvent::Deleted { object }) => {
                assert_eq!(object.name, "web");
                assert_eq!(object.spec.replicas, Some(4));
            }
            other => panic!("expected delete, got {:?}", other),
        }
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_replayed_event_does_not_resurrect_deleted_object() {
        let cluster = InMemoryCluster::new("prod");
        let v1 = cluster.apply(web(1, "app:1.0"));
        let (cache, recorder) = cache_for(&cluster);
        start_watching(&cache, &cluster).await;

        let v2 = cluster.apply(web(2, "app:1.0"));
        cluster.delete("default", "web");
        eventually(|| cache.is_empty()).await;
        assert_eq!(cache.resource_version(), "3");

        cluster.inject_event(WatchEvent::Modified(v2));
        cluster.inject_event(WatchEvent::Added(v1));
        cluster.apply(CachedObject::new("default", "marker"));
        eventually(|| cache.get("default", "marker").is_some()).await;

        assert!(cache.get("default", "web").is_none());
        let web_adds = recorder
            .events()
            .iter()
            .filter(|e| matches!(e, CacheEvent::Added { object, .. } if object.name == "web"))
            .count();
        assert_eq!(web_adds, 1);
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_stale_final_tombstone_is_dropped() {
        let cluster = InMemoryCluster::new("prod");
        let v1 = cluster.apply(web(1, "app:1.0"));
        cluster.apply(web(2, "app:1.0"));
        let (cache, recorder) = cache_for(&cluster);
        start_watching(&cache, &cluster).await;

        cluster.inject_event(WatchEvent::Deleted(Tombstone::Final(v1)));
        cluster.apply(CachedObject::new("default", "marker"));
        eventually(|| cache.get("default", "marker").is_some()).await;

        assert_eq!(cache.get("default", "web").unwrap().resource_version, "2");
        assert!(!recorder
            .events()
            .iter()
            .any(|e| matches!(e, CacheEvent::Deleted { .. })));
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_final_tombstone_older_than_store_is_stale() {
        let mut stored = web(1, "app:1.0");
        stored.resource_version = "5".to_string();
        let mut older = web(1, "app:1.0");
        older.resource_version = "3".to_string();

        let result = unwrap_tombstone(Tombstone::Final(older), Arc::new(stored));
        assert_eq!(result.err(), Some("stale"));
    }

    #[tokio::test]
    async fn test_malformed_tombstone_is_dropped() {
        let stored = Arc::new(web(1, "app:1.0"));
        let tombstone = Tombstone::FinalStateUnknown {
            key: ObjectKey::new("default", "web"),
            last_known: Some(CachedObject::new("default", "other")),
        };
        assert_eq!(
            unwrap_tombstone(tombstone, stored).err(),
            Some("malformed_tombstone")
        );
    }

    #[tokio::test]
    async fn test_relist_after_disconnect_detects_missed_delete() {
        let cluster = InMemoryCluster::new("prod");
        cluster.apply(web(1, "app:1.0"));
        cluster.apply(CachedObject::new("default", "api"));
        let (cache, recorder) = cache_for(&cluster);
        start_watching(&cache, &cluster).await;

        cluster.delete_silently("default", "api");
        cluster.disconnect_watchers();

        eventually(|| cache.get("default", "api").is_none()).await;
        assert!(cache.get("default", "web").is_some());
        assert!(cluster.list_calls() >= 2);
        assert!(recorder
            .events()
            .iter()
            .any(|e| matches!(e, CacheEvent::Deleted { object } if object.name == "api")));
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_relists_when_cluster_recovers() {
        let cluster = InMemoryCluster::new("prod");
        cluster.apply(web(1, "app:1.0"));
        let (cache, _recorder) = cache_for(&cluster);
        cache.start(&CancellationToken::new()).await.unwrap();

        cluster.set_reachable(false);
        cluster.apply(web(2, "app:1.0"));
        cluster.compact();
        eventually(|| cache.last_error().is_some()).await;

        cluster.set_reachable(true);
        eventually(|| cache.get("default", "web").map(|o| o.spec.replicas) == Some(Some(2))).await;
        eventually(|| cache.last_error().is_none()).await;
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_relist_backoff_grows_while_unreachable() {
        let cluster = InMemoryCluster::new("prod");
        cluster.apply(web(1, "app:1.0"));
        let settings = CacheSettings {
            backoff_initial: Duration::from_millis(20),
            backoff_max: Duration::from_millis(160),
            ..fast_cache_settings()
        };
        let cache = ObjectCache::new("prod", None, cluster.clone(), settings);
        start_watching(&cache, &cluster).await;

        let before = cluster.list_calls();
        cluster.set_reachable(false);
        tokio::time::sleep(Duration::from_millis(700)).await;
        let relists = cluster.list_calls() - before;

        // 20 + 40 + 80 + 160 + 160 + 160 ms; a fixed 20 ms delay would give ~35
        assert!(relists >= 3, "only {} relists", relists);
        assert!(relists <= 8, "{} relists, backoff is not growing", relists);
        assert!(cache.last_error().is_some());

        cluster.set_reachable(true);
        eventually(|| cache.last_error().is_none()).await;
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_initial_list_gives_up_after_bounded_attempts() {
        let cluster = InMemoryCluster::unreachable("dr");
        let (cache, _recorder) = cache_for(&cluster);

        let err = cache.start(&CancellationToken::new()).await.unwrap_err();
        match err {
            ClusterError::InitialListFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(cluster.list_calls(), 3);
        assert!(!cache.has_synced());
        assert!(cache.last_error().is_some());

        // A failed start leaves the cache startable
        cluster.set_reachable(true);
        cache.start(&CancellationToken::new()).await.unwrap();
        assert!(cache.has_synced());
        assert!(cache.last_error().is_none());
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_resync_replays_cached_objects() {
        let cluster = InMemoryCluster::new("prod");
        cluster.apply(web(1, "app:1.0"));
        let settings = CacheSettings {
            resync_period: Some(Duration::from_millis(30)),
            ..fast_cache_settings()
        };
        let cache = ObjectCache::new("prod", None, cluster.clone(), settings);
        let recorder = Arc::new(Recorder::default());
        cache.subscribe(recorder.clone());
        cache.start(&CancellationToken::new()).await.unwrap();

        eventually(|| {
            recorder
                .events()
                .iter()
                .any(|e| matches!(e, CacheEvent::Updated { resync: true, .. }))
        })
        .await;
        for event in recorder.events() {
            if let CacheEvent::Updated { old, new, resync: true } = event {
                assert!(Arc::ptr_eq(&old, &new));
            }
        }
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let cluster = InMemoryCluster::new("prod");
        let (cache, _recorder) = cache_for(&cluster);

        cache.stop().await;
        cache.start(&CancellationToken::new()).await.unwrap();
        cache.stop().await;
        cache.stop().await;
        assert!(matches!(
            cache.start(&CancellationToken::new()).await,
            Err(ClusterError::AlreadyStarted(_))
        ));
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_watch_loop() {
        let cluster = InMemoryCluster::new("prod");
        let (cache, _recorder) = cache_for(&cluster);
        let parent = CancellationToken::new();
        cache.start(&parent).await.unwrap();

        parent.cancel();
        let watches = cluster.watch_calls();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cluster.watch_calls(), watches);
        cache.stop().await;
    }
}
