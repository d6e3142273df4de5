//! Multi-cluster manager
//!
//! Runs one `ClusterPipeline` per enabled cluster, each under its own
//! supervisor task. A cluster that fails to start is retried with backoff
//! and only degrades its own status. Shutdown stops every pipeline
//! (leadership first, then cache) within a bounded timeout.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleetwatch_core::types::{ClusterConfig, ClusterStatus, PipelinePhase};
use fleetwatch_core::FleetConfig;

use crate::cache::ObjectCache;
use crate::client::ClusterClient;
use crate::error::{ClusterError, ClusterResult};
use crate::pipeline::{ChangeEvent, ChangeSink, ClusterPipeline, PipelineSettings};
use crate::registry::ClusterRegistry;
use crate::retry::Backoff;

/// Manager tunables
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub pipeline: PipelineSettings,
    /// Upper bound on `stop`
    pub shutdown_timeout: Duration,
    pub restart_backoff_initial: Duration,
    pub restart_backoff_max: Duration,
    /// Bound on each attempt to resolve a cluster's client
    pub connect_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&FleetConfig::default())
    }
}

impl ManagerSettings {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            pipeline: PipelineSettings::from_config(config),
            shutdown_timeout: config.manager.shutdown_timeout(),
            restart_backoff_initial: config.cache.backoff_initial(),
            restart_backoff_max: config.cache.backoff_max(),
            connect_timeout: config.cache.initial_list_timeout(),
        }
    }
}

/// One enabled cluster under supervision
struct ManagedCluster {
    name: String,
    /// Cancels the supervisor; the pipeline is stopped separately
    supervisor_token: CancellationToken,
    /// Parent of the pipeline's own tokens
    pipeline_token: CancellationToken,
    pipeline: RwLock<Option<Arc<ClusterPipeline>>>,
    /// Status reported until a pipeline exists
    pending: RwLock<ClusterStatus>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedCluster {
    fn pipeline(&self) -> Option<Arc<ClusterPipeline>> {
        self.pipeline.read().clone()
    }

    fn status(&self) -> ClusterStatus {
        match self.pipeline() {
            Some(pipeline) => pipeline.status(),
            None => self.pending.read().clone(),
        }
    }

    /// Stop the supervisor, then the pipeline in leadership-first order
    async fn shutdown(&self) {
        self.supervisor_token.cancel();
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                warn!("Supervisor of cluster '{}' ended abnormally: {}", self.name, e);
            }
        }

        match self.pipeline() {
            Some(pipeline) => pipeline.stop().await,
            None => self.pending.write().phase = PipelinePhase::Stopped,
        }
        self.pipeline_token.cancel();
    }
}

struct Shared {
    registry: Arc<ClusterRegistry>,
    settings: ManagerSettings,
    /// Set while running; every cluster token derives from it
    root: Mutex<Option<CancellationToken>>,
    clusters: RwLock<BTreeMap<String, Arc<ManagedCluster>>>,
    sinks: RwLock<Vec<Arc<dyn ChangeSink>>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Shared {
    /// Resolve a cluster's client within the connect timeout
    async fn connect(&self, name: &str) -> ClusterResult<Arc<dyn ClusterClient>> {
        let limit = self.settings.connect_timeout;
        match tokio::time::timeout(limit, self.registry.client(name)).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout(limit)),
        }
    }

    async fn supervise(
        self: Arc<Self>,
        managed: Arc<ManagedCluster>,
        config: ClusterConfig,
        client: Option<Arc<dyn ClusterClient>>,
    ) {
        let token = managed.supervisor_token.clone();
        let mut backoff = Backoff::new(
            self.settings.restart_backoff_initial,
            self.settings.restart_backoff_max,
        );

        let client = match client {
            Some(client) => client,
            None => loop {
                let attempt = tokio::select! {
                    _ = token.cancelled() => return,
                    attempt = self.connect(&config.name) => attempt,
                };
                match attempt {
                    Ok(client) => break client,
                    Err(e) => {
                        warn!("Cannot connect to cluster '{}': {}", config.name, e);
                        {
                            let mut pending = managed.pending.write();
                            pending.phase = PipelinePhase::Failed;
                            pending.last_error = Some(e.to_string());
                            pending.restarts += 1;
                        }
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(backoff.next_delay()) => {}
                        }
                    }
                }
            },
        };

        let pipeline = {
            let sinks = self.sinks.read();
            let pipeline = Arc::new(ClusterPipeline::new(
                config,
                client,
                self.settings.pipeline.clone(),
            ));
            for sink in sinks.iter() {
                pipeline.add_sink(Arc::clone(sink));
            }
            let prior_attempts = managed.pending.read().restarts;
            for _ in 0..prior_attempts {
                pipeline.note_restart();
            }
            *managed.pipeline.write() = Some(Arc::clone(&pipeline));
            pipeline
        };
        self.forward_changes(&managed, &pipeline);
        backoff.reset();

        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = pipeline.start(&managed.pipeline_token) => result,
            };
            match result {
                Ok(()) => return,
                Err(ClusterError::Cancelled) | Err(ClusterError::AlreadyStarted(_)) => return,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        "Pipeline for cluster '{}' failed to start: {}; retrying in {:?}",
                        managed.name, e, delay
                    );
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    pipeline.note_restart();
                }
            }
        }
    }

    /// Relay one pipeline's changes onto the fleet-wide channel
    fn forward_changes(&self, managed: &ManagedCluster, pipeline: &ClusterPipeline) {
        let mut rx = pipeline.subscribe();
        let tx = self.changes.clone();
        let token = managed.pipeline_token.clone();
        let name = managed.name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => {
                            let _ = tx.send(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Change relay of cluster '{}' skipped {} events", name, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// Spawn a supervisor for `config`; `false` once the fleet has stopped.
    ///
    /// Registration happens under the root lock so `shutdown` either sees
    /// the new cluster or this call sees the fleet stopped.
    fn launch(
        self: &Arc<Self>,
        config: ClusterConfig,
        client: Option<Arc<dyn ClusterClient>>,
    ) -> bool {
        let root = self.root.lock();
        let Some(root) = root.as_ref() else {
            return false;
        };

        let managed = Arc::new(ManagedCluster {
            name: config.name.clone(),
            supervisor_token: root.child_token(),
            pipeline_token: root.child_token(),
            pipeline: RwLock::new(None),
            pending: RwLock::new(ClusterStatus::new(config.name.clone())),
            supervisor: Mutex::new(None),
        });
        debug!("Launching supervisor for cluster '{}'", config.name);

        let name = config.name.clone();
        let task = tokio::spawn(Arc::clone(self).supervise(
            Arc::clone(&managed),
            config,
            client,
        ));
        *managed.supervisor.lock() = Some(task);
        self.clusters.write().insert(name, managed);
        true
    }

    /// Stop every pipeline, waiting at most the shutdown timeout
    async fn shutdown(&self) -> ClusterResult<()> {
        let Some(root) = self.root.lock().take() else {
            return Ok(());
        };

        let clusters: Vec<Arc<ManagedCluster>> = self.clusters.read().values().cloned().collect();
        let timeout = self.settings.shutdown_timeout;
        let outcome = tokio::time::timeout(
            timeout,
            join_all(clusters.iter().map(|managed| managed.shutdown())),
        )
        .await;
        root.cancel();

        match outcome {
            Ok(_) => {
                info!("Fleet manager stopped");
                Ok(())
            }
            Err(_) => {
                error!("Fleet shutdown exceeded {:?}", timeout);
                Err(ClusterError::ShutdownTimeout(timeout))
            }
        }
    }
}

/// Owner of every cluster pipeline in the fleet
pub struct MultiClusterManager {
    shared: Arc<Shared>,
}

impl MultiClusterManager {
    pub fn new(registry: Arc<ClusterRegistry>, settings: ManagerSettings) -> Self {
        let (changes, _) = broadcast::channel(settings.pipeline.change_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                registry,
                settings,
                root: Mutex::new(None),
                clusters: RwLock::new(BTreeMap::new()),
                sinks: RwLock::new(Vec::new()),
                changes,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.shared.registry
    }

    /// Attach a sink to every current and future pipeline
    pub fn add_sink(&self, sink: Arc<dyn ChangeSink>) {
        let mut sinks = self.shared.sinks.write();
        for managed in self.shared.clusters.read().values() {
            if let Some(pipeline) = managed.pipeline() {
                pipeline.add_sink(Arc::clone(&sink));
            }
        }
        sinks.push(sink);
    }

    /// Changes emitted by any pipeline of the fleet
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.shared.changes.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shared.root.lock().is_some()
    }

    /// Start a supervised pipeline for every enabled cluster under `parent`.
    ///
    /// Fails only for fleet-wide configuration problems: no enabled
    /// cluster, invalid lease timings or a cluster whose credentials cannot
    /// be resolved. Clients are resolved concurrently, each within the
    /// connect timeout; unreachable clusters are retried in the background.
    /// Cancelling `parent` stops the fleet like `stop`.
    pub async fn start(&self, parent: &CancellationToken) -> ClusterResult<()> {
        let enabled = self.shared.registry.enabled();
        if enabled.is_empty() {
            return Err(fleetwatch_core::Error::NoEnabledClusters.into());
        }
        self.shared.settings.pipeline.leader.validate()?;
        if self.is_running() {
            return Err(ClusterError::AlreadyStarted("fleet".to_string()));
        }

        let connects = enabled.into_iter().map(|config| async move {
            let client = self.shared.connect(&config.name).await;
            (config, client)
        });
        let mut resolved = Vec::new();
        for (config, client) in join_all(connects).await {
            match client {
                Ok(client) => resolved.push((config, Some(client))),
                Err(e) if e.is_fatal() => {
                    error!("Cannot start cluster '{}': {}", config.name, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Cluster '{}' not connected yet: {}", config.name, e);
                    resolved.push((config, None));
                }
            }
        }

        let root = {
            let mut root = self.shared.root.lock();
            if root.is_some() {
                return Err(ClusterError::AlreadyStarted("fleet".to_string()));
            }
            let token = parent.child_token();
            *root = Some(token.clone());
            token
        };

        self.shared.clusters.write().clear();
        let count = resolved.len();
        for (config, client) in resolved {
            self.shared.launch(config, client);
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            root.cancelled().await;
            if let Err(e) = shared.shutdown().await {
                warn!("Fleet shutdown after cancellation: {}", e);
            }
        });
        info!("Fleet manager started with {} clusters", count);
        Ok(())
    }

    /// Stop every pipeline, waiting at most the shutdown timeout
    pub async fn stop(&self) -> ClusterResult<()> {
        self.shared.shutdown().await
    }

    /// Status of every registered cluster, keyed by name
    pub fn cluster_status(&self) -> BTreeMap<String, ClusterStatus> {
        let mut statuses: BTreeMap<String, ClusterStatus> = self
            .shared
            .registry
            .list()
            .into_iter()
            .map(|config| (config.name.clone(), ClusterStatus::new(config.name)))
            .collect();
        for (name, managed) in self.shared.clusters.read().iter() {
            statuses.insert(name.clone(), managed.status());
        }
        statuses
    }

    /// Register a cluster and, while running, start its pipeline
    pub async fn add_cluster(&self, config: ClusterConfig) -> ClusterResult<()> {
        self.shared.registry.add(config.clone())?;
        if !config.enabled || !self.is_running() {
            return Ok(());
        }

        let client = match self.shared.connect(&config.name).await {
            Ok(client) => Some(client),
            Err(e) if e.is_fatal() => {
                self.shared.registry.remove(&config.name);
                return Err(e);
            }
            Err(e) => {
                warn!("Cluster '{}' not connected yet: {}", config.name, e);
                None
            }
        };
        let name = config.name.clone();
        if !self.shared.launch(config, client) {
            debug!("Fleet stopped before cluster '{}' could launch", name);
        }
        Ok(())
    }

    /// Stop and unregister a cluster; `false` if it was unknown
    pub async fn remove_cluster(&self, name: &str) -> bool {
        let managed = self.shared.clusters.write().remove(name);
        if let Some(managed) = &managed {
            managed.shutdown().await;
        }
        let removed = self.shared.registry.remove(name).is_some();
        if removed || managed.is_some() {
            info!("Removed cluster '{}'", name);
        }
        removed || managed.is_some()
    }

    pub fn pipeline(&self, name: &str) -> Option<Arc<ClusterPipeline>> {
        self.shared.clusters.read().get(name)?.pipeline()
    }

    pub fn cache(&self, name: &str) -> Option<Arc<ObjectCache>> {
        self.pipeline(name).map(|pipeline| Arc::clone(pipeline.cache()))
    }
}

impl std::fmt::Debug for MultiClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiClusterManager")
            .field("clusters", &self.shared.clusters.read().keys().collect::<Vec<_>>())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryCluster, InMemoryFactory};
    use crate::test_support::{
        eventually, fast_cache_settings, fast_lease_timings, HeldFactory, StallingLeases,
    };
    use fleetwatch_core::types::{CachedObject, EventKind};

    fn settings(identity: &str) -> ManagerSettings {
        ManagerSettings {
            pipeline: PipelineSettings {
                cache: fast_cache_settings(),
                leader: fast_lease_timings(),
                identity: identity.to_string(),
                change_buffer: 64,
            },
            shutdown_timeout: Duration::from_secs(5),
            restart_backoff_initial: Duration::from_millis(20),
            restart_backoff_max: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(500),
        }
    }

    fn fleet(
        configs: Vec<ClusterConfig>,
        backends: Vec<Arc<InMemoryCluster>>,
    ) -> (MultiClusterManager, Arc<InMemoryFactory>) {
        let factory = Arc::new(InMemoryFactory::new());
        for backend in backends {
            factory.register(backend);
        }
        let registry = Arc::new(ClusterRegistry::new(configs, factory.clone()).unwrap());
        (MultiClusterManager::new(registry, settings("replica-a")), factory)
    }

    fn web(replicas: i32, image: &str) -> CachedObject {
        CachedObject::new("default", "web")
            .with_replicas(replicas)
            .with_container("app", image)
    }

    #[tokio::test]
    async fn test_zero_enabled_clusters_is_fatal() {
        let (manager, _) = fleet(
            vec![ClusterConfig::new("prod").disabled()],
            vec![InMemoryCluster::new("prod")],
        );
        let err = manager.start(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_unresolvable_credentials_fail_start() {
        let (manager, _) = fleet(
            vec![ClusterConfig::new("prod"), ClusterConfig::new("ghost")],
            vec![InMemoryCluster::new("prod")],
        );
        let err = manager.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Credentials { .. }));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_fleet_isolation() {
        let prod = InMemoryCluster::new("prod");
        prod.apply(web(2, "app:1.0"));
        let dr = InMemoryCluster::unreachable("dr");
        let (manager, _) = fleet(
            vec![ClusterConfig::new("prod").primary(), ClusterConfig::new("dr")],
            vec![prod.clone(), dr.clone()],
        );

        manager.start(&CancellationToken::new()).await.unwrap();
        eventually(|| manager.cache("prod").map_or(false, |c| c.has_synced())).await;
        eventually(|| manager.cluster_status()["dr"].last_error.is_some()).await;

        let statuses = manager.cluster_status();
        assert_eq!(statuses["prod"].phase, PipelinePhase::Running);
        assert!(statuses["prod"].cache_synced);
        assert!(!statuses["dr"].cache_synced);
        assert_eq!(
            manager.cache("prod").unwrap().get("default", "web").unwrap().spec.replicas,
            Some(2)
        );

        // The supervisor keeps retrying until the cluster comes back
        eventually(|| manager.cluster_status()["dr"].restarts >= 1).await;
        dr.set_reachable(true);
        eventually(|| manager.cluster_status()["dr"].phase == PipelinePhase::Running).await;
        assert!(manager.cluster_status()["dr"].last_error.is_none());

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_changes_are_relayed_fleet_wide() {
        let prod = InMemoryCluster::new("prod");
        prod.apply(web(2, "app:1.0"));
        let (manager, _) = fleet(vec![ClusterConfig::new("prod").primary()], vec![prod.clone()]);
        let mut changes = manager.subscribe();

        manager.start(&CancellationToken::new()).await.unwrap();
        eventually(|| manager.pipeline("prod").map_or(false, |p| p.is_actuating())).await;
        prod.apply(web(3, "app:2.0"));

        let event = tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.cluster, "prod");
        assert_eq!(event.kind, EventKind::Update);
        assert_eq!(event.changes.len(), 2);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_and_remove_cluster_at_runtime() {
        let prod = InMemoryCluster::new("prod");
        let staging = InMemoryCluster::new("staging");
        let (manager, _) = fleet(
            vec![ClusterConfig::new("prod")],
            vec![prod.clone(), staging.clone()],
        );
        manager.start(&CancellationToken::new()).await.unwrap();
        eventually(|| manager.cache("prod").map_or(false, |c| c.has_synced())).await;

        manager.add_cluster(ClusterConfig::new("staging")).await.unwrap();
        eventually(|| manager.cluster_status()["staging"].phase == PipelinePhase::Running).await;
        eventually(|| manager.pipeline("staging").map_or(false, |p| p.gate().is_leader())).await;
        assert!(manager.pipeline("prod").unwrap().cache().has_synced());

        assert!(manager.remove_cluster("staging").await);
        assert!(!manager.cluster_status().contains_key("staging"));
        assert!(staging
            .lease(fleetwatch_core::DEFAULT_LEASE_NAME)
            .unwrap()
            .is_released());

        assert!(!manager.remove_cluster("staging").await);
        assert!(!manager.remove_cluster("never-existed").await);
        assert_eq!(
            manager.cluster_status()["prod"].phase,
            PipelinePhase::Running
        );

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_cluster_rejects_second_primary() {
        let (manager, _) = fleet(
            vec![ClusterConfig::new("prod").primary()],
            vec![InMemoryCluster::new("prod"), InMemoryCluster::new("staging")],
        );
        manager.start(&CancellationToken::new()).await.unwrap();
        let err = manager
            .add_cluster(ClusterConfig::new("staging").primary())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(manager.pipeline("staging").is_none());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_releases_every_lease() {
        let prod = InMemoryCluster::new("prod");
        let staging = InMemoryCluster::new("staging");
        let (manager, _) = fleet(
            vec![ClusterConfig::new("prod"), ClusterConfig::new("staging")],
            vec![prod.clone(), staging.clone()],
        );
        manager.start(&CancellationToken::new()).await.unwrap();
        for name in ["prod", "staging"] {
            eventually(|| manager.pipeline(name).map_or(false, |p| p.gate().is_leader())).await;
        }

        manager.stop().await.unwrap();
        for backend in [&prod, &staging] {
            assert!(backend
                .lease(fleetwatch_core::DEFAULT_LEASE_NAME)
                .unwrap()
                .is_released());
        }
        let statuses = manager.cluster_status();
        assert!(statuses.values().all(|s| s.phase == PipelinePhase::Stopped));
        assert!(manager.stop().await.is_ok());
    }

    fn held_fleet(
        factory: Arc<HeldFactory>,
        names: &[&str],
        settings: ManagerSettings,
    ) -> MultiClusterManager {
        let configs = names.iter().map(|name| ClusterConfig::new(*name)).collect();
        let registry = Arc::new(ClusterRegistry::new(configs, factory).unwrap());
        MultiClusterManager::new(registry, settings)
    }

    #[tokio::test]
    async fn test_hanging_connect_does_not_block_fleet() {
        let prod = InMemoryCluster::new("prod");
        prod.apply(web(2, "app:1.0"));
        let factory = HeldFactory::new(
            vec![
                ("prod", prod.clone() as Arc<dyn ClusterClient>),
                ("dr", InMemoryCluster::new("dr") as Arc<dyn ClusterClient>),
            ],
            Some("dr"),
        );
        let manager = held_fleet(
            factory.clone(),
            &["dr", "prod"],
            ManagerSettings {
                connect_timeout: Duration::from_millis(100),
                ..settings("replica-a")
            },
        );

        tokio::time::timeout(Duration::from_secs(2), manager.start(&CancellationToken::new()))
            .await
            .expect("start blocked on one cluster")
            .unwrap();
        eventually(|| manager.cache("prod").map_or(false, |c| c.has_synced())).await;
        eventually(|| manager.cluster_status()["dr"].restarts >= 1).await;
        let dr = &manager.cluster_status()["dr"];
        assert_eq!(dr.phase, PipelinePhase::Failed);
        assert!(dr.last_error.as_deref().unwrap().contains("timed out"));

        factory.release.cancel();
        eventually(|| manager.cluster_status()["dr"].phase == PipelinePhase::Running).await;
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_fleet() {
        let prod = InMemoryCluster::new("prod");
        let (manager, _) = fleet(vec![ClusterConfig::new("prod")], vec![prod.clone()]);
        let parent = CancellationToken::new();
        manager.start(&parent).await.unwrap();
        eventually(|| manager.pipeline("prod").map_or(false, |p| p.gate().is_leader())).await;

        parent.cancel();
        eventually(|| !manager.is_running()).await;
        eventually(|| manager.cluster_status()["prod"].phase == PipelinePhase::Stopped).await;
        assert!(prod
            .lease(fleetwatch_core::DEFAULT_LEASE_NAME)
            .unwrap()
            .is_released());
        assert!(manager.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_reports_shutdown_timeout() {
        let prod = InMemoryCluster::new("prod");
        let client = StallingLeases::new(prod.clone(), false);
        let factory = HeldFactory::new(vec![("prod", client.clone() as Arc<dyn ClusterClient>)], None);
        let manager = held_fleet(
            factory,
            &["prod"],
            ManagerSettings {
                shutdown_timeout: Duration::from_millis(50),
                ..settings("replica-a")
            },
        );
        manager.start(&CancellationToken::new()).await.unwrap();
        eventually(|| manager.pipeline("prod").map_or(false, |p| p.gate().is_leader())).await;

        // The lease release now hangs until the renew deadline
        client.set_stalled(true);
        let err = manager.stop().await.unwrap_err();
        assert!(matches!(err, ClusterError::ShutdownTimeout(_)));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_add_cluster_racing_stop_is_not_launched() {
        let factory = HeldFactory::new(
            vec![
                ("prod", InMemoryCluster::new("prod") as Arc<dyn ClusterClient>),
                ("staging", InMemoryCluster::new("staging") as Arc<dyn ClusterClient>),
            ],
            Some("staging"),
        );
        let manager = Arc::new(held_fleet(
            factory.clone(),
            &["prod"],
            ManagerSettings {
                connect_timeout: Duration::from_secs(2),
                ..settings("replica-a")
            },
        ));
        manager.start(&CancellationToken::new()).await.unwrap();

        let adding = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.add_cluster(ClusterConfig::new("staging")).await })
        };
        eventually(|| factory.entered() >= 2).await;
        manager.stop().await.unwrap();

        factory.release.cancel();
        adding.await.unwrap().unwrap();
        assert!(manager.pipeline("staging").is_none());
        assert_eq!(
            manager.cluster_status()["staging"].phase,
            PipelinePhase::Pending
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_independent_managers_share_one_leader() {
        let prod = InMemoryCluster::new("prod");
        let factory = Arc::new(InMemoryFactory::new());
        factory.register(prod.clone());

        let managers: Vec<MultiClusterManager> = ["replica-a", "replica-b"]
            .iter()
            .map(|identity| {
                let registry = Arc::new(
                    ClusterRegistry::new(vec![ClusterConfig::new("prod")], factory.clone()).unwrap(),
                );
                MultiClusterManager::new(registry, settings(identity))
            })
            .collect();
        for manager in &managers {
            manager.start(&CancellationToken::new()).await.unwrap();
        }

        let leaders = || {
            managers
                .iter()
                .filter(|m| m.cluster_status()["prod"].is_leader)
                .count()
        };
        eventually(|| leaders() == 1).await;
        for _ in 0..40 {
            assert!(leaders() <= 1);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Both caches stay current regardless of leadership
        prod.apply(web(1, "app:1.0"));
        for manager in &managers {
            eventually(|| manager.cache("prod").map_or(false, |c| c.len() == 1)).await;
        }

        for manager in &managers {
            manager.stop().await.unwrap();
        }
    }
}
