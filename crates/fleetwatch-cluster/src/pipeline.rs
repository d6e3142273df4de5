//! Per-cluster pipeline
//!
//! Owns one cluster's `ObjectCache` and `LeadershipGate` and bridges cache
//! events to the `ChangeAnalyzer`. The cache is maintained regardless of
//! leadership; analysis, sinks and the change broadcast only run while this
//! replica leads the cluster and the cache has synced.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetwatch_core::types::{
    CachedObject, ChangeRecord, ClusterConfig, ClusterStatus, EventKind, PipelinePhase,
};

use crate::analyzer::ChangeAnalyzer;
use crate::cache::{CacheEvent, CacheEventHandler, CacheSettings, ObjectCache};
use crate::client::ClusterClient;
use crate::error::{ClusterError, ClusterResult};
use crate::leader::{LeaseTimings, LeadershipGate};
use crate::metrics;

/// Consumer of classified changes
pub trait ChangeSink: Send + Sync {
    fn on_create(&self, cluster: &str, object: &CachedObject);

    fn on_update(&self, cluster: &str, object: &CachedObject, changes: &[ChangeRecord]);

    fn on_delete(&self, cluster: &str, object: &CachedObject);

    /// Unchanged spec seen again, from a periodic replay or a status-only update
    fn on_resync(&self, _cluster: &str, _object: &CachedObject) {}
}

/// Sink writing every change to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

impl ChangeSink for LoggingSink {
    fn on_create(&self, cluster: &str, object: &CachedObject) {
        info!(
            "[{}] Created {} (replicas: {})",
            cluster,
            object.key(),
            object.spec.effective_replicas()
        );
    }

    fn on_update(&self, cluster: &str, object: &CachedObject, changes: &[ChangeRecord]) {
        info!(
            "[{}] Updated {} (generation {}, {} changes)",
            cluster,
            object.key(),
            object.generation,
            changes.len()
        );
        for change in changes {
            info!("[{}]   {}", cluster, change);
        }
    }

    fn on_delete(&self, cluster: &str, object: &CachedObject) {
        info!("[{}] Deleted {}", cluster, object.key());
    }

    fn on_resync(&self, cluster: &str, object: &CachedObject) {
        debug!("[{}] Resynced {}", cluster, object.key());
    }
}

/// Change emitted by a leading pipeline
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub cluster: String,
    pub kind: EventKind,
    pub object: Arc<CachedObject>,
    /// Field changes; empty unless `kind` is `Update`
    pub changes: Vec<ChangeRecord>,
    /// Set on periodic replays of an unchanged object
    pub replay: bool,
}

/// Settings shared by every pipeline of a manager
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub cache: CacheSettings,
    pub leader: LeaseTimings,
    /// Lease holder identity of this process
    pub identity: String,
    /// Capacity of the change broadcast channel
    pub change_buffer: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            leader: LeaseTimings::default(),
            identity: fleetwatch_core::utils::generate_identity(),
            change_buffer: 1024,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &fleetwatch_core::FleetConfig) -> Self {
        Self {
            cache: CacheSettings::from(&config.cache),
            leader: LeaseTimings::from(&config.leader),
            identity: config.leader.resolve_identity(),
            change_buffer: config.manager.change_buffer.max(1),
        }
    }
}

/// Cache subscriber that gates analysis on leadership
struct Bridge {
    cluster: String,
    analyzer: ChangeAnalyzer,
    gate: Arc<LeadershipGate>,
    synced: AtomicBool,
    sinks: RwLock<Vec<Arc<dyn ChangeSink>>>,
    changes: broadcast::Sender<ChangeEvent>,
    observed: AtomicU64,
}

impl Bridge {
    fn is_actuating(&self) -> bool {
        self.synced.load(Ordering::SeqCst) && self.gate.is_leader()
    }

    fn emit(&self, event: &CacheEvent) {
        let analysis = self.analyzer.analyze(event);
        let object = Arc::clone(event.object());
        let replay = matches!(event, CacheEvent::Updated { resync: true, .. });

        if analysis.kind == EventKind::Resync {
            match event {
                CacheEvent::Updated {
                    old,
                    new,
                    resync: false,
                } => {
                    let status = self.analyzer.status_changes(old, new);
                    debug!(
                        "[{}] Status sync of {} ({} status changes)",
                        self.cluster,
                        object.key(),
                        status.len()
                    );
                }
                _ => debug!("[{}] Resync of {}", self.cluster, object.key()),
            }
        }

        let sinks = self.sinks.read().clone();
        for sink in &sinks {
            match analysis.kind {
                EventKind::Create => sink.on_create(&self.cluster, &object),
                EventKind::Update => sink.on_update(&self.cluster, &object, &analysis.changes),
                EventKind::Delete => sink.on_delete(&self.cluster, &object),
                EventKind::Resync => sink.on_resync(&self.cluster, &object),
            }
        }

        metrics::record_change(&self.cluster, analysis.kind);
        // No receivers is not an error
        let _ = self.changes.send(ChangeEvent {
            cluster: self.cluster.clone(),
            kind: analysis.kind,
            object,
            changes: analysis.changes,
            replay,
        });
    }
}

impl CacheEventHandler for Bridge {
    fn on_event(&self, event: &CacheEvent) {
        self.observed.fetch_add(1, Ordering::Relaxed);
        if self.is_actuating() {
            self.emit(event);
        }
    }
}

enum Lifecycle {
    Idle,
    Starting {
        token: CancellationToken,
    },
    Running {
        token: CancellationToken,
        gate_token: CancellationToken,
        gate_task: JoinHandle<()>,
    },
    Stopped,
}

#[derive(Debug, Default)]
struct RunState {
    phase: PipelinePhase,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    restarts: u32,
}

/// Cache, leadership and change analysis for one cluster
pub struct ClusterPipeline {
    config: ClusterConfig,
    cache: Arc<ObjectCache>,
    gate: Arc<LeadershipGate>,
    bridge: Arc<Bridge>,
    lifecycle: Mutex<Lifecycle>,
    run_state: RwLock<RunState>,
}

impl ClusterPipeline {
    pub fn new(config: ClusterConfig, client: Arc<dyn ClusterClient>, settings: PipelineSettings) -> Self {
        let cache = Arc::new(ObjectCache::new(
            config.name.clone(),
            config.namespace.clone(),
            Arc::clone(&client),
            settings.cache,
        ));
        let gate = Arc::new(LeadershipGate::new(
            config.name.clone(),
            settings.identity,
            client,
            settings.leader,
        ));
        let (changes, _) = broadcast::channel(settings.change_buffer.max(1));
        let bridge = Arc::new(Bridge {
            cluster: config.name.clone(),
            analyzer: ChangeAnalyzer::new(),
            gate: Arc::clone(&gate),
            synced: AtomicBool::new(false),
            sinks: RwLock::new(Vec::new()),
            changes,
            observed: AtomicU64::new(0),
        });
        cache.subscribe(bridge.clone());

        Self {
            config,
            cache,
            gate,
            bridge,
            lifecycle: Mutex::new(Lifecycle::Idle),
            run_state: RwLock::new(RunState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn add_sink(&self, sink: Arc<dyn ChangeSink>) {
        self.bridge.sinks.write().push(sink);
    }

    /// Receive every change this pipeline emits from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.bridge.changes.subscribe()
    }

    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    pub fn gate(&self) -> &Arc<LeadershipGate> {
        &self.gate
    }

    /// Leader with a synced cache
    pub fn is_actuating(&self) -> bool {
        self.bridge.is_actuating()
    }

    /// Cache events seen, whether or not they were actuated
    pub fn events_observed(&self) -> u64 {
        self.bridge.observed.load(Ordering::Relaxed)
    }

    /// Sync the cache, then campaign for leadership in the background.
    ///
    /// Returns once the cache has synced. A failed start can be retried.
    pub async fn start(&self, parent: &CancellationToken) -> ClusterResult<()> {
        let token = parent.child_token();
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Idle => {
                    *lifecycle = Lifecycle::Starting {
                        token: token.clone(),
                    }
                }
                _ => return Err(ClusterError::AlreadyStarted(self.config.name.clone())),
            }
        }
        self.run_state.write().phase = PipelinePhase::Starting;
        info!("Starting pipeline for cluster '{}'", self.config.name);

        if let Err(e) = self.cache.start(&token).await {
            let mut lifecycle = self.lifecycle.lock();
            if matches!(*lifecycle, Lifecycle::Starting { .. }) {
                *lifecycle = Lifecycle::Idle;
                let mut run_state = self.run_state.write();
                run_state.phase = PipelinePhase::Failed;
                run_state.last_error = Some(e.to_string());
            }
            return Err(e);
        }
        self.bridge.synced.store(true, Ordering::SeqCst);

        let gate_token = token.child_token();
        let gate_task = {
            let gate = Arc::clone(&self.gate);
            let run_token = gate_token.clone();
            let cluster = self.config.name.clone();
            let lost_cluster = cluster.clone();
            tokio::spawn(async move {
                gate.run(
                    run_token,
                    move |_| info!("Actuation enabled for cluster '{}'", cluster),
                    move || info!("Actuation disabled for cluster '{}'", lost_cluster),
                )
                .await
            })
        };

        let stale = {
            let mut lifecycle = self.lifecycle.lock();
            if matches!(*lifecycle, Lifecycle::Starting { .. }) {
                *lifecycle = Lifecycle::Running {
                    token,
                    gate_token,
                    gate_task,
                };
                None
            } else {
                Some((gate_token, gate_task))
            }
        };

        if let Some((gate_token, gate_task)) = stale {
            // stop() ran while the cache was listing
            gate_token.cancel();
            let _ = gate_task.await;
            self.cache.stop().await;
            return Err(ClusterError::Cancelled);
        }

        let mut run_state = self.run_state.write();
        run_state.phase = PipelinePhase::Running;
        run_state.last_error = None;
        run_state.started_at = Some(Utc::now());
        info!("Pipeline for cluster '{}' running", self.config.name);
        Ok(())
    }

    /// Release leadership, then stop the cache. No-op unless started.
    pub async fn stop(&self) {
        let previous = {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Idle | Lifecycle::Stopped => None,
                _ => Some(std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)),
            }
        };

        match previous {
            Some(Lifecycle::Running {
                token,
                gate_token,
                gate_task,
            }) => {
                gate_token.cancel();
                if let Err(e) = gate_task.await {
                    warn!(
                        "Leadership task of cluster '{}' ended abnormally: {}",
                        self.config.name, e
                    );
                }
                self.bridge.synced.store(false, Ordering::SeqCst);
                self.cache.stop().await;
                token.cancel();
            }
            Some(Lifecycle::Starting { token }) => {
                token.cancel();
                self.cache.stop().await;
            }
            _ => return,
        }

        self.run_state.write().phase = PipelinePhase::Stopped;
        info!("Pipeline for cluster '{}' stopped", self.config.name);
    }

    /// Point-in-time status; the first error among pipeline, cache and gate
    pub fn status(&self) -> ClusterStatus {
        let run_state = self.run_state.read();
        ClusterStatus {
            name: self.config.name.clone(),
            phase: run_state.phase,
            cache_synced: self.cache.has_synced(),
            is_leader: self.gate.is_leader(),
            last_error: run_state
                .last_error
                .clone()
                .or_else(|| self.cache.last_error())
                .or_else(|| self.gate.last_error()),
            started_at: run_state.started_at,
            restarts: run_state.restarts,
        }
    }

    /// Count a supervised restart attempt
    pub(crate) fn note_restart(&self) {
        self.run_state.write().restarts += 1;
        metrics::record_restart(&self.config.name);
    }
}

impl std::fmt::Debug for ClusterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterPipeline")
            .field("cluster", &self.config.name)
            .field("phase", &self.run_state.read().phase)
            .finish()
    }
}
