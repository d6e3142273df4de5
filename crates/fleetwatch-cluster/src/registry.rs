//! Cluster registry
//!
//! Holds the known clusters with their enabled/primary flags and hands out
//! one memoised API client per cluster. The "at most one primary" rule is
//! checked on every mutation, not only when the fleet is loaded.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use fleetwatch_core::config::validate_clusters;
use fleetwatch_core::types::ClusterConfig;

use crate::client::{ClientFactory, ClusterClient};
use crate::error::{ClusterError, ClusterResult};

type ClientCell = Arc<OnceCell<Arc<dyn ClusterClient>>>;

/// Registry of clusters and their lazily connected clients
pub struct ClusterRegistry {
    clusters: RwLock<BTreeMap<String, ClusterConfig>>,
    clients: RwLock<HashMap<String, ClientCell>>,
    factory: Arc<dyn ClientFactory>,
}

impl ClusterRegistry {
    pub fn new(configs: Vec<ClusterConfig>, factory: Arc<dyn ClientFactory>) -> ClusterResult<Self> {
        validate_clusters(&configs)?;
        let clusters = configs.into_iter().map(|c| (c.name.clone(), c)).collect();
        Ok(Self {
            clusters: RwLock::new(clusters),
            clients: RwLock::new(HashMap::new()),
            factory,
        })
    }

    /// Register a cluster; rejects duplicates and a second primary
    pub fn add(&self, config: ClusterConfig) -> ClusterResult<()> {
        let mut clusters = self.clusters.write();
        if clusters.contains_key(&config.name) {
            return Err(ClusterError::ClusterAlreadyExists(config.name));
        }

        let mut candidate: Vec<ClusterConfig> = clusters.values().cloned().collect();
        candidate.push(config.clone());
        validate_clusters(&candidate)?;

        info!("Registered cluster '{}'", config.name);
        clusters.insert(config.name.clone(), config);
        Ok(())
    }

    /// Unregister a cluster and drop its client; `None` if it was unknown
    pub fn remove(&self, name: &str) -> Option<ClusterConfig> {
        let removed = self.clusters.write().remove(name);
        if removed.is_some() {
            self.clients.write().remove(name);
            info!("Unregistered cluster '{}'", name);
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<ClusterConfig> {
        self.clusters.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clusters.read().contains_key(name)
    }

    /// All clusters, ordered by name
    pub fn list(&self) -> Vec<ClusterConfig> {
        self.clusters.read().values().cloned().collect()
    }

    pub fn enabled(&self) -> Vec<ClusterConfig> {
        self.clusters
            .read()
            .values()
            .filter(|c| c.enabled)
            .cloned()
            .collect()
    }

    pub fn primary(&self) -> Option<ClusterConfig> {
        self.clusters.read().values().find(|c| c.primary).cloned()
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> ClusterResult<()> {
        let mut clusters = self.clusters.write();
        let cluster = clusters
            .get_mut(name)
            .ok_or_else(|| ClusterError::ClusterNotFound(name.to_string()))?;
        cluster.enabled = enabled;
        Ok(())
    }

    /// Make `name` the primary cluster, clearing the flag everywhere else
    pub fn set_primary(&self, name: &str) -> ClusterResult<()> {
        let mut clusters = self.clusters.write();
        if !clusters.contains_key(name) {
            return Err(ClusterError::ClusterNotFound(name.to_string()));
        }
        for (cluster_name, cluster) in clusters.iter_mut() {
            cluster.primary = cluster_name == name;
        }
        info!("Cluster '{}' is now primary", name);
        Ok(())
    }

    /// Connected client for `name`, created on first use.
    ///
    /// A failed connect is not memoised; the next call tries again.
    pub async fn client(&self, name: &str) -> ClusterResult<Arc<dyn ClusterClient>> {
        let config = self
            .get(name)
            .ok_or_else(|| ClusterError::ClusterNotFound(name.to_string()))?;

        let cell = {
            let mut clients = self.clients.write();
            Arc::clone(clients.entry(name.to_string()).or_default())
        };

        let client = cell
            .get_or_try_init(|| async {
                debug!("Connecting client for cluster '{}'", name);
                self.factory.connect(&config).await
            })
            .await?;
        Ok(Arc::clone(client))
    }
}

impl std::fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("clusters", &self.clusters.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
