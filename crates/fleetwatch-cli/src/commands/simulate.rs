//! simulate command - run the fleet pipeline against in-memory clusters

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use fleetwatch_cluster::{
    CachedObject, ClientFactory, ClusterConfig, ClusterRegistry, InMemoryCluster, InMemoryFactory,
    LoggingSink, ManagerSettings, MultiClusterManager,
};
use fleetwatch_core::FleetConfig;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Clusters and scripted changes driving a simulation
#[derive(Debug, Deserialize)]
pub struct Fixture {
    pub clusters: Vec<FixtureCluster>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct FixtureCluster {
    pub name: String,
    #[serde(default = "default_reachable")]
    pub reachable: bool,
    #[serde(default)]
    pub objects: Vec<CachedObject>,
}

fn default_reachable() -> bool {
    true
}

/// One scripted change, applied `after_ms` after the previous step
#[derive(Debug, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub after_ms: u64,
    pub cluster: String,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Apply { object: CachedObject },
    Delete { namespace: String, name: String },
    SetReachable { reachable: bool },
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let fixture: Fixture = serde_json::from_str(content).context("parsing fixture")?;
        for step in &fixture.steps {
            if !fixture.clusters.iter().any(|c| c.name == step.cluster) {
                anyhow::bail!("step targets unknown cluster '{}'", step.cluster);
            }
        }
        Ok(fixture)
    }

    /// Cluster configs for fixtures run without a config file; the first is primary
    pub fn cluster_configs(&self) -> Vec<ClusterConfig> {
        self.clusters
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let config = ClusterConfig::new(&c.name);
                if i == 0 {
                    config.primary()
                } else {
                    config
                }
            })
            .collect()
    }

    fn build_factory(&self) -> InMemoryFactory {
        let factory = InMemoryFactory::new();
        for spec in &self.clusters {
            let cluster = factory.register(InMemoryCluster::new(&spec.name));
            for object in &spec.objects {
                cluster.apply(object.clone());
            }
            cluster.set_reachable(spec.reachable);
        }
        factory
    }
}

pub async fn execute(
    config: &FleetConfig,
    fixture_path: &Path,
    status_interval: u64,
    duration: Option<u64>,
) -> Result<()> {
    let fixture = Fixture::load(fixture_path)?;
    let mut config = config.clone();
    if config.clusters.is_empty() {
        config.clusters = fixture.cluster_configs();
    }
    config.validate()?;

    let factory = Arc::new(fixture.build_factory());
    let registry = Arc::new(ClusterRegistry::new(
        config.clusters.clone(),
        Arc::clone(&factory) as Arc<dyn ClientFactory>,
    )?);

    let manager = MultiClusterManager::new(registry, ManagerSettings::from_config(&config));
    manager.add_sink(Arc::new(LoggingSink));
    let shutdown = CancellationToken::new();
    manager.start(&shutdown).await?;
    info!(
        clusters = config.enabled_clusters().count(),
        steps = fixture.steps.len(),
        "Simulation started"
    );

    let script = tokio::spawn(run_steps(fixture.steps, Arc::clone(&factory)));

    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut ticker = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => super::print_status(&manager.cluster_status()),
            _ = &mut deadline => break,
            _ = &mut ctrl_c => {
                info!("Received Ctrl-C, stopping");
                break;
            }
        }
    }

    script.abort();
    manager.stop().await?;
    shutdown.cancel();
    super::print_status(&manager.cluster_status());
    println!("{} simulation stopped", "✓".green());
    Ok(())
}

async fn run_steps(steps: Vec<Step>, factory: Arc<InMemoryFactory>) {
    for step in steps {
        tokio::time::sleep(Duration::from_millis(step.after_ms)).await;
        let Some(cluster) = factory.cluster(&step.cluster) else {
            warn!(cluster = %step.cluster, "Skipping step for unknown cluster");
            continue;
        };
        match step.action {
            Action::Apply { object } => {
                let applied = cluster.apply(object);
                info!(
                    cluster = %step.cluster,
                    object = %applied.key(),
                    version = %applied.resource_version,
                    "Applied object"
                );
            }
            Action::Delete { namespace, name } => {
                if !cluster.delete(&namespace, &name) {
                    warn!(cluster = %step.cluster, %namespace, %name, "Delete of missing object");
                }
            }
            Action::SetReachable { reachable } => {
                cluster.set_reachable(reachable);
                info!(cluster = %step.cluster, reachable, "Changed reachability");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "clusters": [
            {
                "name": "prod",
                "objects": [{
                    "namespace": "default",
                    "name": "web",
                    "spec": {
                        "replicas": 2,
                        "containers": [{"name": "app", "image": "app:1.0"}]
                    }
                }]
            },
            {"name": "dr", "reachable": false}
        ],
        "steps": [
            {"after_ms": 100, "cluster": "dr", "action": "set_reachable", "reachable": true},
            {"cluster": "prod", "action": "delete", "namespace": "default", "name": "web"}
        ]
    }"#;

    #[test]
    fn test_parse_fixture() {
        let fixture = Fixture::parse(FIXTURE).unwrap();
        assert_eq!(fixture.clusters.len(), 2);
        assert!(fixture.clusters[0].reachable);
        assert!(!fixture.clusters[1].reachable);
        assert_eq!(fixture.clusters[0].objects[0].spec.effective_replicas(), 2);
        assert!(matches!(
            fixture.steps[0].action,
            Action::SetReachable { reachable: true }
        ));
        assert_eq!(fixture.steps[1].after_ms, 0);
        assert!(matches!(&fixture.steps[1].action, Action::Delete { name, .. } if name == "web"));
    }

    #[test]
    fn test_first_fixture_cluster_is_primary() {
        let fixture = Fixture::parse(FIXTURE).unwrap();
        let configs = fixture.cluster_configs();
        assert!(configs[0].primary);
        assert!(!configs[1].primary);
        assert_eq!(configs[1].name, "dr");
    }

    #[test]
    fn test_rejects_step_for_unknown_cluster() {
        let content = r#"{
            "clusters": [{"name": "prod"}],
            "steps": [{"cluster": "qa", "action": "set_reachable", "reachable": false}]
        }"#;
        assert!(Fixture::parse(content).is_err());
    }

    #[tokio::test]
    async fn test_factory_seeds_objects() {
        let fixture = Fixture::parse(FIXTURE).unwrap();
        let factory = fixture.build_factory();
        let prod = factory.cluster("prod").unwrap();
        let web = prod.object("default", "web").unwrap();
        assert_eq!(web.resource_version, "1");
        assert!(factory.cluster("dr").is_some());
    }
}
