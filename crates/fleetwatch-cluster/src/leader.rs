//! Per-cluster leader election
//!
//! A three-state machine (follower, acquiring, leader) over a time-bounded
//! lease stored in the cluster. The holder renews every retry period and
//! steps down once a renewal has not succeeded within the renew deadline.
//! On cancellation a leader releases the lease so a standby can take over
//! at its next retry instead of waiting for expiry.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetwatch_core::config::LeaderConfig;
use fleetwatch_core::types::{LeaderRole, LeaseRecord, LeaseState};
use fleetwatch_core::RELEASED_LEASE_DURATION_MS;

use crate::client::ClusterClient;
use crate::error::{ClusterError, ClusterResult};
use crate::metrics;

/// Lease name and timing parameters
#[derive(Debug, Clone)]
pub struct LeaseTimings {
    pub lease_name: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LeaseTimings {
    fn default() -> Self {
        Self::from(&LeaderConfig::default())
    }
}

impl From<&LeaderConfig> for LeaseTimings {
    fn from(config: &LeaderConfig) -> Self {
        Self {
            lease_name: config.lease_name.clone(),
            lease_duration: config.lease_duration(),
            renew_deadline: config.renew_deadline(),
            retry_period: config.retry_period(),
        }
    }
}

impl LeaseTimings {
    pub fn validate(&self) -> ClusterResult<()> {
        if self.retry_period.is_zero()
            || self.retry_period >= self.renew_deadline
            || self.renew_deadline >= self.lease_duration
        {
            return Err(ClusterError::InvalidConfig(format!(
                "lease timings must satisfy 0 < retry_period ({:?}) < renew_deadline ({:?}) < lease_duration ({:?})",
                self.retry_period, self.renew_deadline, self.lease_duration
            )));
        }
        Ok(())
    }
}

/// When this replica first saw the current version of another holder's lease
#[derive(Debug, Clone, Copy)]
struct Observation {
    resource_version: u64,
    at: Instant,
}

enum HoldOutcome {
    /// Cancelled while leading; carries the latest known record for release
    Cancelled(LeaseRecord),
    Lost,
}

/// Leader election for one cluster
pub struct LeadershipGate {
    client: Arc<dyn ClusterClient>,
    timings: LeaseTimings,
    state: RwLock<LeaseState>,
    last_error: RwLock<Option<String>>,
    /// Set once `on_lost` has fired for the current term
    lost_notified: AtomicBool,
}

impl LeadershipGate {
    pub fn new(
        cluster: impl Into<String>,
        identity: impl Into<String>,
        client: Arc<dyn ClusterClient>,
        timings: LeaseTimings,
    ) -> Self {
        let state = LeaseState::new(
            cluster,
            identity,
            timings.lease_duration.as_millis() as u64,
            timings.renew_deadline.as_millis() as u64,
            timings.retry_period.as_millis() as u64,
        );
        Self {
            client,
            timings,
            state: RwLock::new(state),
            last_error: RwLock::new(None),
            lost_notified: AtomicBool::new(true),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state.read().is_leader
    }

    pub fn role(&self) -> LeaderRole {
        self.state.read().role
    }

    /// Snapshot of the election state
    pub fn state(&self) -> LeaseState {
        self.state.read().clone()
    }

    pub fn identity(&self) -> String {
        self.state.read().holder_identity.clone()
    }

    pub fn timings(&self) -> &LeaseTimings {
        &self.timings
    }

    /// Most recent lease API failure; cleared by the next successful call
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Campaign for the lease until `token` is cancelled.
    ///
    /// `on_acquired` receives a token that is cancelled when this term of
    /// leadership ends. `on_lost` fires once per term, after `is_leader`
    /// has turned false.
    pub async fn run<A, L>(&self, token: CancellationToken, on_acquired: A, on_lost: L)
    where
        A: Fn(CancellationToken) + Send + Sync,
        L: Fn() + Send + Sync,
    {
        let (cluster, identity) = {
            let state = self.state.read();
            (state.cluster_name.clone(), state.holder_identity.clone())
        };
        let mut observation: Option<Observation> = None;

        loop {
            let lease = loop {
                if token.is_cancelled() {
                    self.set_role(LeaderRole::Follower);
                    return;
                }
                self.set_role(LeaderRole::Acquiring);
                match self.try_acquire(&token, &identity, &mut observation).await {
                    Ok(Some(lease)) => break lease,
                    Ok(None) => self.set_role(LeaderRole::Follower),
                    Err(ClusterError::Cancelled) => {
                        self.set_role(LeaderRole::Follower);
                        return;
                    }
                    Err(e) => {
                        debug!("Lease acquisition on cluster '{}' failed: {}", cluster, e);
                        self.set_error(&e);
                        self.set_role(LeaderRole::Follower);
                    }
                }

                tokio::select! {
                    _ = token.cancelled() => {
                        self.set_role(LeaderRole::Follower);
                        return;
                    }
                    _ = tokio::time::sleep(self.timings.retry_period) => {}
                }
            };

            {
                let mut state = self.state.write();
                state.role = LeaderRole::Leader;
                state.is_leader = true;
                state.current_holder = Some(identity.clone());
            }
            self.clear_error();
            metrics::set_leader(&cluster, true);
            info!(
                "Acquired leadership of cluster '{}' as '{}' (transitions: {})",
                cluster, identity, lease.lease_transitions
            );

            let term = token.child_token();
            self.lost_notified.store(false, Ordering::SeqCst);
            on_acquired(term.clone());

            let outcome = self.hold(&token, &identity, lease).await;

            term.cancel();
            {
                let mut state = self.state.write();
                state.role = LeaderRole::Follower;
                state.is_leader = false;
            }
            metrics::set_leader(&cluster, false);
            if !self.lost_notified.swap(true, Ordering::SeqCst) {
                on_lost();
            }

            match outcome {
                HoldOutcome::Cancelled(lease) => {
                    info!("Stepping down as leader of cluster '{}'", cluster);
                    self.release(&identity, lease).await;
                    return;
                }
                HoldOutcome::Lost => {
                    warn!("Lost leadership of cluster '{}'", cluster);
                    observation = None;
                }
            }
        }
    }

    /// One acquisition attempt; `Ok(None)` when another holder's lease is still valid
    async fn try_acquire(
        &self,
        token: &CancellationToken,
        identity: &str,
        observation: &mut Option<Observation>,
    ) -> ClusterResult<Option<LeaseRecord>> {
        let limit = self.timings.renew_deadline;
        let current = bounded(token, limit, self.client.get_lease(&self.timings.lease_name))
            .await
            .ok_or(ClusterError::Cancelled)??;

        let now = Utc::now();
        let duration_ms = self.timings.lease_duration.as_millis() as u64;
        let candidate = match current {
            None => LeaseRecord {
                name: self.timings.lease_name.clone(),
                holder_identity: Some(identity.to_string()),
                lease_duration_ms: duration_ms,
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_transitions: 0,
                resource_version: 0,
            },
            Some(existing) => {
                self.state.write().current_holder = existing.holder_identity.clone();

                if !existing.is_released() && !existing.is_held_by(identity) {
                    let seen = match observation {
                        Some(seen) if seen.resource_version == existing.resource_version => *seen,
                        _ => Observation {
                            resource_version: existing.resource_version,
                            at: Instant::now(),
                        },
                    };
                    *observation = Some(seen);
                    if seen.at.elapsed() < Duration::from_millis(existing.lease_duration_ms) {
                        return Ok(None);
                    }
                    debug!(
                        "Lease '{}' held by {:?} expired, taking over",
                        existing.name, existing.holder_identity
                    );
                }

                let mut next = existing.clone();
                if !existing.is_held_by(identity) {
                    next.acquire_time = Some(now);
                    next.lease_transitions += 1;
                }
                next.holder_identity = Some(identity.to_string());
                next.lease_duration_ms = duration_ms;
                next.renew_time = Some(now);
                next
            }
        };

        match bounded(token, limit, self.client.try_acquire_or_renew(candidate)).await {
            None => Err(ClusterError::Cancelled),
            Some(Ok(lease)) => Ok(Some(lease)),
            // Lost the race to another candidate
            Some(Err(ClusterError::LeaseConflict(_))) => Ok(None),
            Some(Err(e)) => Err(e),
        }
    }

    /// Renew until cancelled or until renewal stalls past the deadline
    async fn hold(&self, token: &CancellationToken, identity: &str, mut lease: LeaseRecord) -> HoldOutcome {
        let mut last_renew = Instant::now();

        loop {
            tokio::select! {
                _ = token.cancelled() => return HoldOutcome::Cancelled(lease),
                _ = tokio::time::sleep(self.timings.retry_period) => {}
            }

            let remaining = self.remaining(last_renew);
            let mut renewal = lease.clone();
            renewal.renew_time = Some(Utc::now());

            let Some(attempt) =
                bounded(token, remaining, self.client.try_acquire_or_renew(renewal)).await
            else {
                return HoldOutcome::Cancelled(lease);
            };

            match attempt {
                Ok(renewed) => {
                    lease = renewed;
                    last_renew = Instant::now();
                    self.clear_error();
                }
                Err(ClusterError::LeaseConflict(_)) => {
                    let remaining = self.remaining(last_renew);
                    let Some(current) =
                        bounded(token, remaining, self.client.get_lease(&self.timings.lease_name)).await
                    else {
                        return HoldOutcome::Cancelled(lease);
                    };
                    match current {
                        Ok(Some(current)) if current.is_held_by(identity) => lease = current,
                        Ok(current) => {
                            let holder = current.and_then(|c| c.holder_identity);
                            debug!("Lease '{}' taken over by {:?}", lease.name, holder);
                            self.state.write().current_holder = holder;
                            return HoldOutcome::Lost;
                        }
                        Err(e) => self.set_error(&e),
                    }
                }
                Err(e) => {
                    warn!("Failed to renew lease '{}': {}", lease.name, e);
                    self.set_error(&e);
                }
            }

            if last_renew.elapsed() >= self.timings.renew_deadline {
                warn!(
                    "Lease '{}' not renewed within {:?}",
                    lease.name, self.timings.renew_deadline
                );
                return HoldOutcome::Lost;
            }
        }
    }

    /// Hand the lease back with no holder so a standby can take it at once
    async fn release(&self, identity: &str, lease: LeaseRecord) {
        let mut record = lease;
        for _ in 0..2 {
            let mut released = record.clone();
            released.holder_identity = None;
            released.lease_duration_ms = RELEASED_LEASE_DURATION_MS;
            released.renew_time = Some(Utc::now());

            let attempt = tokio::time::timeout(
                self.timings.renew_deadline,
                self.client.try_acquire_or_renew(released),
            )
            .await;

            match attempt {
                Ok(Ok(_)) => {
                    self.state.write().current_holder = None;
                    info!("Released lease '{}'", record.name);
                    return;
                }
                // A renewal landed after our last read; retry on the fresh record
                Ok(Err(ClusterError::LeaseConflict(_))) => {
                    let current = tokio::time::timeout(
                        self.timings.renew_deadline,
                        self.client.get_lease(&record.name),
                    )
                    .await;
                    match current {
                        Ok(Ok(Some(current))) if current.is_held_by(identity) => record = current,
                        _ => return,
                    }
                }
                Ok(Err(e)) => {
                    warn!("Failed to release lease '{}': {}", record.name, e);
                    return;
                }
                Err(_) => {
                    warn!("Timed out releasing lease '{}'", record.name);
                    return;
                }
            }
        }
    }

    /// Time left before the renew deadline measured from `last_renew`
    fn remaining(&self, last_renew: Instant) -> Duration {
        self.timings
            .renew_deadline
            .saturating_sub(last_renew.elapsed())
    }

    fn set_role(&self, role: LeaderRole) {
        self.state.write().role = role;
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

/// Run one lease API call for at most `limit`; `None` once `token` is cancelled
async fn bounded<T>(
    token: &CancellationToken,
    limit: Duration,
    call: impl Future<Output = ClusterResult<T>>,
) -> Option<ClusterResult<T>> {
    tokio::select! {
        _ = token.cancelled() => None,
        result = tokio::time::timeout(limit, call) => {
            Some(result.unwrap_or_else(|_| Err(ClusterError::Timeout(limit))))
        }
    }
}

impl std::fmt::Debug for LeadershipGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("LeadershipGate")
            .field("cluster", &state.cluster_name)
            .field("identity", &state.holder_identity)
            .field("role", &state.role)
            .finish()
    }
}
