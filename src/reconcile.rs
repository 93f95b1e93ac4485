//! Reconciles the live backend set against an external cluster enumerator.
//!
//! Periodically diffs the currently-known endpoint set against a fresh
//! enumeration, tunnels and registers what's new, deregisters and untunnels
//! what's gone. Runs as a plain async task: any blocking I/O belongs inside
//! the `ClusterEnumerator`/`TunnelManager` implementations, not here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backend::BackendPool;
use crate::external::{ClusterEnumerator, ReplicaEndpoint, TunnelManager};

/// Timeout for the pre-tunnel `host:port/health` reachability probe (§4.6
/// step 1). A job whose worker hasn't come up yet is skipped for this tick
/// rather than tunnelled and registered unhealthy.
const JOB_HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Reconciler {
    enumerator: Arc<dyn ClusterEnumerator>,
    tunnels: Arc<dyn TunnelManager>,
    pools: Arc<dyn Fn(&str) -> Arc<BackendPool> + Send + Sync>,
    base_ports: HashMap<String, u16>,
    poll_interval: Duration,
    probe_client: reqwest::Client,
}

impl Reconciler {
    pub fn new(
        enumerator: Arc<dyn ClusterEnumerator>,
        tunnels: Arc<dyn TunnelManager>,
        pools: Arc<dyn Fn(&str) -> Arc<BackendPool> + Send + Sync>,
        base_ports: HashMap<String, u16>,
        poll_interval: Duration,
    ) -> Self {
        Self::with_probe_client(
            enumerator,
            tunnels,
            pools,
            base_ports,
            poll_interval,
            reqwest::Client::new(),
        )
    }

    /// Same as `new`, but with an explicit `reqwest::Client` for the
    /// pre-tunnel reachability probe — lets tests substitute a client
    /// pointed at a local mock server instead of the shared upstream client.
    pub fn with_probe_client(
        enumerator: Arc<dyn ClusterEnumerator>,
        tunnels: Arc<dyn TunnelManager>,
        pools: Arc<dyn Fn(&str) -> Arc<BackendPool> + Send + Sync>,
        base_ports: HashMap<String, u16>,
        poll_interval: Duration,
        probe_client: reqwest::Client,
    ) -> Self {
        Self {
            enumerator,
            tunnels,
            pools,
            base_ports,
            poll_interval,
            probe_client,
        }
    }

    /// Run until `shutdown` fires. A `poll_interval` of zero disables
    /// reconciliation entirely (the task exits immediately).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if self.poll_interval.is_zero() {
            info!("reconciliation disabled (poll_interval=0)");
            return;
        }

        info!(poll_interval_secs = self.poll_interval.as_secs(), "starting reconciliation loop");

        let mut known: HashSet<ReplicaEndpoint> = HashSet::new();
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once(&mut known).await {
                        error!(error = %e, "reconciliation poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciliation loop shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn poll_once(&self, known: &mut HashSet<ReplicaEndpoint>) -> anyhow::Result<()> {
        let jobs = self.enumerator.list_jobs().await?;

        let candidates: Vec<ReplicaEndpoint> = jobs
            .values()
            .filter_map(|job| ReplicaEndpoint::from_job(job, &self.base_ports))
            .collect();

        let mut current = HashSet::with_capacity(candidates.len());
        for endpoint in candidates {
            if known.contains(&endpoint) || self.job_is_reachable(&endpoint).await {
                current.insert(endpoint);
            } else {
                debug!(
                    model = %endpoint.model, node = %endpoint.node, port = endpoint.port,
                    "job health check unreachable, skipping this tick"
                );
            }
        }

        for added in current.difference(known) {
            info!(
                model = %added.model, node = %added.node, port = added.port,
                partition = %added.partition, "new backend discovered"
            );
            if let Err(e) = self.tunnels.add(&added.node, added.port).await {
                warn!(error = %e, node = %added.node, port = added.port, "tunnel add failed");
                continue;
            }
            (self.pools)(&added.model).add_backend("localhost", added.port, &added.partition);
        }

        for removed in known.difference(&current) {
            info!(model = %removed.model, node = %removed.node, port = removed.port, "backend removed");
            (self.pools)(&removed.model).remove_backend("localhost", removed.port);
            if let Err(e) = self.tunnels.remove(&removed.node, removed.port).await {
                warn!(error = %e, node = %removed.node, port = removed.port, "tunnel remove failed");
            }
        }

        *known = current;
        Ok(())
    }

    /// Pre-tunnel reachability probe: `GET {node}:{port}/health` within
    /// `JOB_HEALTH_PROBE_TIMEOUT`. Only called for endpoints not already in
    /// the known set — a replica the proxy has already tunnelled and
    /// registered is the health/load refresher's responsibility to track,
    /// not the reconciliation loop's.
    async fn job_is_reachable(&self, endpoint: &ReplicaEndpoint) -> bool {
        let url = format!("http://{}:{}/health", endpoint.node, endpoint.port);
        matches!(
            self.probe_client
                .get(&url)
                .timeout(JOB_HEALTH_PROBE_TIMEOUT)
                .send()
                .await,
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection()
        )
    }
}
