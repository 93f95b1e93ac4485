//! External collaborator boundaries for the reconciliation loop.
//!
//! `ClusterEnumerator` and `TunnelManager` are kept as async traits so the
//! reconciliation loop can run against fakes in tests without a real
//! scheduler or SSH tunnel.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::info;

/// One SLURM-like job entry as the enumerator sees it.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub node: String,
    pub command: String,
    pub partition: String,
}

/// Enumerates the currently live job set behind the cluster.
#[async_trait]
pub trait ClusterEnumerator: Send + Sync {
    async fn list_jobs(&self) -> anyhow::Result<HashMap<String, JobInfo>>;
}

/// Fixed job map, for tests and local development.
pub struct StaticClusterEnumerator {
    jobs: HashMap<String, JobInfo>,
}

impl StaticClusterEnumerator {
    pub fn new(jobs: HashMap<String, JobInfo>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl ClusterEnumerator for StaticClusterEnumerator {
    async fn list_jobs(&self) -> anyhow::Result<HashMap<String, JobInfo>> {
        Ok(self.jobs.clone())
    }
}

/// How a replica's port is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    /// Derived from a model's configured base port and the replica index.
    Derived { base: u16, replica_index: u16 },
    /// Reported directly by the enumerator.
    Explicit(u16),
}

impl PortSource {
    pub fn resolve(self) -> u16 {
        match self {
            PortSource::Derived { base, replica_index } => base + replica_index * 10,
            PortSource::Explicit(port) => port,
        }
    }
}

/// A single reconciled backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaEndpoint {
    pub model: String,
    pub node: String,
    pub port: u16,
    pub partition: String,
}

impl ReplicaEndpoint {
    /// Derive an endpoint from a job's command path and a model's base
    /// port, following the `start_vllm_<model>[_<replica>]` naming
    /// convention: strip the `start_vllm_` prefix from the command's file
    /// stem, split a trailing `_<digits>` off as the replica index (else
    /// replica index 0), then resolve the port via `PortSource`.
    pub fn from_job(job: &JobInfo, base_ports: &HashMap<String, u16>) -> Option<Self> {
        if job.command.is_empty() {
            return None;
        }

        let stem = Path::new(&job.command).file_stem()?.to_str()?;
        let stem = stem.strip_prefix("start_vllm_").unwrap_or(stem);

        let (model, replica_index) = match stem.rsplit_once('_') {
            Some((prefix, suffix)) if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) => {
                (prefix.to_string(), suffix.parse::<u16>().ok()?)
            }
            _ => (stem.to_string(), 0),
        };

        let base = *base_ports.get(&model)?;
        let port = PortSource::Derived { base, replica_index }.resolve();

        Some(ReplicaEndpoint {
            model,
            node: job.node.clone(),
            port,
            partition: job.partition.clone(),
        })
    }
}

/// Makes a remote `host:port` reachable as `localhost:port` for the
/// lifetime of the tunnel. Idempotent: adding an already-tunnelled endpoint
/// or removing an absent one is a no-op, not an error.
#[async_trait]
pub trait TunnelManager: Send + Sync {
    async fn add(&self, host: &str, port: u16) -> anyhow::Result<()>;
    async fn remove(&self, host: &str, port: u16) -> anyhow::Result<()>;
}

/// No-op tunnel manager, for setups where backends are already reachable
/// directly (no SSH hop needed).
pub struct NullTunnelManager;

#[async_trait]
impl TunnelManager for NullTunnelManager {
    async fn add(&self, _host: &str, _port: u16) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove(&self, _host: &str, _port: u16) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Wraps another `TunnelManager`, logging every add/remove before
/// delegating. Useful for local/dev runs where tunnel setup is implicit.
pub struct LoggingTunnelManager<T> {
    inner: T,
}

impl<T> LoggingTunnelManager<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<T: TunnelManager> TunnelManager for LoggingTunnelManager<T> {
    async fn add(&self, host: &str, port: u16) -> anyhow::Result<()> {
        info!(host, port, "tunnel add");
        self.inner.add(host, port).await
    }

    async fn remove(&self, host: &str, port: u16) -> anyhow::Result<()> {
        info!(host, port, "tunnel remove");
        self.inner.remove(host, port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(node: &str, command: &str, partition: &str) -> JobInfo {
        JobInfo {
            node: node.to_string(),
            command: command.to_string(),
            partition: partition.to_string(),
        }
    }

    fn base_ports() -> HashMap<String, u16> {
        [("llama".to_string(), 5900)].into_iter().collect()
    }

    #[test]
    fn derives_replica_zero_without_suffix() {
        let j = job("node01", "/scripts/start_vllm_llama.sh", "gpu");
        let ep = ReplicaEndpoint::from_job(&j, &base_ports()).unwrap();
        assert_eq!(ep.model, "llama");
        assert_eq!(ep.port, 5900);
    }

    #[test]
    fn derives_replica_index_from_suffix() {
        let j = job("node02", "/scripts/start_vllm_llama_2.sh", "gpu");
        let ep = ReplicaEndpoint::from_job(&j, &base_ports()).unwrap();
        assert_eq!(ep.port, 5900 + 2 * 10);
    }

    #[test]
    fn unknown_model_is_skipped() {
        let j = job("node03", "/scripts/start_vllm_unknown.sh", "gpu");
        assert!(ReplicaEndpoint::from_job(&j, &base_ports()).is_none());
    }

    #[test]
    fn empty_command_is_skipped() {
        let j = job("node03", "", "gpu");
        assert!(ReplicaEndpoint::from_job(&j, &base_ports()).is_none());
    }

    #[test]
    fn explicit_port_source_bypasses_derivation() {
        assert_eq!(PortSource::Explicit(9999).resolve(), 9999);
    }

    #[tokio::test]
    async fn null_tunnel_manager_is_always_ok() {
        let t = NullTunnelManager;
        assert!(t.add("h", 1).await.is_ok());
        assert!(t.remove("h", 1).await.is_ok());
    }
}
