//! Backend and backend-pool management.
//!
//! A `BackendPool` owns every replica registered under one pool name (the
//! model alias the proxy exposes). Selection and in-flight bookkeeping share
//! a single `std::sync::Mutex` guarding the backend list: the critical
//! section never crosses an `.await`, so a synchronous lock is both correct
//! and lets `InFlightGuard::drop` release the slot without spawning a task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tracing::{debug, info};

use crate::config::Strategy;
use crate::strategy;

const LATENCY_EMA_ALPHA: f64 = 0.2;
const CONSECUTIVE_TIMEOUT_LIMIT: u32 = 3;

/// A single upstream replica.
#[derive(Debug, Clone)]
pub struct Backend {
    pub host: String,
    pub port: u16,
    pub partition: String,
    pub healthy: bool,
    pub last_check: Option<Instant>,
    pub request_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub gpu_load: u32,
    pub last_load_refresh: Option<Instant>,
    pub inflight: u32,
    pub consecutive_timeouts: u32,
}

impl Backend {
    fn new(host: String, port: u16, partition: String) -> Self {
        Self {
            host,
            port,
            partition,
            healthy: true,
            last_check: None,
            request_count: 0,
            error_count: 0,
            avg_latency_ms: 0.0,
            gpu_load: 0,
            last_load_refresh: None,
            inflight: 0,
            consecutive_timeouts: 0,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Record a completed upstream call. Only successful calls feed the
    /// latency EMA; failures only bump the error counter.
    pub fn record_request(&mut self, latency_ms: f64, success: bool) {
        self.request_count += 1;
        if success {
            self.avg_latency_ms =
                LATENCY_EMA_ALPHA * latency_ms + (1.0 - LATENCY_EMA_ALPHA) * self.avg_latency_ms;
        } else {
            self.error_count += 1;
        }
    }

    /// Record a timeout; flips unhealthy after the third consecutive one.
    pub fn record_timeout(&mut self) {
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts >= CONSECUTIVE_TIMEOUT_LIMIT {
            self.healthy = false;
        }
    }
}

/// Copy of the selection-relevant fields of a `Backend`, handed to the pure
/// `strategy::select` function so it never needs to see pool internals.
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub host: String,
    pub port: u16,
    pub inflight: u32,
    pub avg_latency_ms: f64,
    pub gpu_load: u32,
}

/// Per-backend statistics surfaced on `/stats` and `/queue/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackendStats {
    pub url: String,
    pub healthy: bool,
    pub request_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub gpu_load: u32,
    pub inflight: u32,
    pub partition: String,
}

struct PoolInner {
    backends: Vec<Backend>,
    rotation: AtomicUsize,
}

/// A named group of backends, addressable by the proxy-side model alias.
pub struct BackendPool {
    name: String,
    inner: Mutex<PoolInner>,
}

impl BackendPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(PoolInner {
                backends: Vec::new(),
                rotation: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a backend, or mark an existing `(host, port)` healthy and update
    /// its partition if it's already registered.
    pub fn add_backend(&self, host: &str, port: u16, partition: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .backends
            .iter_mut()
            .find(|b| b.host == host && b.port == port)
        {
            existing.healthy = true;
            if !partition.is_empty() {
                existing.partition = partition.to_string();
            }
            return;
        }
        inner
            .backends
            .push(Backend::new(host.to_string(), port, partition.to_string()));
        debug!(pool = %self.name, host, port, "backend registered");
    }

    /// Remove a backend. Returns whether one was actually removed.
    pub fn remove_backend(&self, host: &str, port: u16) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.backends.len();
        inner.backends.retain(|b| !(b.host == host && b.port == port));
        inner.backends.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().backends.is_empty()
    }

    pub fn backend_urls(&self) -> Vec<String> {
        self.inner.lock().unwrap().backends.iter().map(Backend::url).collect()
    }

    pub fn any_healthy(&self) -> bool {
        self.inner.lock().unwrap().backends.iter().any(|b| b.healthy)
    }

    pub fn stats(&self) -> Vec<BackendStats> {
        self.inner
            .lock()
            .unwrap()
            .backends
            .iter()
            .map(|b| BackendStats {
                url: b.url(),
                healthy: b.healthy,
                request_count: b.request_count,
                error_count: b.error_count,
                avg_latency_ms: b.avg_latency_ms,
                gpu_load: b.gpu_load,
                inflight: b.inflight,
                partition: b.partition.clone(),
            })
            .collect()
    }

    /// Select a healthy backend per `strategy`, increment its in-flight
    /// counter, and return a guard that releases it on drop. `None` if the
    /// pool has no healthy backend right now.
    pub fn acquire(self: &Arc<Self>, strategy: &Strategy) -> Option<InFlightGuard> {
        let mut inner = self.inner.lock().unwrap();

        let healthy_idx: Vec<usize> = inner
            .backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.healthy)
            .map(|(i, _)| i)
            .collect();
        if healthy_idx.is_empty() {
            return None;
        }

        let snapshots: Vec<BackendSnapshot> = healthy_idx
            .iter()
            .map(|&i| {
                let b = &inner.backends[i];
                BackendSnapshot {
                    host: b.host.clone(),
                    port: b.port,
                    inflight: b.inflight,
                    avg_latency_ms: b.avg_latency_ms,
                    gpu_load: b.gpu_load,
                }
            })
            .collect();

        let rotation = inner.rotation.load(Ordering::Relaxed);
        let (picked, next) = strategy::select(&snapshots, strategy, rotation);
        inner.rotation.store(next, Ordering::Relaxed);

        let chosen = healthy_idx[picked];
        let backend = &mut inner.backends[chosen];
        backend.inflight += 1;
        let snapshot = Backend {
            host: backend.host.clone(),
            port: backend.port,
            partition: backend.partition.clone(),
            healthy: backend.healthy,
            last_check: backend.last_check,
            request_count: backend.request_count,
            error_count: backend.error_count,
            avg_latency_ms: backend.avg_latency_ms,
            gpu_load: backend.gpu_load,
            last_load_refresh: backend.last_load_refresh,
            inflight: backend.inflight,
            consecutive_timeouts: backend.consecutive_timeouts,
        };

        Some(InFlightGuard {
            pool: Arc::clone(self),
            host: snapshot.host.clone(),
            port: snapshot.port,
            released: false,
            backend: snapshot,
        })
    }

    /// Apply the outcome of a completed upstream call to the backend
    /// identified by `(host, port)`. No-op if it has since been removed.
    pub fn record_outcome(&self, host: &str, port: u16, outcome: &Outcome) {
        let mut inner = self.inner.lock().unwrap();
        let Some(b) = inner
            .backends
            .iter_mut()
            .find(|b| b.host == host && b.port == port)
        else {
            return;
        };

        match outcome {
            Outcome::Success { latency_ms } => {
                b.record_request(*latency_ms, true);
                b.consecutive_timeouts = 0;
            }
            Outcome::BadResponse { latency_ms } => {
                b.record_request(*latency_ms, false);
                b.consecutive_timeouts = 0;
            }
            Outcome::Timeout => {
                let was_healthy = b.healthy;
                b.record_timeout();
                if was_healthy && !b.healthy {
                    info!(
                        pool = %self.name, host, port, timeouts = b.consecutive_timeouts,
                        "backend marked unhealthy after consecutive timeouts"
                    );
                }
            }
            Outcome::Transport => {
                b.error_count += 1;
                b.healthy = false;
            }
        }
    }

    /// Probe result application, used by the health/load refresher (H).
    pub fn set_health(&self, host: &str, port: u16, healthy: bool, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(b) = inner
            .backends
            .iter_mut()
            .find(|b| b.host == host && b.port == port)
        {
            let was_unhealthy = !b.healthy;
            b.healthy = healthy;
            b.last_check = Some(now);
            if healthy && was_unhealthy {
                info!(pool = %self.name, host, port, "backend recovered");
            }
        }
    }

    pub fn set_load(&self, host: &str, port: u16, gpu_load: u32, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(b) = inner
            .backends
            .iter_mut()
            .find(|b| b.host == host && b.port == port)
        {
            b.gpu_load = gpu_load;
            b.last_load_refresh = Some(now);
        }
    }

    /// Snapshot of every backend, for the health/load refresher to iterate
    /// without holding the pool lock across its own probe I/O.
    pub fn snapshot_all(&self) -> Vec<Backend> {
        self.inner.lock().unwrap().backends.clone()
    }
}

/// Outcome of a completed upstream call, applied to the backend's counters.
pub enum Outcome {
    Success { latency_ms: f64 },
    BadResponse { latency_ms: f64 },
    Timeout,
    Transport,
}

/// RAII guard returned by `BackendPool::acquire`. Decrements the backend's
/// in-flight counter exactly once, on drop, regardless of which exit path
/// the caller took (success, error, early return, panic).
pub struct InFlightGuard {
    pool: Arc<BackendPool>,
    host: String,
    port: u16,
    released: bool,
    backend: Backend,
}

impl InFlightGuard {
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn url(&self) -> String {
        self.backend.url()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut inner = self.pool.inner.lock().unwrap();
        if let Some(b) = inner
            .backends
            .iter_mut()
            .find(|b| b.host == self.host && b.port == self.port)
        {
            b.inflight = b.inflight.saturating_sub(1);
        }
    }
}

/// Owns every `BackendPool`, keyed by pool name (the model alias the proxy
/// exposes it under). Shared between the HTTP handlers, the health/load
/// refresher, and the reconciliation loop.
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<BackendPool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Return the named pool, creating an empty one if it doesn't exist yet.
    pub fn get_or_create(&self, name: &str) -> Arc<BackendPool> {
        if let Some(pool) = self.pools.read().unwrap().get(name) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write().unwrap();
        Arc::clone(
            pools
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(BackendPool::new(name))),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackendPool>> {
        self.pools.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.pools.read().unwrap().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<BackendPool>> {
        self.pools.read().unwrap().values().cloned().collect()
    }

    pub fn remove_backend_everywhere(&self, host: &str, port: u16) -> bool {
        let mut removed = false;
        for pool in self.pools.read().unwrap().values() {
            if pool.remove_backend(host, port) {
                removed = true;
            }
        }
        removed
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_backend_is_idempotent() {
        let pool = BackendPool::new("m");
        pool.add_backend("127.0.0.1", 5900, "p1");
        pool.add_backend("127.0.0.1", 5900, "p2");
        assert_eq!(pool.backend_urls().len(), 1);
        assert_eq!(pool.stats()[0].partition, "p2");
    }

    #[test]
    fn remove_unknown_backend_is_noop() {
        let pool = BackendPool::new("m");
        assert!(!pool.remove_backend("127.0.0.1", 5900));
    }

    #[test]
    fn remove_existing_backend_returns_true() {
        let pool = BackendPool::new("m");
        pool.add_backend("127.0.0.1", 5900, "");
        assert!(pool.remove_backend("127.0.0.1", 5900));
        assert!(pool.is_empty());
    }

    #[test]
    fn acquire_returns_none_when_no_healthy_backend() {
        let pool = Arc::new(BackendPool::new("m"));
        assert!(pool.acquire(&Strategy::RoundRobin).is_none());
    }

    #[test]
    fn acquire_increments_and_drop_releases_inflight() {
        let pool = Arc::new(BackendPool::new("m"));
        pool.add_backend("127.0.0.1", 5900, "");
        {
            let guard = pool.acquire(&Strategy::RoundRobin).unwrap();
            assert_eq!(guard.backend().inflight, 1);
            assert_eq!(pool.stats()[0].inflight, 1);
        }
        assert_eq!(pool.stats()[0].inflight, 0);
    }

    #[test]
    fn round_robin_across_two_backends_alternates() {
        let pool = Arc::new(BackendPool::new("m"));
        pool.add_backend("127.0.0.1", 5900, "");
        pool.add_backend("127.0.0.1", 5910, "");

        let g1 = pool.acquire(&Strategy::RoundRobin).unwrap();
        let p1 = g1.backend().port;
        drop(g1);
        let g2 = pool.acquire(&Strategy::RoundRobin).unwrap();
        let p2 = g2.backend().port;
        drop(g2);
        let g3 = pool.acquire(&Strategy::RoundRobin).unwrap();
        let p3 = g3.backend().port;

        assert_eq!([p1, p2, p3], [5900, 5910, 5900]);
    }

    #[test]
    fn three_consecutive_timeouts_mark_unhealthy() {
        let pool = Arc::new(BackendPool::new("m"));
        pool.add_backend("127.0.0.1", 5900, "");

        for _ in 0..3 {
            pool.record_outcome("127.0.0.1", 5900, &Outcome::Timeout);
        }
        assert!(pool.acquire(&Strategy::RoundRobin).is_none());
        assert!(!pool.stats()[0].healthy);
    }

    #[test]
    fn n_sequential_acquires_cover_each_backend_once() {
        let pool = Arc::new(BackendPool::new("m"));
        for port in [5900, 5910, 5920] {
            pool.add_backend("127.0.0.1", port, "");
        }
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let guard = pool.acquire(&Strategy::RoundRobin).unwrap();
            seen.insert(guard.backend().port);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn registry_get_or_create_is_idempotent() {
        let registry = PoolRegistry::new();
        let a = registry.get_or_create("llama");
        let b = registry.get_or_create("llama");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.names(), vec!["llama".to_string()]);
    }

    #[test]
    fn registry_remove_backend_everywhere_hits_every_pool() {
        let registry = PoolRegistry::new();
        let a = registry.get_or_create("llama");
        let b = registry.get_or_create("mixtral");
        a.add_backend("127.0.0.1", 5900, "");
        b.add_backend("127.0.0.1", 5900, "");

        assert!(registry.remove_backend_everywhere("127.0.0.1", 5900));
        assert!(a.is_empty());
        assert!(b.is_empty());
    }
}
