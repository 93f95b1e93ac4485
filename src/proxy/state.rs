//! Shared application state handed to every HTTP handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::backend::PoolRegistry;
use crate::config::Config;
use crate::tracker::RequestTracker;

/// Cache of the deduplicated model list fetched from backends, refreshed on
/// a TTL rather than on every request.
pub struct ModelCache {
    pub models: Vec<serde_json::Value>,
    pub fetched_at: Option<Instant>,
}

impl ModelCache {
    pub fn fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.map(|t| t.elapsed() < ttl).unwrap_or(false) && !self.models.is_empty()
    }
}

struct AppStateInner {
    config: Config,
    pools: PoolRegistry,
    model_to_pool: RwLock<HashMap<String, String>>,
    model_cache: Mutex<ModelCache>,
    tracker: RequestTracker,
    client: reqwest::Client,
    start_time: Instant,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
}

/// Cheaply cloneable handle shared across every axum handler.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

impl AppState {
    pub fn new(config: Config, client: reqwest::Client) -> Self {
        let tracker = RequestTracker::new(config.max_history, config.cleanup_interval, config.stale_timeout);
        Self {
            inner: Arc::new(AppStateInner {
                config,
                pools: PoolRegistry::new(),
                model_to_pool: RwLock::new(HashMap::new()),
                model_cache: Mutex::new(ModelCache { models: Vec::new(), fetched_at: None }),
                tracker,
                client,
                start_time: Instant::now(),
                total_requests: AtomicU64::new(0),
                total_errors: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.inner.pools
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.inner.tracker
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    pub fn uptime(&self) -> Duration {
        self.inner.start_time.elapsed()
    }

    pub fn record_request(&self) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.inner.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.inner.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.inner.total_errors.load(Ordering::Relaxed)
    }

    pub fn model_to_pool(&self) -> HashMap<String, String> {
        self.inner.model_to_pool.read().unwrap().clone()
    }

    pub fn resolve_pool_for_model(&self, model: &str) -> Option<String> {
        self.inner.model_to_pool.read().unwrap().get(model).cloned()
    }

    pub(crate) fn set_model_pool(&self, model: &str, pool: &str) {
        self.inner
            .model_to_pool
            .write()
            .unwrap()
            .insert(model.to_string(), pool.to_string());
    }

    pub(crate) async fn model_cache(&self) -> tokio::sync::MutexGuard<'_, ModelCache> {
        self.inner.model_cache.lock().await
    }

    pub(crate) fn model_cache_ttl(&self) -> Duration {
        self.inner.config.model_cache_ttl
    }
}
