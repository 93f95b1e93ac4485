//! Model discovery: populates the model→pool map and the `/v1/models`
//! listing cache by querying each pool's backends.
//!
//! For every pool, the first healthy backend that answers `/v1/models`
//! wins for that pool; its advertised ids are merged into the global
//! model→pool map and into the deduplicated, first-seen-order model list
//! used by both `/` and `/v1/models`.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::state::AppState;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Return the cached model list, refreshing first if the cache has gone
/// stale (see `Config::model_cache_ttl`, default 30s).
pub async fn cached_models(state: &AppState) -> Vec<serde_json::Value> {
    let ttl = state.model_cache_ttl();
    {
        let cache = state.model_cache().await;
        if cache.fresh(ttl) {
            return cache.models.clone();
        }
    }
    refresh(state).await;
    state.model_cache().await.models.clone()
}

/// Force a refresh of the model→pool map and the model listing cache,
/// regardless of TTL. Used by the proxy's pool-resolution fallback when a
/// requested model isn't yet known.
pub async fn refresh(state: &AppState) {
    let mut seen = std::collections::HashSet::new();
    let mut models = Vec::new();

    for pool in state.pools().all() {
        let Some(ids) = query_one_backend(state, &pool).await else {
            continue;
        };
        for id in ids {
            state.set_model_pool(&id, pool.name());
            if seen.insert(id.clone()) {
                models.push(serde_json::json!({
                    "id": id,
                    "object": "model",
                    "owned_by": pool.name(),
                }));
            }
        }
    }

    let mut cache = state.model_cache().await;
    cache.models = models;
    cache.fetched_at = Some(Instant::now());
}

/// Query the first healthy backend in `pool` for its `/v1/models` listing.
/// Returns `None` if no healthy backend answered.
async fn query_one_backend(state: &AppState, pool: &crate::backend::BackendPool) -> Option<Vec<String>> {
    for backend in pool.snapshot_all() {
        if !backend.healthy {
            continue;
        }
        let url = format!("{}/v1/models", backend.url());
        let resp = match state.client().get(&url).timeout(DISCOVERY_TIMEOUT).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(pool = pool.name(), backend = %backend.url(), status = %r.status(), "model discovery: non-2xx");
                continue;
            }
            Err(e) => {
                debug!(pool = pool.name(), backend = %backend.url(), error = %e, "model discovery: request failed");
                continue;
            }
        };
        let body: serde_json::Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(pool = pool.name(), backend = %backend.url(), error = %e, "model discovery: invalid JSON");
                continue;
            }
        };
        let ids: Vec<String> = body
            .get("data")
            .and_then(|d| d.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|entry| entry.get("id").and_then(|id| id.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if !ids.is_empty() {
            return Some(ids);
        }
    }
    None
}
