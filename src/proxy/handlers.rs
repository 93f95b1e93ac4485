//! Non-proxied HTTP endpoints: discovery, health, stats, and queue status.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use super::discovery;
use super::state::AppState;

/// `GET /` — advertised models plus the backend URLs registered under each
/// pool.
pub async fn root(State(state): State<AppState>) -> impl IntoResponse {
    let models = discovery::cached_models(&state).await;
    let pools: serde_json::Map<String, serde_json::Value> = state
        .pools()
        .all()
        .into_iter()
        .map(|pool| (pool.name().to_string(), serde_json::json!(pool.backend_urls())))
        .collect();

    Json(serde_json::json!({
        "models": models,
        "pools": pools,
    }))
}

fn overall_health(state: &AppState) -> (bool, serde_json::Map<String, serde_json::Value>) {
    let pools = state.pools().all();
    let mut per_pool = serde_json::Map::new();
    let mut any_healthy = false;
    for pool in &pools {
        let healthy = pool.any_healthy();
        any_healthy |= healthy;
        per_pool.insert(pool.name().to_string(), serde_json::json!(healthy));
    }
    (any_healthy, per_pool)
}

/// `GET /health` (and the `/healthz`, `/readyz`, `/livez` aliases) — healthy
/// iff at least one pool has at least one healthy backend.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (healthy, pools) = overall_health(&state);
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "pools": pools,
    });
    if healthy {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

/// `GET /stats` — uptime, request totals, error rate, and per-pool backend
/// stats.
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let total_requests = state.total_requests();
    let total_errors = state.total_errors();
    let error_rate = if total_requests == 0 {
        0.0
    } else {
        total_errors as f64 / total_requests as f64
    };

    let pools: serde_json::Map<String, serde_json::Value> = state
        .pools()
        .all()
        .into_iter()
        .map(|pool| (pool.name().to_string(), serde_json::json!(pool.stats())))
        .collect();

    Json(serde_json::json!({
        "uptime_seconds": state.uptime().as_secs_f64(),
        "total_requests": total_requests,
        "total_errors": total_errors,
        "error_rate": error_rate,
        "pools": pools,
    }))
}

/// `GET /queue/status` — the tracker snapshot plus a per-backend load view
/// (§6.5). Legacy aliases are already embedded in the tracker's
/// `QueueStatus` serialization; this handler only adds `backends`.
pub async fn queue_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.tracker().get_status().await;
    let mut body = serde_json::to_value(snapshot).expect("QueueStatus always serializes");

    let backends: Vec<serde_json::Value> = state
        .pools()
        .all()
        .into_iter()
        .flat_map(|pool| pool.stats())
        .map(|b| serde_json::to_value(b).expect("BackendStats always serializes"))
        .collect();

    body.as_object_mut()
        .expect("QueueStatus serializes to an object")
        .insert("backends".to_string(), serde_json::json!(backends));

    Json(body)
}

/// `GET /v1/models` — OpenAI-compatible listing built from the same cache
/// `/` uses.
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let models = discovery::cached_models(&state).await;
    Json(serde_json::json!({
        "object": "list",
        "data": models,
    }))
}
