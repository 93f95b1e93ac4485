//! HTTP proxy server: ingress router, model resolution, request forwarding,
//! and the metrics/status endpoints.
//!
//! ```text
//! Client -> Router -> (discovery | stats | queue/status | proxy handlers)
//!                                                  |
//!                                     Backend pool (acquire) -> upstream
//! ```

pub mod discovery;
pub mod forward;
pub mod handlers;
pub mod headers;
pub mod state;

use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the proxy's top-level router. Route registration order doesn't
/// affect matching (axum dispatches via a radix tree, not first-match), but
/// fixed endpoints are listed before the wildcard passthrough routes for
/// readability.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any).allow_origin(Any);

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/healthz", get(handlers::health))
        .route("/readyz", get(handlers::health))
        .route("/livez", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/queue/status", get(handlers::queue_status))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/{*rest}", any(forward::implicit_proxy))
        .route("/{model}/v1/{*rest}", any(forward::explicit_proxy))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}
