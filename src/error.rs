//! Proxy-wide error taxonomy.
//!
//! Mirrors the split the rest of the workspace uses: typed, non-exhaustive
//! failure modes here, `anyhow` only at the process bootstrap boundary in
//! `main.rs`.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

/// Errors surfaced while routing and forwarding a single proxied request.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// No pool matches the requested model, after all resolution fallbacks.
    #[error("no backend for model: {model}")]
    UnknownModel { model: String, available: Vec<String> },

    /// A pool matched but has no healthy backend to acquire.
    #[error("no healthy backends for model: {model}")]
    NoHealthyBackend { model: String },

    /// The upstream call exceeded `request_timeout`.
    #[error("backend timeout: {backend}")]
    UpstreamTimeout { backend: String },

    /// Connection-level failure reaching the backend (refused, reset, DNS, ...).
    #[error("backend error: {source}")]
    UpstreamTransport {
        backend: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Standard error body shape returned to clients.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    available: Option<Vec<String>>,
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::UnknownModel { .. } => StatusCode::NOT_FOUND,
            ProxyError::NoHealthyBackend { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamTransport { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ProxyError::UnknownModel { model, available } => ErrorBody {
                error: format!("No backend for model: {model}"),
                backend: None,
                available: Some(available.clone()),
            },
            ProxyError::NoHealthyBackend { model } => ErrorBody {
                error: format!("No healthy backends for model: {model}"),
                backend: None,
                available: None,
            },
            ProxyError::UpstreamTimeout { backend } => ErrorBody {
                error: "Backend timeout".to_string(),
                backend: Some(backend.clone()),
                available: None,
            },
            ProxyError::UpstreamTransport { backend, source } => ErrorBody {
                error: format!("Backend error: {source}"),
                backend: Some(backend.clone()),
                available: None,
            },
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        (self.status(), Json(self.body())).into_response()
    }
}
