//! The proxied-request pipeline: model resolution, backend acquisition,
//! upstream forwarding, and tracker bookkeeping for every `/v1/...` call.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, OriginalUri, Path, State};
use axum::http::{HeaderMap, HeaderName, Method};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use uuid::Uuid;

use crate::backend::{BackendPool, Outcome};
use crate::error::ProxyError;
use crate::proxy::{discovery, headers, state::AppState};
use crate::tracker::SubmitArgs;

const SUMMARY_LIMIT: usize = 200;

/// `* /v1/{*rest}` — model comes from the request body, the `model` query
/// param, or (failing both) the first registered pool.
pub async fn implicit_proxy(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<std::net::SocketAddr>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Path(rest): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let requested_model = model_from_body(&body)
        .or_else(|| model_from_query(uri.query()))
        .unwrap_or_else(|| state.pools().names().into_iter().next().unwrap_or_default());

    forward(
        &state,
        &requested_model,
        &format!("v1/{rest}"),
        method,
        uri.query(),
        headers,
        body,
        peer.to_string(),
    )
    .await
}

/// `* /{model}/v1/{*rest}` — model comes straight from the path segment.
pub async fn explicit_proxy(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<std::net::SocketAddr>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Path((model, rest)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward(
        &state,
        &model,
        &format!("v1/{rest}"),
        method,
        uri.query(),
        headers,
        body,
        peer.to_string(),
    )
    .await
}

fn gen_request_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Core forwarding pipeline, shared by the implicit and explicit routes. See
/// the proxy server's request-pipeline description for the numbered steps
/// this follows.
#[allow(clippy::too_many_arguments)]
async fn forward(
    state: &AppState,
    requested_model: &str,
    backend_path: &str,
    method: Method,
    query: Option<&str>,
    mut incoming_headers: HeaderMap,
    body: Bytes,
    source: String,
) -> Response {
    state.record_request();
    let request_id = gen_request_id();
    let tracking = headers::extract(&incoming_headers, &state.config().headers);
    let full_path = match query {
        Some(q) if !q.is_empty() => format!("/{backend_path}?{q}"),
        _ => format!("/{backend_path}"),
    };

    state
        .tracker()
        .submit(
            request_id.clone(),
            SubmitArgs {
                source,
                model: requested_model.to_string(),
                path: full_path.clone(),
                session_id: tracking.session_id.clone(),
                task_id: tracking.task_id.clone(),
                client_id: tracking.client_id.clone(),
                client_command: tracking.client_command.clone(),
            },
        )
        .await;

    let pool = match resolve_pool(state, requested_model).await {
        Ok(pool) => pool,
        Err(available) => {
            state.tracker().complete(&request_id, false).await;
            state.record_error();
            return ProxyError::UnknownModel {
                model: requested_model.to_string(),
                available,
            }
            .into_response();
        }
    };

    let Some(guard) = pool.acquire(&state.config().strategy) else {
        state.tracker().complete(&request_id, false).await;
        state.record_error();
        return ProxyError::NoHealthyBackend {
            model: requested_model.to_string(),
        }
        .into_response();
    };

    state.tracker().start_processing(&request_id, guard.url()).await;

    strip_hop_headers(&mut incoming_headers);

    let agent_pre = tracking.timing_pre.as_deref().and_then(|v| v.parse::<f64>().ok());
    let agent_post = tracking.timing_post.as_deref().and_then(|v| v.parse::<f64>().ok());
    let request_summary = extract_request_summary(&body);
    state
        .tracker()
        .annotate(&request_id, request_summary, None, None, agent_pre, agent_post)
        .await;

    let url = format!("{}{}", guard.url(), full_path);
    let started = Instant::now();
    let upstream = state
        .client()
        .request(method, &url)
        .headers(incoming_headers)
        .body(body)
        .timeout(state.config().request_timeout)
        .send()
        .await;

    let (host, port) = (guard.backend().host.clone(), guard.backend().port);

    match upstream {
        Ok(resp) => {
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            let status = resp.status();
            let success = status.as_u16() < 500;

            pool.record_outcome(
                &host,
                port,
                if success {
                    &Outcome::Success { latency_ms }
                } else {
                    &Outcome::BadResponse { latency_ms }
                },
            );

            let mut response_headers = resp.headers().clone();
            strip_response_headers(&mut response_headers);
            let response_body = match resp.bytes().await {
                Ok(b) => b,
                Err(_) => Bytes::new(),
            };

            state
                .tracker()
                .annotate(
                    &request_id,
                    None,
                    extract_response_summary(&response_body),
                    Some(latency_ms),
                    None,
                    None,
                )
                .await;
            state.tracker().complete(&request_id, success).await;
            if !success {
                state.record_error();
            }

            let mut builder = Response::builder().status(status);
            *builder.headers_mut().unwrap() = response_headers;
            builder.body(axum::body::Body::from(response_body)).unwrap()
        }
        Err(e) if e.is_timeout() => {
            pool.record_outcome(&host, port, &Outcome::Timeout);
            state.tracker().complete(&request_id, false).await;
            state.record_error();
            ProxyError::UpstreamTimeout { backend: guard.url() }.into_response()
        }
        Err(e) => {
            pool.record_outcome(&host, port, &Outcome::Transport);
            state.tracker().complete(&request_id, false).await;
            state.record_error();
            ProxyError::UpstreamTransport { backend: guard.url(), source: e }.into_response()
        }
    }
}

/// Resolve a requested model name to a pool: direct name match, then the
/// model→pool discovery map, then a forced discovery refresh and retry,
/// then a case-insensitive substring match over pool names (either
/// direction). `Err` carries the list of known pool names for the 404 body.
async fn resolve_pool(state: &AppState, requested: &str) -> Result<Arc<BackendPool>, Vec<String>> {
    if let Some(pool) = state.pools().get(requested) {
        return Ok(pool);
    }
    if let Some(name) = state.resolve_pool_for_model(requested) {
        if let Some(pool) = state.pools().get(&name) {
            return Ok(pool);
        }
    }

    discovery::refresh(state).await;
    if let Some(name) = state.resolve_pool_for_model(requested) {
        if let Some(pool) = state.pools().get(&name) {
            return Ok(pool);
        }
    }

    let lower = requested.to_lowercase();
    for name in state.pools().names() {
        let name_lower = name.to_lowercase();
        if name_lower.contains(&lower) || lower.contains(&name_lower) {
            if let Some(pool) = state.pools().get(&name) {
                return Ok(pool);
            }
        }
    }

    Err(state.pools().names())
}

const HOP_BY_HOP_REQUEST_HEADERS: [&str; 3] = ["host", "content-length", "transfer-encoding"];
const HOP_BY_HOP_RESPONSE_HEADERS: [&str; 3] = ["content-encoding", "transfer-encoding", "content-length"];

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_REQUEST_HEADERS {
        headers.remove(HeaderName::from_static(name));
    }
}

fn strip_response_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_RESPONSE_HEADERS {
        headers.remove(HeaderName::from_static(name));
    }
}

fn model_from_body(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("model")?.as_str().map(str::to_string)
}

fn model_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).ok()?;
    pairs.into_iter().find(|(k, _)| k == "model").map(|(_, v)| v)
}

fn truncate(s: &str) -> String {
    s.chars().take(SUMMARY_LIMIT).collect()
}

/// Up to 200 chars of the last `user`-role message's content. Silently
/// returns `None` on any parse failure — body inspection must never fail
/// the request.
fn extract_request_summary(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let messages = value.get("messages")?.as_array()?;
    let last_user = messages.iter().rev().find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))?;
    message_text(last_user.get("content")?).map(|s| truncate(&s))
}

/// Up to 200 chars of `choices[0].message.content`.
fn extract_response_summary(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let content = value.get("choices")?.as_array()?.first()?.get("message")?.get("content")?;
    message_text(content).map(|s| truncate(&s))
}

/// OpenAI message content is either a plain string or a list of typed parts
/// (`{"type": "text", "text": "..."}`, etc.); concatenate text parts.
fn message_text(content: &serde_json::Value) -> Option<String> {
    if let Some(s) = content.as_str() {
        return Some(s.to_string());
    }
    let parts = content.as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_last_user_message_as_summary() {
        let body = br#"{"messages":[{"role":"system","content":"sys"},{"role":"user","content":"first"},{"role":"assistant","content":"reply"},{"role":"user","content":"second question"}]}"#;
        assert_eq!(extract_request_summary(body).as_deref(), Some("second question"));
    }

    #[test]
    fn truncates_request_summary_to_200_chars() {
        let long = "x".repeat(500);
        let body = serde_json::json!({"messages": [{"role": "user", "content": long}]});
        let summary = extract_request_summary(body.to_string().as_bytes()).unwrap();
        assert_eq!(summary.chars().count(), 200);
    }

    #[test]
    fn malformed_body_yields_no_summary_not_an_error() {
        assert_eq!(extract_request_summary(b"not json"), None);
    }

    #[test]
    fn extracts_response_summary_from_choices() {
        let body = br#"{"choices":[{"message":{"role":"assistant","content":"the answer"}}]}"#;
        assert_eq!(extract_response_summary(body).as_deref(), Some("the answer"));
    }

    #[test]
    fn model_from_body_reads_top_level_field() {
        let body = br#"{"model":"llama-70b","messages":[]}"#;
        assert_eq!(model_from_body(body).as_deref(), Some("llama-70b"));
    }

    #[test]
    fn model_from_query_reads_model_param() {
        assert_eq!(model_from_query(Some("model=llama&stream=true")).as_deref(), Some("llama"));
        assert_eq!(model_from_query(Some("stream=true")), None);
        assert_eq!(model_from_query(None), None);
    }
}
