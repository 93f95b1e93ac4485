//! Tracking-header extraction.
//!
//! Header names are configurable; each one also falls back to a fixed
//! legacy name if the configured one isn't present, so older clients keep
//! working without reconfiguration.

use axum::http::HeaderMap;

use crate::config::HeadersConfig;

#[derive(Debug, Clone, Default)]
pub struct TrackingHeaders {
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub client_id: Option<String>,
    pub client_command: Option<String>,
    pub timing_pre: Option<String>,
    pub timing_post: Option<String>,
}

fn get(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}

/// Extract tracking headers, preferring the configured name and falling
/// back to the legacy fixed name (`X-Episode-ID`, `X-Instruction-ID`,
/// `X-Process-ID`, `X-Timing-Obs-Ms`, `X-Timing-Act-Ms`).
pub fn extract(headers: &HeaderMap, config: &HeadersConfig) -> TrackingHeaders {
    TrackingHeaders {
        session_id: get(headers, &config.session).or_else(|| get(headers, "X-Episode-ID")),
        task_id: get(headers, &config.task).or_else(|| get(headers, "X-Instruction-ID")),
        client_id: get(headers, &config.client).or_else(|| get(headers, "X-Process-ID")),
        client_command: get(headers, "X-Process-Command"),
        timing_pre: get(headers, &config.timing_pre).or_else(|| get(headers, "X-Timing-Obs-Ms")),
        timing_post: get(headers, &config.timing_post).or_else(|| get(headers, "X-Timing-Act-Ms")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }

    #[test]
    fn configured_name_wins_over_legacy() {
        let config = HeadersConfig::default();
        let headers = headers_with(&[("X-Session-ID", "s1"), ("X-Episode-ID", "legacy")]);
        let extracted = extract(&headers, &config);
        assert_eq!(extracted.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn falls_back_to_legacy_name_when_configured_absent() {
        let config = HeadersConfig::default();
        let headers = headers_with(&[("X-Episode-ID", "legacy-session")]);
        let extracted = extract(&headers, &config);
        assert_eq!(extracted.session_id.as_deref(), Some("legacy-session"));
    }

    #[test]
    fn missing_headers_are_none() {
        let config = HeadersConfig::default();
        let extracted = extract(&HeaderMap::new(), &config);
        assert!(extracted.session_id.is_none());
        assert!(extracted.client_command.is_none());
    }
}
