//! Gateway configuration.
//!
//! Env-driven, matching the rest of the workspace's services: no config
//! file format, `from_env()` returns a populated, validated `Config`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Load-balancing strategy selectable per proxy instance. `Unknown` carries
/// the unrecognized name through to `strategy::select`, which falls back to
/// returning the first backend for it rather than resolving it to some
/// other strategy at config-load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    LeastConnections,
    LeastLatency,
    LeastLoad,
    Unknown(String),
}

impl Strategy {
    pub fn as_str(&self) -> &str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::LeastLatency => "least_latency",
            Strategy::LeastLoad => "least_load",
            Strategy::Unknown(name) => name,
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "round_robin" => Strategy::RoundRobin,
            "least_connections" => Strategy::LeastConnections,
            "least_latency" => Strategy::LeastLatency,
            "least_load" => Strategy::LeastLoad,
            other => Strategy::Unknown(other.to_string()),
        })
    }
}

/// Configurable tracking header names, with legacy fallbacks applied at
/// extraction time (see `proxy::headers::extract`).
#[derive(Debug, Clone)]
pub struct HeadersConfig {
    pub session: String,
    pub task: String,
    pub client: String,
    pub timing_pre: String,
    pub timing_post: String,
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            session: "X-Session-ID".to_string(),
            task: "X-Task-ID".to_string(),
            client: "X-Client-ID".to_string(),
            timing_pre: "X-Timing-Pre-Ms".to_string(),
            timing_post: "X-Timing-Post-Ms".to_string(),
        }
    }
}

/// GPU load metrics are cached for this long before a fresh `/metrics` probe.
pub const LOAD_CACHE_TTL: Duration = Duration::from_secs(1);

/// Gateway configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the proxy's HTTP server binds to.
    pub bind_addr: SocketAddr,

    /// Load balancing strategy.
    pub strategy: Strategy,

    /// Health probe interval.
    pub health_check_interval: Duration,

    /// Upstream request timeout.
    pub request_timeout: Duration,

    /// Model discovery cache TTL.
    pub model_cache_ttl: Duration,

    /// Tracker: interval between eviction passes.
    pub cleanup_interval: Duration,

    /// Tracker: age after which pending/in_flight entries are force-evicted.
    pub stale_timeout: Duration,

    /// Tracker: maximum number of tracked requests retained.
    pub max_history: usize,

    /// Reconciliation poll interval (0 disables the loop).
    pub poll_interval: Duration,

    /// Base port per model name, used by the reconciliation loop's replica
    /// port derivation (`base + replica_index * 10`) when the cluster
    /// enumerator doesn't report a port directly.
    pub base_ports: HashMap<String, u16>,

    /// Header name configuration.
    pub headers: HeadersConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".parse().unwrap(),
            strategy: Strategy::LeastLoad,
            health_check_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(300),
            model_cache_ttl: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            stale_timeout: Duration::from_secs(600),
            max_history: 1000,
            poll_interval: Duration::from_secs(30),
            base_ports: HashMap::new(),
            headers: HeadersConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let bind_addr = match std::env::var("GATEWAY_BIND_ADDR") {
            Ok(v) => v
                .parse()
                .with_context(|| format!("Invalid GATEWAY_BIND_ADDR: {v}"))?,
            Err(_) => defaults.bind_addr,
        };

        let strategy = std::env::var("GATEWAY_STRATEGY")
            .ok()
            .map(|v| v.parse().unwrap())
            .unwrap_or(defaults.strategy);

        let health_check_interval = duration_secs_env("GATEWAY_HEALTH_CHECK_INTERVAL_SECS")?
            .unwrap_or(defaults.health_check_interval);

        let request_timeout = duration_secs_env("GATEWAY_REQUEST_TIMEOUT_SECS")?
            .unwrap_or(defaults.request_timeout);

        let model_cache_ttl = duration_secs_env("GATEWAY_MODEL_CACHE_TTL_SECS")?
            .unwrap_or(defaults.model_cache_ttl);

        let cleanup_interval = duration_secs_env("GATEWAY_CLEANUP_INTERVAL_SECS")?
            .unwrap_or(defaults.cleanup_interval);

        let stale_timeout =
            duration_secs_env("GATEWAY_STALE_TIMEOUT_SECS")?.unwrap_or(defaults.stale_timeout);

        let max_history: usize = std::env::var("GATEWAY_MAX_HISTORY")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("GATEWAY_MAX_HISTORY must be an integer")?
            .unwrap_or(defaults.max_history);

        let poll_interval =
            duration_secs_env("GATEWAY_POLL_INTERVAL_SECS")?.unwrap_or(defaults.poll_interval);

        let base_ports = match std::env::var("GATEWAY_BASE_PORTS") {
            Ok(v) => parse_base_ports(&v)?,
            Err(_) => defaults.base_ports,
        };

        let log_level = std::env::var("GATEWAY_LOG_LEVEL").unwrap_or(defaults.log_level);

        let headers = HeadersConfig {
            session: std::env::var("GATEWAY_HEADER_SESSION").unwrap_or(defaults.headers.session),
            task: std::env::var("GATEWAY_HEADER_TASK").unwrap_or(defaults.headers.task),
            client: std::env::var("GATEWAY_HEADER_CLIENT").unwrap_or(defaults.headers.client),
            timing_pre: std::env::var("GATEWAY_HEADER_TIMING_PRE")
                .unwrap_or(defaults.headers.timing_pre),
            timing_post: std::env::var("GATEWAY_HEADER_TIMING_POST")
                .unwrap_or(defaults.headers.timing_post),
        };

        Ok(Self {
            bind_addr,
            strategy,
            health_check_interval,
            request_timeout,
            model_cache_ttl,
            cleanup_interval,
            stale_timeout,
            max_history,
            poll_interval,
            base_ports,
            headers,
            log_level,
        })
    }
}

/// Parse `model=port` pairs separated by commas, e.g. `llama=5900,mixtral=6900`.
fn parse_base_ports(v: &str) -> Result<HashMap<String, u16>> {
    v.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            let (model, port) = entry
                .split_once('=')
                .with_context(|| format!("GATEWAY_BASE_PORTS entry missing '=': {entry}"))?;
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("GATEWAY_BASE_PORTS entry has non-numeric port: {entry}"))?;
            Ok((model.trim().to_string(), port))
        })
        .collect()
}

fn duration_secs_env(name: &str) -> Result<Option<Duration>> {
    std::env::var(name)
        .ok()
        .map(|v| v.parse::<u64>())
        .transpose()
        .with_context(|| format!("{name} must be an integer (seconds)"))
        .map(|opt| opt.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_unknown_name_is_preserved_as_unknown() {
        assert_eq!("garbage".parse::<Strategy>().unwrap(), Strategy::Unknown("garbage".to_string()));
    }

    #[test]
    fn strategy_round_trips_known_names() {
        for s in [
            "round_robin",
            "least_connections",
            "least_latency",
            "least_load",
        ] {
            assert_eq!(s.parse::<Strategy>().unwrap().as_str(), s);
        }
    }

    #[test]
    fn parses_base_ports_list() {
        let ports = parse_base_ports("llama=5900, mixtral=6900").unwrap();
        assert_eq!(ports.get("llama"), Some(&5900));
        assert_eq!(ports.get("mixtral"), Some(&6900));
    }

    #[test]
    fn defaults_match_spec() {
        let c = Config::default();
        assert_eq!(c.health_check_interval, Duration::from_secs(30));
        assert_eq!(c.request_timeout, Duration::from_secs(300));
        assert_eq!(c.cleanup_interval, Duration::from_secs(60));
        assert_eq!(c.stale_timeout, Duration::from_secs(600));
        assert_eq!(c.max_history, 1000);
    }
}
