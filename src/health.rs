//! Health probing and GPU load refresh for registered backends.
//!
//! Both loops run under [`run_resilient`], which restarts the wrapped loop
//! body on any unexpected error instead of letting one bad iteration take
//! the whole worker down — the same restart-on-failure shape as the
//! reconciliation supervisor.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, warn};

use crate::backend::BackendPool;
use crate::config::LOAD_CACHE_TTL;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const LOAD_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Run `body` in a loop, restarting it after `backoff` if it ever returns an
/// error. Exits cleanly and immediately once `shutdown` is signalled.
pub async fn run_resilient<F, Fut>(name: &str, mut shutdown: watch::Receiver<bool>, mut body: F)
where
    F: FnMut(watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    loop {
        if *shutdown.borrow() {
            return;
        }
        match body(shutdown.clone()).await {
            Ok(()) => return,
            Err(e) => {
                error!(loop_name = name, error = %e, "background loop crashed, restarting");
                tokio::select! {
                    _ = tokio::time::sleep(RESTART_BACKOFF) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Supplies the current set of pools to probe. A plain `Vec` snapshot would
/// go stale as the reconciliation loop creates pools for newly discovered
/// models, so both loops re-fetch it every tick instead of capturing one at
/// startup.
pub type PoolSource = Arc<dyn Fn() -> Vec<Arc<BackendPool>> + Send + Sync>;

/// Periodic health-check loop: probes every backend's `/health` endpoint and
/// piggybacks a load refresh on any that come back healthy.
pub async fn run_health_check_loop(
    client: reqwest::Client,
    pools: PoolSource,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                check_all_backends(&client, &pools()).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn check_all_backends(client: &reqwest::Client, pools: &[Arc<BackendPool>]) {
    let mut checks = Vec::new();
    for pool in pools {
        for backend in pool.snapshot_all() {
            checks.push(check_single_backend(client.clone(), Arc::clone(pool), backend));
        }
    }
    futures_util::future::join_all(checks).await;
}

async fn check_single_backend(
    client: reqwest::Client,
    pool: Arc<BackendPool>,
    backend: crate::backend::Backend,
) {
    let url = format!("{}/health", backend.url());
    let now = Instant::now();

    let healthy = match client.get(&url).timeout(HEALTH_PROBE_TIMEOUT).send().await {
        Ok(resp) => resp.status().as_u16() < 500,
        Err(_) => false,
    };

    pool.set_health(&backend.host, backend.port, healthy, now);
    if healthy {
        refresh_backend_load(&client, &pool, &backend).await;
    }
}

/// GPU load refresh loop, ticking at [`LOAD_CACHE_TTL`] and refreshing every
/// currently-healthy backend's `vllm:num_requests_{running,waiting}` gauge.
pub async fn run_load_refresh_loop(
    client: reqwest::Client,
    pools: PoolSource,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(LOAD_CACHE_TTL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for pool in pools().iter() {
                    let mut refreshes = Vec::new();
                    for backend in pool.snapshot_all() {
                        if backend.healthy {
                            refreshes.push(refresh_backend_load(&client, pool, &backend));
                        }
                    }
                    futures_util::future::join_all(refreshes).await;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn refresh_backend_load(
    client: &reqwest::Client,
    pool: &Arc<BackendPool>,
    backend: &crate::backend::Backend,
) {
    if let Some(last) = backend.last_load_refresh {
        if last.elapsed() < LOAD_CACHE_TTL {
            return;
        }
    }

    let url = format!("{}/metrics", backend.url());
    let resp = match client.get(&url).timeout(LOAD_PROBE_TIMEOUT).send().await {
        Ok(r) if r.status().is_success() => r,
        _ => return,
    };
    let Ok(text) = resp.text().await else { return };
    let metrics = parse_vllm_metrics(&text);
    let load = metrics.running + metrics.waiting;
    pool.set_load(&backend.host, backend.port, load, Instant::now());
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct VllmMetrics {
    pub running: u32,
    pub waiting: u32,
}

/// Parse the two vLLM Prometheus gauges this proxy cares about out of a
/// `/metrics` scrape. Any other line is ignored; malformed values are
/// dropped rather than failing the whole parse.
pub fn parse_vllm_metrics(text: &str) -> VllmMetrics {
    let mut metrics = VllmMetrics::default();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("vllm:num_requests_running") {
            if let Some(value) = last_field(rest) {
                metrics.running = value;
            }
        } else if let Some(rest) = line.strip_prefix("vllm:num_requests_waiting") {
            if let Some(value) = last_field(rest) {
                metrics.waiting = value;
            }
        }
    }
    metrics
}

fn last_field(rest: &str) -> Option<u32> {
    rest.split_whitespace()
        .last()
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_running_and_waiting() {
        let text = "\
vllm:num_requests_running{model=\"x\"} 3.0
vllm:num_requests_waiting{model=\"x\"} 7.0
vllm:some_other_metric 100.0
";
        let m = parse_vllm_metrics(text);
        assert_eq!(m, VllmMetrics { running: 3, waiting: 7 });
    }

    #[test]
    fn ignores_unrelated_lines_and_missing_values() {
        let m = parse_vllm_metrics("not a metrics line\n");
        assert_eq!(m, VllmMetrics::default());
    }

    #[tokio::test]
    async fn resilient_loop_restarts_after_error_then_exits_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let task = tokio::spawn(run_resilient("test", rx, move |_shutdown| {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n == 0 {
                    anyhow::bail!("first attempt fails");
                }
                Ok(())
            }
        }));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        tx.send(true).ok();
        let _ = task.await;
        assert!(attempts.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    }
}
