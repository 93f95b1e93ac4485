//! llm-gateway
//!
//! Load-balancing reverse proxy for GPU-resident LLM replicas.
//!
//! This service:
//! - Exposes a single OpenAI-compatible HTTP endpoint across all registered
//!   model pools
//! - Tracks per-backend health and GPU load, and per-request/session state
//! - Reconciles the live backend set against an external cluster enumerator

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use llm_gateway::config::Config;
use llm_gateway::external::{NullTunnelManager, StaticClusterEnumerator};
use llm_gateway::health;
use llm_gateway::proxy::{self, AppState};
use llm_gateway::reconcile::Reconciler;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting llm-gateway");
    info!(
        bind_addr = %config.bind_addr,
        strategy = config.strategy.as_str(),
        poll_interval_secs = config.poll_interval.as_secs(),
        "Configuration loaded"
    );

    let client = reqwest::Client::builder()
        .build()
        .expect("reqwest client builder never fails without TLS config overrides");

    let state = AppState::new(config.clone(), client);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cleanup_handle = tokio::spawn({
        let state = state.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            state.tracker().run_cleanup_loop(shutdown_rx).await;
        }
    });

    let health_handle = tokio::spawn({
        let state = state.clone();
        let shutdown_rx = shutdown_rx.clone();
        let interval = config.health_check_interval;
        async move {
            let pools: health::PoolSource = {
                let state = state.clone();
                Arc::new(move || state.pools().all())
            };
            health::run_resilient("health-check", shutdown_rx.clone(), move |rx| {
                let client = state.client().clone();
                let pools = Arc::clone(&pools);
                health::run_health_check_loop(client, pools, interval, rx)
            })
            .await;
        }
    });

    let load_handle = tokio::spawn({
        let state = state.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            let pools: health::PoolSource = {
                let state = state.clone();
                Arc::new(move || state.pools().all())
            };
            health::run_resilient("load-refresh", shutdown_rx.clone(), move |rx| {
                let client = state.client().clone();
                let pools = Arc::clone(&pools);
                health::run_load_refresh_loop(client, pools, rx)
            })
            .await;
        }
    });

    // The cluster job submitter and tunnel manager are external
    // collaborators (out of scope for this crate); this wires the
    // reconciliation loop against no-op implementations so the proxy runs
    // standalone. A real deployment substitutes its own `ClusterEnumerator`
    // and `TunnelManager`.
    let reconcile_handle = tokio::spawn({
        let state = state.clone();
        let shutdown_rx = shutdown_rx.clone();
        let base_ports = config.base_ports.clone();
        let poll_interval = config.poll_interval;
        async move {
            let pools_fn = {
                let state = state.clone();
                Arc::new(move |name: &str| state.pools().get_or_create(name))
            };
            let reconciler = Reconciler::with_probe_client(
                Arc::new(StaticClusterEnumerator::new(Default::default())),
                Arc::new(NullTunnelManager),
                pools_fn,
                base_ports,
                poll_interval,
                state.client().clone(),
            );
            reconciler.run(shutdown_rx).await;
        }
    });

    let app = proxy::router(state.clone());
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "Listening for connections");

    let server_shutdown_rx = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let mut rx = server_shutdown_rx;
            loop {
                if *rx.borrow() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
            info!("HTTP server shutting down");
        })
        .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for background workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    for (name, handle) in [
        ("tracker cleanup", cleanup_handle),
        ("health check", health_handle),
        ("load refresh", load_handle),
        ("reconciliation", reconcile_handle),
    ] {
        if tokio::time::timeout(shutdown_timeout, handle).await.is_err() {
            warn!(worker = name, "worker did not shut down in time");
        }
    }

    info!("llm-gateway shutdown complete");
    Ok(())
}
