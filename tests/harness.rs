//! Shared test harness: spins up a real gateway instance bound to an
//! ephemeral port and wires it against `wiremock` stand-ins for backends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use llm_gateway::config::Config;
use llm_gateway::proxy::{self, AppState};

pub struct GatewayHandle {
    pub addr: SocketAddr,
    pub state: AppState,
}

impl GatewayHandle {
    /// Boots a gateway with the given config (bind_addr is ignored and
    /// replaced with an ephemeral port) and returns once it is accepting
    /// connections. No background loops (health/load/reconcile) are started;
    /// tests that need health transitions drive `state.pools()` directly.
    pub async fn spawn(mut config: Config) -> Self {
        config.bind_addr = "127.0.0.1:0".parse().unwrap();
        let client = reqwest::Client::builder().build().unwrap();
        let state = AppState::new(config, client);

        let app = proxy::router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .ok();
        });

        // Give the accept loop a moment to start serving.
        tokio::time::sleep(Duration::from_millis(10)).await;

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Registers a pool named `pool` containing one backend pointing at
/// `backend_addr` (a host:port pair, typically a `wiremock::MockServer`'s
/// `address()`).
pub fn register_backend(state: &AppState, pool: &str, backend_addr: SocketAddr) -> Arc<llm_gateway::BackendPool> {
    let p = state.pools().get_or_create(pool);
    p.add_backend(&backend_addr.ip().to_string(), backend_addr.port(), "");
    p
}

pub fn base_config() -> Config {
    let mut config = Config::default();
    config.request_timeout = Duration::from_millis(500);
    config
}
