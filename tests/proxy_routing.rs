mod harness;

use std::time::Duration;

use harness::{base_config, register_backend, GatewayHandle};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn round_robin_alternates_across_two_backends() {
    let backend_a = MockServer::start().await;
    let backend_b = MockServer::start().await;
    for backend in [&backend_a, &backend_b] {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(backend)
            .await;
    }

    let mut config = base_config();
    config.strategy = llm_gateway::config::Strategy::RoundRobin;
    let gateway = GatewayHandle::spawn(config).await;
    register_backend(&gateway.state, "llama", backend_a.address().to_owned());
    register_backend(&gateway.state, "llama", backend_b.address().to_owned());

    let client = reqwest::Client::new();
    for _ in 0..4 {
        let resp = client
            .post(gateway.url("/v1/chat/completions"))
            .json(&json!({"model": "llama", "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    assert_eq!(backend_a.received_requests().await.unwrap().len(), 2);
    assert_eq!(backend_b.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn explicit_model_path_routes_to_named_pool() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"object": "list", "data": []})))
        .mount(&backend)
        .await;

    let gateway = GatewayHandle::spawn(base_config()).await;
    register_backend(&gateway.state, "mixtral", backend.address().to_owned());

    let client = reqwest::Client::new();
    let resp = client.get(gateway.url("/mixtral/v1/models")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(backend.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_model_returns_404_with_available_pools() {
    let gateway = GatewayHandle::spawn(base_config()).await;
    register_backend(
        &gateway.state,
        "llama",
        MockServer::start().await.address().to_owned(),
    );

    let client = reqwest::Client::new();
    let resp = client
        .post(gateway.url("/v1/chat/completions"))
        .json(&json!({"model": "gpt-nonexistent", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["available"], json!(["llama"]));
}

#[tokio::test]
async fn substring_match_resolves_close_model_names() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&backend)
        .await;

    let gateway = GatewayHandle::spawn(base_config()).await;
    register_backend(&gateway.state, "llama-3-70b-instruct", backend.address().to_owned());

    let client = reqwest::Client::new();
    let resp = client
        .post(gateway.url("/v1/chat/completions"))
        .json(&json!({"model": "llama-3-70b", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn timeout_escalates_to_504_and_marks_unhealthy_after_three() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&backend)
        .await;

    let mut config = base_config();
    config.request_timeout = Duration::from_millis(100);
    let gateway = GatewayHandle::spawn(config).await;
    register_backend(&gateway.state, "llama", backend.address().to_owned());

    let client = reqwest::Client::new();
    for _ in 0..3 {
        let resp = client
            .post(gateway.url("/v1/chat/completions"))
            .json(&json!({"model": "llama", "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 504);
    }

    // Fourth request: no healthy backend left.
    let resp = client
        .post(gateway.url("/v1/chat/completions"))
        .json(&json!({"model": "llama", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
}
