//! Smoke-tests the thin AI-client-facing HTTP surface itself (`POST /rpc`,
//! `GET /healthz`), as opposed to `scenarios.rs`, which drives the
//! dispatcher's public API directly. This is the one place the full stack —
//! HTTP request parsing, the session-id header contract, response framing —
//! is actually exercised end-to-end.

mod common;

use common::{connect_mock_extension, next_port, start_broker, wait_for_connection, Scripted};
use serde_json::json;
use tempfile::tempdir;

#[tokio::test]
async fn rpc_over_http_round_trips_a_command() {
    let dir = tempdir().unwrap();
    let port = next_port();
    let broker = start_broker(dir.path().join("ports.json"), port).await;

    connect_mock_extension(
        port,
        Box::new(|_payload| Scripted::Success { tab_id: Some(7), data: json!({"title": "example"}) }),
    )
    .await;
    wait_for_connection(&broker).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = listener.local_addr().unwrap();
    let router = broker.router();
    let server = tokio::spawn(async move { axum::serve(listener, router).await });

    let client = reqwest::Client::new();

    let healthz = client.get(format!("http://{http_addr}/healthz")).send().await.unwrap();
    assert_eq!(healthz.status(), reqwest::StatusCode::OK);

    let rpc = client
        .post(format!("http://{http_addr}/rpc"))
        .header("x-broker-session-id", "sess-http")
        .json(&json!({"name": "dom.click", "payload": {}, "tabId": 7}))
        .send()
        .await
        .unwrap();
    assert_eq!(rpc.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = rpc.json().await.unwrap();
    assert_eq!(body["data"]["title"], "example");
    assert_eq!(body["attempts"], 1);

    let missing_header = client
        .post(format!("http://{http_addr}/rpc"))
        .json(&json!({"name": "dom.click", "payload": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_header.status(), reqwest::StatusCode::BAD_REQUEST);

    server.abort();
    broker.shutdown().await;
}
