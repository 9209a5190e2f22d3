mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};

use common::*;
use vault_link::auth::hash_password;
use vault_link::{LinkConfig, LinkError, NetworkClass, TransportMode, VaultConnection, VaultEvent};

const PASSWORD: &str = "correct horse";

/// Fake vault plugin: checks the hash, records every body it gets.
async fn spawn_local_vault() -> (String, Arc<Mutex<Vec<Value>>>) {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();
    let expected = hash_password(PASSWORD);
    let router = Router::new().route(
        "/api/command",
        post(move |Json(body): Json<Value>| {
            let seen = seen.clone();
            let expected = expected.clone();
            async move {
                seen.lock().push(body.clone());
                if body["authHash"] != expected.as_str() {
                    return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad hash"})));
                }
                let cmd = body["cmd"].as_str().unwrap_or_default().to_string();
                match cmd.as_str() {
                    "PING" => (StatusCode::OK, Json(json!({"data": {"css": "body { color: red; }"}}))),
                    "BROKEN" => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))),
                    _ => (
                        StatusCode::OK,
                        Json(json!({"type": cmd, "data": {"path": body["path"]}})),
                    ),
                }
            }
        }),
    );
    let addr = serve(router).await;
    (format!("http://{addr}/api/command"), requests)
}

fn local_config(endpoint: &str) -> LinkConfig {
    LinkConfig {
        host: "127.0.0.1".into(),
        local_endpoint: endpoint.into(),
        ..LinkConfig::default()
    }
}

fn commands(requests: &Mutex<Vec<Value>>) -> Vec<String> {
    requests
        .lock()
        .iter()
        .map(|body| body["cmd"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn login_pings_once_then_loads_bootstrap_data() {
    let (endpoint, requests) = spawn_local_vault().await;
    let connection = VaultConnection::new(local_config(&endpoint));
    let status = RecordingStatus::default();

    assert_eq!(connection.mode(), TransportMode::Local);
    assert!(connection.connect(PASSWORD, &status).await.unwrap());

    assert_eq!(commands(&requests), ["PING", "GET_TREE", "LOAD_TAGS", "LOAD_GRAPH"]);
    let expected = hash_password(PASSWORD);
    assert!(requests
        .lock()
        .iter()
        .all(|body| body["authHash"] == expected.as_str()));
    assert_eq!(status.themes(), ["body { color: red; }".to_string()]);
    assert_eq!(
        status.lines(),
        ["Using Local HTTP Mode".to_string(), "Authenticated. Fetching Data...".to_string()]
    );
    assert_eq!(connection.network(), Some(NetworkClass::Lan));
    assert!(connection.client_id().is_none());
}

#[tokio::test]
async fn wrong_password_fails_after_one_request() {
    let (endpoint, requests) = spawn_local_vault().await;
    let connection = VaultConnection::new(local_config(&endpoint));

    let err = connection
        .connect("wrong", &RecordingStatus::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::AuthenticationFailed));
    assert_eq!(commands(&requests), ["PING"]);
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn replies_are_returned_and_delivered() {
    let (endpoint, _requests) = spawn_local_vault().await;
    let connection = VaultConnection::new(local_config(&endpoint));
    let events = collect_events(&connection);
    connection
        .connect(PASSWORD, &RecordingStatus::default())
        .await
        .unwrap();

    let reply = connection
        .send("LOAD_FILE", json!({"path": "daily/today.md"}))
        .await
        .unwrap();
    assert_eq!(reply["data"]["path"], "daily/today.md");

    let events = events.lock();
    assert_eq!(events[0], VaultEvent::Connected);
    let delivered: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            VaultEvent::Message(message) => message["type"].as_str().map(str::to_string),
            _ => None,
        })
        .collect();
    assert_eq!(delivered, ["GET_TREE", "LOAD_TAGS", "LOAD_GRAPH", "LOAD_FILE"]);
}

#[tokio::test]
async fn failing_command_is_a_transport_error() {
    let (endpoint, _requests) = spawn_local_vault().await;
    let connection = VaultConnection::new(local_config(&endpoint));
    connection
        .connect(PASSWORD, &RecordingStatus::default())
        .await
        .unwrap();

    let err = connection.send("BROKEN", Value::Null).await.unwrap_err();
    match err {
        LinkError::Transport(reason) => assert_eq!(reason, "HTTP request failed: 500"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(connection.is_connected());
}

#[tokio::test]
async fn send_before_login_is_not_connected() {
    let (endpoint, requests) = spawn_local_vault().await;
    let connection = VaultConnection::new(local_config(&endpoint));
    assert!(matches!(
        connection.send("GET_TREE", Value::Null).await,
        Err(LinkError::NotConnected)
    ));
    assert!(requests.lock().is_empty());
}

#[tokio::test]
async fn shutdown_forgets_credentials() {
    let (endpoint, _requests) = spawn_local_vault().await;
    let telemetry = Arc::new(RecordingTelemetry::default());
    let connection =
        VaultConnection::new(local_config(&endpoint)).with_telemetry(telemetry.clone());
    connection
        .connect(PASSWORD, &RecordingStatus::default())
        .await
        .unwrap();
    connection.shutdown().await;
    assert!(!connection.is_connected());
    assert_eq!(telemetry.flushes.load(std::sync::atomic::Ordering::SeqCst), 1);
}
