//! End-to-end API tests against a simulated reader and a mock backend.

#![cfg(not(feature = "pcsc"))]

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use cardrelay_core::{CardTechnology, Config, MockReader, Target};
use cardrelay_server::api::create_router;
use cardrelay_server::state::AppState;
use httpmock::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

const URI: &str = "cardrelay://scan?scan_id=abc123&client_id=xyz&callback=ws";

struct Harness {
    server: TestServer,
    _data: TempDir,
}

fn harness(reader: MockReader, backend: &MockServer, configure: impl FnOnce(&mut Config)) -> Harness {
    let data = TempDir::new().unwrap();
    let mut config = Config::default();
    config.delivery.endpoint = backend.url("/api/scans");
    config.storage.data_dir = Some(data.path().to_path_buf());
    configure(&mut config);

    let state = Arc::new(AppState::new(config, reader).unwrap());
    let server = TestServer::new(create_router(state)).unwrap();
    Harness {
        server,
        _data: data,
    }
}

fn card_reader() -> MockReader {
    MockReader::new()
        .with_card(
            Duration::from_millis(50),
            Target::new("slot-0", CardTechnology::Felica),
        )
        .with_identifier(vec![0x01, 0x27, 0x00, 0x5d, 0x2a, 0x1b, 0x3c, 0x4d])
}

async fn wait_for_result(server: &TestServer, scan_id: &str) -> Value {
    for _ in 0..200 {
        let response = server.get(&format!("/api/results/{scan_id}")).await;
        if response.status_code() == StatusCode::OK {
            let body: Value = response.json();
            if body["status"] != "pending" {
                return body;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("scan {scan_id} did not finish");
}

async fn wait_for_idle(server: &TestServer) {
    for _ in 0..200 {
        let body: Value = server.get("/api/session").await.json();
        if body["active"] == false {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("session did not become idle");
}

#[tokio::test]
async fn test_health_reports_reader() {
    let backend = MockServer::start_async().await;
    let h = harness(card_reader(), &backend, |_| {});

    let response = h.server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["reader"], "mock");
    assert_eq!(body["session_active"], false);
}

#[tokio::test]
async fn test_activation_is_scanned_delivered_and_recorded() {
    let backend = MockServer::start_async().await;
    let scans = backend
        .mock_async(|when, then| {
            when.method(POST).path("/api/scans").json_body_partial(
                r#"{"scan_id":"abc123","client_id":"xyz","card_id":"felica:0127005D2A1B3C4D","success":true}"#,
            );
            then.status(201);
        })
        .await;
    let h = harness(card_reader(), &backend, |_| {});

    let response = h.server.post("/api/activations").json(&json!({ "uri": URI })).await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["scan_id"], "abc123");
    assert!(body["session_id"].is_string());

    let result = wait_for_result(&h.server, "abc123").await;
    assert_eq!(result["status"], "succeeded");
    assert_eq!(result["card_id"], "felica:0127005D2A1B3C4D");
    assert_eq!(result["callback_hint"], "ws");
    assert_eq!(result["phase"]["phase"], "succeeded");
    scans.assert_async().await;

    wait_for_idle(&h.server).await;
}

#[tokio::test]
async fn test_invalid_activation_is_rejected() {
    let backend = MockServer::start_async().await;
    let h = harness(card_reader(), &backend, |_| {});

    let response = h
        .server
        .post("/api/activations")
        .json(&json!({ "uri": "cardrelay://scan?client_id=xyz" }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"], "missing_field");

    let response = h
        .server
        .post("/api/activations")
        .json(&json!({ "uri": "https://example.com/scan?scan_id=a&client_id=b" }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"], "invalid_activation");

    let body: Value = h.server.get("/api/session").await.json();
    assert_eq!(body["active"], false);
    assert_eq!(body["phase"]["phase"], "idle");
}

#[tokio::test]
async fn test_second_activation_conflicts_and_cancel_reports_cancelled() {
    let backend = MockServer::start_async().await;
    let scans = backend
        .mock_async(|when, then| {
            when.method(POST).path("/api/scans");
            then.status(200);
        })
        .await;
    let h = harness(MockReader::new(), &backend, |config| {
        config.session.timeout_ms = 60_000;
    });

    h.server
        .post("/api/activations")
        .json(&json!({ "uri": URI }))
        .await
        .assert_status(StatusCode::ACCEPTED);

    let response = h
        .server
        .post("/api/activations")
        .json(&json!({ "uri": "cardrelay://scan?scan_id=other&client_id=xyz" }))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["error"], "session_active");
    assert_eq!(body["details"]["active_scan_id"], "abc123");

    let body: Value = h.server.get("/api/session").await.json();
    assert_eq!(body["active"], true);
    assert_eq!(body["scan_id"], "abc123");

    let response = h.server.post("/api/session/cancel").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["scan_id"], "abc123");

    let result = wait_for_result(&h.server, "abc123").await;
    assert_eq!(result["status"], "failed");
    assert_eq!(result["error_kind"], "cancelled");
    assert!(result["card_id"].is_null());

    wait_for_idle(&h.server).await;
    scans.assert_hits_async(0).await;
}

#[tokio::test]
async fn test_cancel_reaches_earlier_activation_still_delivering() {
    let backend = MockServer::start_async().await;
    backend
        .mock_async(|when, then| {
            when.method(POST).path("/api/scans");
            then.status(503);
        })
        .await;
    let h = harness(card_reader(), &backend, |config| {
        config.delivery.max_attempts = 3;
        config.delivery.base_delay_ms = 5_000;
        config.delivery.max_delay_ms = 5_000;
    });

    h.server
        .post("/api/activations")
        .json(&json!({ "uri": URI }))
        .await
        .assert_status(StatusCode::ACCEPTED);

    // The reader is released once the card is read; delivery keeps retrying.
    let mut released = false;
    for _ in 0..200 {
        let session: Value = h.server.get("/api/session").await.json();
        let health: Value = h.server.get("/health").await.json();
        if session["phase"]["phase"] == "succeeded" && health["session_active"] == false {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(released, "first scan never finished reading");

    h.server
        .post("/api/activations")
        .json(&json!({ "uri": "cardrelay://scan?scan_id=second&client_id=xyz" }))
        .await
        .assert_status(StatusCode::ACCEPTED);

    let response = h.server.post("/api/session/cancel").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["scan_id"], "second");

    let first = wait_for_result(&h.server, "abc123").await;
    assert_eq!(first["status"], "failed");
    assert_eq!(first["error_kind"], "cancelled");

    let second = wait_for_result(&h.server, "second").await;
    assert_eq!(second["status"], "failed");
    assert_eq!(second["error_kind"], "cancelled");

    wait_for_idle(&h.server).await;
}

#[tokio::test]
async fn test_cancel_without_session_is_not_found() {
    let backend = MockServer::start_async().await;
    let h = harness(card_reader(), &backend, |_| {});

    let response = h.server.post("/api/session/cancel").await;
    response.assert_status_not_found();
    let body: Value = response.json();
    assert_eq!(body["error"], "no_active_session");
}

#[tokio::test]
async fn test_unknown_result_is_not_found() {
    let backend = MockServer::start_async().await;
    let h = harness(card_reader(), &backend, |_| {});

    let response = h.server.get("/api/results/nope").await;
    response.assert_status_not_found();
    let body: Value = response.json();
    assert_eq!(body["error"], "scan_not_found");
}

#[tokio::test]
async fn test_exhausted_delivery_is_listed_as_failed() {
    let backend = MockServer::start_async().await;
    let scans = backend
        .mock_async(|when, then| {
            when.method(POST).path("/api/scans");
            then.status(503);
        })
        .await;
    let h = harness(card_reader(), &backend, |config| {
        config.delivery.max_attempts = 2;
        config.delivery.base_delay_ms = 10;
        config.delivery.max_delay_ms = 20;
    });

    let body: Value = h.server.get("/api/deliveries/failed").await.json();
    assert_eq!(body["total"], 0);

    h.server
        .post("/api/activations")
        .json(&json!({ "uri": URI }))
        .await
        .assert_status(StatusCode::ACCEPTED);

    let result = wait_for_result(&h.server, "abc123").await;
    assert_eq!(result["status"], "failed");
    assert_eq!(result["error_kind"], "server_error");
    scans.assert_hits_async(2).await;

    let response = h.server.get("/api/deliveries/failed").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["total"], 1);
    assert_eq!(body["records"][0]["outcome"]["scan_id"], "abc123");
    assert_eq!(body["records"][0]["failure"]["status"], 503);
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let backend = MockServer::start_async().await;
    let h = harness(card_reader(), &backend, |_| {});

    let response = h.server.get("/api/openapi.json").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["info"]["title"], "cardrelay API");
    assert!(body["paths"]["/api/session/cancel"].is_object());
}
