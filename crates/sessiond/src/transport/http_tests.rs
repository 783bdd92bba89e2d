// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use clap::Parser;
use tempfile::TempDir;

use crate::clock::FakeClock;
use crate::config::{Config, Limits};
use crate::pty::fake::FakeBackend;
use crate::registry::Registry;
use crate::session::{CreateOptions, Visibility};
use crate::transport::build_router;
use crate::transport::state::AppState;

fn opts(id: &str) -> CreateOptions {
    CreateOptions {
        id: id.to_string(),
        command: vec!["/bin/sh".to_string()],
        cwd: None,
        env: Vec::new(),
        cols: 80,
        rows: 24,
        visibility: Visibility::Private,
        alias: None,
        owner: Some("alice".to_string()),
        interactive: true,
        created_by: "alice".to_string(),
        sessions_dir: None,
    }
}

fn test_state() -> (AppState, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new(dir.path().to_path_buf(), Limits::default(), Arc::new(FakeClock::new()));
    let config = Config::parse_from(std::iter::once("sessiond"));
    (
        AppState {
            registry,
            config: Arc::new(config),
        },
        dir,
    )
}

#[tokio::test]
async fn health_and_ready_are_ok() {
    let (state, _dir) = test_state();
    let app = build_router(state);
    let server = axum_test::TestServer::new(app).unwrap();

    let resp = server.get("/api/v1/health").await;
    resp.assert_status(StatusCode::OK);

    let resp = server.get("/api/v1/ready").await;
    resp.assert_status(StatusCode::OK);
}

#[tokio::test]
async fn auth_exempts_health_and_ready_but_requires_token_elsewhere() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new(dir.path().to_path_buf(), Limits::default(), Arc::new(FakeClock::new()));
    let mut config = Config::parse_from(std::iter::once("sessiond"));
    config.auth_token = Some("secret".to_string());
    let state = AppState {
        registry,
        config: Arc::new(config),
    };
    let app = build_router(state);
    let server = axum_test::TestServer::new(app).unwrap();

    let resp = server.get("/api/v1/health").await;
    resp.assert_status(StatusCode::OK);

    let resp = server.get("/api/v1/sessions").await;
    resp.assert_status(StatusCode::UNAUTHORIZED);

    let resp = server
        .get("/api/v1/sessions")
        .add_header(
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderValue::from_static("Bearer secret"),
        )
        .await;
    resp.assert_status(StatusCode::OK);
}

#[tokio::test]
async fn create_session_spawns_and_lists() {
    let (state, _dir) = test_state();
    let app = build_router(state);
    let server = axum_test::TestServer::new(app).unwrap();

    let resp = server
        .post("/api/v1/sessions")
        .json(&serde_json::json!({
            "command": ["echo", "hello"],
            "cols": 80,
            "rows": 24,
        }))
        .await;
    resp.assert_status(StatusCode::CREATED);
    let body: serde_json::Value = resp.json();
    let id = body["id"].as_str().unwrap().to_string();
    assert!(body["is_active"].as_bool().unwrap());

    let resp = server.get("/api/v1/sessions").await;
    resp.assert_status(StatusCode::OK);
    let list: Vec<serde_json::Value> = resp.json();
    assert!(list.iter().any(|s| s["id"] == id));
}

#[tokio::test]
async fn get_session_not_found() {
    let (state, _dir) = test_state();
    let app = build_router(state);
    let server = axum_test::TestServer::new(app).unwrap();

    let resp = server.get("/api/v1/sessions/does-not-exist").await;
    resp.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn resize_session_updates_cols_and_rows() {
    let (state, _dir) = test_state();
    state
        .registry
        .create_with_backend(opts("s1"), Box::new(FakeBackend::empty()))
        .await;
    let app = build_router(state);
    let server = axum_test::TestServer::new(app).unwrap();

    let resp = server
        .post("/api/v1/sessions/s1/resize")
        .json(&serde_json::json!({"cols": 120, "rows": 40}))
        .await;
    resp.assert_status(StatusCode::NO_CONTENT);

    let resp = server.get("/api/v1/sessions/s1").await;
    let body: serde_json::Value = resp.json();
    assert_eq!(body["cols"], 120);
    assert_eq!(body["rows"], 40);
}

#[tokio::test]
async fn post_stdin_writes_raw_bytes() {
    let (state, _dir) = test_state();
    let backend = FakeBackend::empty();
    let written = backend.written();
    state.registry.create_with_backend(opts("s1"), Box::new(backend)).await;
    let app = build_router(state);
    let server = axum_test::TestServer::new(app).unwrap();

    let resp = server
        .post("/api/v1/sessions/s1/stdin")
        .json(&serde_json::json!({"data": "echo hi", "raw": true}))
        .await;
    resp.assert_status(StatusCode::OK);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["outcome"], "written");
    assert_eq!(body["bytes"], 7);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(&written.lock().unwrap()[..], b"echo hi");
}

#[tokio::test]
async fn post_stdin_rejects_invalid_enter_style() {
    let (state, _dir) = test_state();
    state
        .registry
        .create_with_backend(opts("s1"), Box::new(FakeBackend::empty()))
        .await;
    let app = build_router(state);
    let server = axum_test::TestServer::new(app).unwrap();

    let resp = server
        .post("/api/v1/sessions/s1/stdin")
        .json(&serde_json::json!({"data": "x", "raw": true, "enter_style": "bogus"}))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_history_returns_prefix() {
    let (state, _dir) = test_state();
    state
        .registry
        .create_with_backend(opts("s1"), Box::new(FakeBackend::new(vec![b"hello"])))
        .await;
    let app = build_router(state);
    let server = axum_test::TestServer::new(app).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let resp = server.get("/api/v1/sessions/s1/history?offset=0").await;
    resp.assert_status(StatusCode::OK);
    let body: serde_json::Value = resp.json();
    assert!(body["data"].as_str().unwrap().contains("hello"));
}

#[tokio::test]
async fn rule_crud_round_trip() {
    let (state, _dir) = test_state();
    state
        .registry
        .create_with_backend(opts("s1"), Box::new(FakeBackend::empty()))
        .await;
    let app = build_router(state);
    let server = axum_test::TestServer::new(app).unwrap();

    let resp = server
        .post("/api/v1/sessions/s1/rules")
        .json(&serde_json::json!({
            "kind": "interval",
            "data": "status\n",
            "interval_ms": 60000,
        }))
        .await;
    resp.assert_status(StatusCode::OK);
    let body: serde_json::Value = resp.json();
    let rule_id = body["rule_id"].as_str().unwrap().to_string();

    let resp = server.get("/api/v1/sessions/s1/rules").await;
    resp.assert_status(StatusCode::OK);
    let rules: Vec<serde_json::Value> = resp.json();
    assert_eq!(rules.len(), 1);

    let resp = server
        .delete(&format!("/api/v1/sessions/s1/rules/{rule_id}"))
        .await;
    resp.assert_status(StatusCode::NO_CONTENT);

    let resp = server.delete(&format!("/api/v1/sessions/s1/rules/{rule_id}")).await;
    resp.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deferred_list_delete_clear() {
    let (state, _dir) = test_state();
    let session = state
        .registry
        .create_with_backend(opts("s1"), Box::new(FakeBackend::empty()))
        .await;
    session
        .inject(crate::input::InjectOptions {
            data: "queued".to_string(),
            raw: true,
            activity_policy: crate::input::ActivityPolicy::Defer,
            by: "bob".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let app = build_router(state);
    let server = axum_test::TestServer::new(app).unwrap();

    let resp = server.get("/api/v1/sessions/s1/deferred").await;
    resp.assert_status(StatusCode::OK);
    let entries: Vec<serde_json::Value> = resp.json();
    assert_eq!(entries.len(), 1);
    let entry_id = entries[0]["id"].as_str().unwrap().to_string();

    let resp = server
        .delete(&format!("/api/v1/sessions/s1/deferred/{entry_id}"))
        .await;
    resp.assert_status(StatusCode::NO_CONTENT);

    let resp = server.delete("/api/v1/sessions/s1/deferred/missing").await;
    resp.assert_status(StatusCode::NOT_FOUND);

    let resp = server.delete("/api/v1/sessions/s1/deferred").await;
    resp.assert_status(StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn stop_inputs_crud() {
    let (state, _dir) = test_state();
    state
        .registry
        .create_with_backend(opts("s1"), Box::new(FakeBackend::empty()))
        .await;
    let app = build_router(state);
    let server = axum_test::TestServer::new(app).unwrap();

    let resp = server
        .post("/api/v1/sessions/s1/stop-inputs")
        .json(&serde_json::json!({"prompt": "are you stuck?"}))
        .await;
    resp.assert_status(StatusCode::OK);
    let body: serde_json::Value = resp.json();
    let id = body["id"].as_str().unwrap().to_string();

    let resp = server.get("/api/v1/sessions/s1/stop-inputs").await;
    let list: Vec<serde_json::Value> = resp.json();
    assert_eq!(list.len(), 1);

    let resp = server
        .put("/api/v1/sessions/s1/stop-inputs/enabled")
        .json(&serde_json::json!({"enabled": false}))
        .await;
    resp.assert_status(StatusCode::NO_CONTENT);

    let resp = server.delete(&format!("/api/v1/sessions/s1/stop-inputs/{id}")).await;
    resp.assert_status(StatusCode::NO_CONTENT);

    let resp = server.delete(&format!("/api/v1/sessions/s1/stop-inputs/{id}")).await;
    resp.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn terminate_session_returns_no_content_then_not_found() {
    let (state, _dir) = test_state();
    state
        .registry
        .create_with_backend(opts("s1"), Box::new(FakeBackend::empty()))
        .await;
    let app = build_router(state);
    let server = axum_test::TestServer::new(app).unwrap();

    let resp = server.post("/api/v1/sessions/s1/terminate").await;
    resp.assert_status(StatusCode::NO_CONTENT);

    let resp = server.post("/api/v1/sessions/does-not-exist/terminate").await;
    resp.assert_status(StatusCode::NOT_FOUND);
}
