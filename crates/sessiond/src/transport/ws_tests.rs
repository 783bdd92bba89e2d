// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Real-server WebSocket integration tests: binds an actual `TcpListener`
//! and connects with `tokio-tungstenite`, exercising the same protocol an
//! interactive client speaks, mirroring the teacher's `attach_tests.rs`
//! WS integration style.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use crate::clock::FakeClock;
use crate::config::{Config, Limits};
use crate::event::{ClientMessage, ServerEvent};
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

async fn spawn_test_server() -> (SocketAddr, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new(dir.path().to_path_buf(), Limits::default(), Arc::new(FakeClock::new()));
    let config = Config::parse_from(std::iter::once("sessiond"));
    let state = AppState {
        registry,
        config: Arc::new(config),
    };

    let app = build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Leak the tempdir's lifetime into the spawned server task by leaking
    // the TempDir itself; test processes are short-lived.
    std::mem::forget(dir);
    (addr, state)
}

async fn connect(addr: SocketAddr) -> (
    futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        Message,
    >,
    futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    >,
) {
    let url = format!("ws://{addr}/ws");
    let (stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    stream.split()
}

async fn send(tx: &mut (impl SinkExt<Message> + Unpin), msg: &ClientMessage) {
    let json = serde_json::to_string(msg).unwrap();
    let _ = tx.send(Message::Text(json.into())).await;
}

async fn recv_event(
    rx: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> ServerEvent {
    match tokio::time::timeout(Duration::from_secs(2), rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text message, got {other:?}"),
    }
}

#[tokio::test]
async fn attach_reports_offsets_and_detach_succeeds() {
    let (addr, state) = spawn_test_server().await;
    state
        .registry
        .create_with_backend(opts("s1"), Box::new(FakeBackend::new(vec![b"hello"])))
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (mut tx, mut rx) = connect(addr).await;
    send(&mut tx, &ClientMessage::Attach { session_id: "s1".to_string() }).await;
    match recv_event(&mut rx).await {
        ServerEvent::Attached { session_id, should_load_history, history_byte_offset, .. } => {
            assert_eq!(session_id, "s1");
            assert!(should_load_history);
            assert!(history_byte_offset > 0);
        }
        other => panic!("expected Attached, got {other:?}"),
    }

    send(&mut tx, &ClientMessage::Detach { session_id: "s1".to_string() }).await;
}

#[tokio::test]
async fn attach_unknown_session_returns_error() {
    let (addr, _state) = spawn_test_server().await;
    let (mut tx, mut rx) = connect(addr).await;

    send(&mut tx, &ClientMessage::Attach { session_id: "missing".to_string() }).await;
    match recv_event(&mut rx).await {
        ServerEvent::SessionUpdated { update_type, session_data } => {
            assert_eq!(update_type, "error");
            assert_eq!(session_data["code"], "NOT_FOUND");
        }
        other => panic!("expected an error SessionUpdated, got {other:?}"),
    }
}

#[tokio::test]
async fn stdin_requires_attach_first() {
    let (addr, state) = spawn_test_server().await;
    state
        .registry
        .create_with_backend(opts("s1"), Box::new(FakeBackend::empty()))
        .await;
    let (mut tx, mut rx) = connect(addr).await;

    send(
        &mut tx,
        &ClientMessage::Stdin { session_id: "s1".to_string(), data: "echo hi".to_string() },
    )
    .await;
    match recv_event(&mut rx).await {
        ServerEvent::SessionUpdated { update_type, session_data } => {
            assert_eq!(update_type, "error");
            assert_eq!(session_data["code"], "CONFLICT");
        }
        other => panic!("expected an error SessionUpdated, got {other:?}"),
    }
}

#[tokio::test]
async fn stdin_after_attach_writes_to_backend() {
    let (addr, state) = spawn_test_server().await;
    let backend = FakeBackend::empty();
    let written = backend.written();
    state.registry.create_with_backend(opts("s1"), Box::new(backend)).await;

    let (mut tx, mut rx) = connect(addr).await;
    send(&mut tx, &ClientMessage::Attach { session_id: "s1".to_string() }).await;
    let _ = recv_event(&mut rx).await;

    send(
        &mut tx,
        &ClientMessage::Stdin { session_id: "s1".to_string(), data: "hi".to_string() },
    )
    .await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    let buf = written.lock().unwrap();
    assert!(buf.starts_with(b"hi"));
}

#[tokio::test]
async fn ping_gets_pong_reply() {
    let (addr, _state) = spawn_test_server().await;
    let (mut tx, mut rx) = connect(addr).await;

    send(&mut tx, &ClientMessage::Ping { timestamp: 42 }).await;
    match recv_event(&mut rx).await {
        ServerEvent::Pong { timestamp } => {
            assert_eq!(timestamp, 42);
        }
        other => panic!("expected a Pong, got {other:?}"),
    }
}

#[tokio::test]
async fn ws_rejects_bad_token_when_auth_configured() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new(dir.path().to_path_buf(), Limits::default(), Arc::new(FakeClock::new()));
    let mut config = Config::parse_from(std::iter::once("sessiond"));
    config.auth_token = Some("secret".to_string());
    let state = AppState {
        registry,
        config: Arc::new(config),
    };
    let app = build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    std::mem::forget(dir);

    let url = format!("ws://{addr}/ws");
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());

    let url = format!("ws://{addr}/ws?token=secret");
    assert!(tokio_tungstenite::connect_async(&url).await.is_ok());
}
