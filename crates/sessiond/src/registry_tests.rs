// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::clock::FakeClock;
use crate::config::Limits;
use crate::error::ErrorKind;
use crate::pty::fake::FakeBackend;
use crate::session::Visibility;

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

fn registry(dir: &Path) -> Arc<Registry> {
    Registry::new(dir.to_path_buf(), Limits::default(), Arc::new(FakeClock::new()))
}

#[tokio::test]
async fn create_registers_and_lists_session() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let session = registry
        .create_with_backend(opts("s1"), Box::new(FakeBackend::empty()))
        .await;
    assert_eq!(session.id, "s1");
    assert!(registry.get("s1").await.is_some());

    let list = registry.list().await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, "s1");
}

#[tokio::test]
async fn alias_resolves_and_unknown_keys_fall_back_to_themselves() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());

    registry.register_alias("my-alias".to_string(), "s1".to_string()).await;
    assert_eq!(registry.resolve("my-alias").await, "s1");
    assert_eq!(registry.resolve("unregistered").await, "unregistered");

    registry.unregister_alias("my-alias").await;
    assert_eq!(registry.resolve("my-alias").await, "my-alias");
}

#[tokio::test]
async fn create_registers_alias_from_options() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let mut o = opts("s1");
    o.alias = Some("friendly".to_string());
    registry.create_with_backend(o, Box::new(FakeBackend::empty())).await;

    assert_eq!(registry.resolve("friendly").await, "s1");
}

#[tokio::test]
async fn terminate_moves_session_into_terminated_metadata_and_persists_json() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    registry
        .create_with_backend(opts("s2"), Box::new(FakeBackend::empty()))
        .await;

    registry.terminate("s2").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(350)).await;

    assert!(registry.get("s2").await.is_none());
    let terminated = registry.list_terminated().await;
    assert_eq!(terminated.len(), 1);
    assert_eq!(terminated[0].id, "s2");
    assert!(dir.path().join("s2.json").exists());
}

#[tokio::test]
async fn terminate_unknown_session_returns_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let err = registry.terminate("nope").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}
