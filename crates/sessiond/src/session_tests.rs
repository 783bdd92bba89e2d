// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{FakeClock, FixedWindowLimiter};
use crate::config::Limits;
use crate::input::{ActivityPolicy, EnterStyle, InjectOptions, InjectOutcome, InjectSource};
use crate::pty::fake::FakeBackend;
use crate::scheduler::RuleKind;

use super::*;

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

fn global_limiter() -> Arc<FixedWindowLimiter> {
    Arc::new(FixedWindowLimiter::new(1_000_000))
}

fn fast_limits() -> Limits {
    let mut limits = Limits::default();
    limits.activity_inactive_after_ms = 50;
    limits.stop_inputs_grace_ms = 0;
    limits.stop_inputs_session_start_grace_ms = 0;
    limits
}

#[tokio::test]
async fn spawn_reports_command_preview_and_summary() {
    let clock = Arc::new(FakeClock::new());
    let session = Session::spawn_with_backend(opts("s1"), Box::new(FakeBackend::empty()), Limits::default(), clock, global_limiter());
    assert_eq!(session.command_preview, "/bin/sh");
    let summary = session.summary().await;
    assert!(summary.is_active);
    assert_eq!(summary.activity_state, ActivityState::Active);
}

#[tokio::test]
async fn resize_clamps_below_minimum() {
    let clock = Arc::new(FakeClock::new());
    let session = Session::spawn_with_backend(opts("s1"), Box::new(FakeBackend::empty()), Limits::default(), clock, global_limiter());
    session.resize(1, 1).await.unwrap();
    let summary = session.summary().await;
    assert_eq!(summary.cols, MIN_COLS);
    assert_eq!(summary.rows, MIN_ROWS);
}

#[tokio::test]
async fn inject_raw_writes_immediately_and_notifies() {
    let clock = Arc::new(FakeClock::new());
    let backend = FakeBackend::empty();
    let written = backend.written();
    let session = Session::spawn_with_backend(opts("s1"), Box::new(backend), Limits::default(), clock, global_limiter());

    let mut rx = session.subscribe();
    let outcome = session
        .inject(InjectOptions {
            data: "echo hi".to_string(),
            raw: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome, InjectOutcome::Written { bytes: 7 });

    // Give the backend task a chance to drain the input channel.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(&written.lock().unwrap()[..], b"echo hi");

    let event = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, ServerEvent::StdinInjected { bytes: 7, .. }));
}

#[tokio::test]
async fn inject_suppress_policy_is_suppressed_while_active() {
    let clock = Arc::new(FakeClock::new());
    let backend = FakeBackend::new(vec![b"hello"]);
    let session = Session::spawn_with_backend(opts("s1"), Box::new(backend), Limits::default(), clock, global_limiter());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.summary().await.activity_state, ActivityState::Active);

    let outcome = session
        .inject(InjectOptions {
            data: "x".to_string(),
            raw: true,
            activity_policy: ActivityPolicy::Suppress,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome, InjectOutcome::Suppressed { reason: "active" });
}

#[tokio::test]
async fn inject_defer_policy_queues_and_drains_on_inactivity() {
    let clock = Arc::new(FakeClock::new());
    let backend = FakeBackend::new(vec![b"hello"]);
    let written = backend.written();
    let session = Session::spawn_with_backend(opts("s1"), Box::new(backend), fast_limits(), clock.clone(), global_limiter());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcome = session
        .inject(InjectOptions {
            data: "deferred-payload".to_string(),
            raw: true,
            activity_policy: ActivityPolicy::Defer,
            by: "bob".to_string(),
            source: InjectSource::Api,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome, InjectOutcome::Deferred);
    assert_eq!(session.list_deferred().await.len(), 1);

    clock.advance(1_000);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(session.list_deferred().await.is_empty());
    assert_eq!(&written.lock().unwrap()[..], b"deferred-payload");
}

#[tokio::test]
async fn delete_and_clear_deferred() {
    let clock = Arc::new(FakeClock::new());
    let session = Session::spawn_with_backend(opts("s1"), Box::new(FakeBackend::empty()), Limits::default(), clock, global_limiter());

    session
        .inject(InjectOptions {
            data: "a".to_string(),
            raw: true,
            activity_policy: ActivityPolicy::Defer,
            by: "a".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    session
        .inject(InjectOptions {
            data: "b".to_string(),
            raw: true,
            activity_policy: ActivityPolicy::Defer,
            by: "b".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(session.list_deferred().await.len(), 2);

    let id = session.list_deferred().await[0].id.clone();
    assert!(session.delete_deferred(&id).await.unwrap());
    assert_eq!(session.list_deferred().await.len(), 1);
    assert!(!session.delete_deferred("missing").await.unwrap());

    session.clear_deferred().await.unwrap();
    assert!(session.list_deferred().await.is_empty());
}

#[tokio::test]
async fn stop_inputs_add_list_remove() {
    let clock = Arc::new(FakeClock::new());
    let session = Session::spawn_with_backend(opts("s1"), Box::new(FakeBackend::empty()), Limits::default(), clock, global_limiter());

    let id = session
        .add_stop_input("are you stuck?".to_string(), StopInputSource::User, true)
        .await
        .unwrap();
    let list = session.list_stop_inputs().await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, id);
    assert!(list[0].armed);

    assert!(session.remove_stop_input(&id).await.unwrap());
    assert!(session.list_stop_inputs().await.is_empty());
    assert!(!session.remove_stop_input(&id).await.unwrap());
}

#[tokio::test]
async fn stop_inputs_fire_on_inactivity_after_grace_periods() {
    let clock = Arc::new(FakeClock::new());
    let backend = FakeBackend::new(vec![b"hello"]);
    let written = backend.written();
    let session = Session::spawn_with_backend(opts("s1"), Box::new(backend), fast_limits(), clock.clone(), global_limiter());

    session
        .add_stop_input("please continue".to_string(), StopInputSource::User, true)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    clock.advance(1_000);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let buf = written.lock().unwrap();
    let text = String::from_utf8_lossy(&buf);
    assert!(text.contains("please continue"));
}

#[tokio::test]
async fn set_stop_inputs_enabled_resets_rearm_budget() {
    let clock = Arc::new(FakeClock::new());
    let session = Session::spawn_with_backend(opts("s1"), Box::new(FakeBackend::empty()), Limits::default(), clock, global_limiter());
    session.set_stop_inputs_enabled(false).await.unwrap();
    session.set_stop_inputs_enabled(true).await.unwrap();
}

#[tokio::test]
async fn add_rule_and_list_and_remove() {
    let clock = Arc::new(FakeClock::new());
    let session = Session::spawn_with_backend(opts("s1"), Box::new(FakeBackend::empty()), Limits::default(), clock, global_limiter());

    let rule_id = session
        .add_rule(
            RuleKind::Interval,
            "status".to_string(),
            true,
            true,
            EnterStyle::Cr,
            ActivityPolicy::Immediate,
            None,
            Some(60_000),
            None,
            "alice".to_string(),
        )
        .await
        .unwrap();

    let rules = session.list_rules().await;
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].id, rule_id);

    assert!(session.remove_rule(&rule_id).await.unwrap().is_some());
    assert!(session.list_rules().await.is_empty());
}

#[tokio::test]
async fn interval_rule_exhausting_stop_after_broadcasts_fired_then_removed() {
    let clock = Arc::new(FakeClock::new());
    let session = Session::spawn_with_backend(opts("s1"), Box::new(FakeBackend::empty()), fast_limits(), clock.clone(), global_limiter());
    let mut rx = session.subscribe();

    let rule_id = session
        .add_rule(
            RuleKind::Interval,
            "status".to_string(),
            true,
            true,
            EnterStyle::Cr,
            ActivityPolicy::Immediate,
            None,
            Some(1_000),
            Some(1),
            "alice".to_string(),
        )
        .await
        .unwrap();
    // Drain the `added` broadcast.
    let _ = rx.recv().await.unwrap();

    clock.advance(1_000);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let fired = rx.recv().await.unwrap();
    assert!(matches!(
        fired,
        ServerEvent::ScheduledInputRuleUpdated { action: RuleAction::Fired, .. }
    ));
    let removed = rx.recv().await.unwrap();
    match removed {
        ServerEvent::ScheduledInputRuleUpdated { action: RuleAction::Removed, rule_id: removed_id, .. } => {
            assert_eq!(removed_id, rule_id);
        }
        other => panic!("expected Removed after stop_after exhaustion, got {other:?}"),
    }
    assert!(session.list_rules().await.is_empty());
}

#[tokio::test]
async fn terminate_is_idempotent() {
    let clock = Arc::new(FakeClock::new());
    let session = Session::spawn_with_backend(opts("s1"), Box::new(FakeBackend::empty()), Limits::default(), clock, global_limiter());
    session.terminate().await.unwrap();
    session.terminate().await.unwrap();
    assert!(!session.summary().await.is_active);
}

#[tokio::test]
async fn attach_reports_history_offset_and_detach_clears_client() {
    let clock = Arc::new(FakeClock::new());
    let session = Session::spawn_with_backend(opts("s1"), Box::new(FakeBackend::new(vec![b"hello"])), Limits::default(), clock, global_limiter());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (_, byte_offset, should_load_history, _rx) = session.attach("client-1".to_string()).await;
    assert!(byte_offset > 0);
    assert!(should_load_history);

    session.detach("client-1").await;
}
