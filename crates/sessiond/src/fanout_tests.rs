// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn broadcast_under_cap_does_not_drop() {
    let mut f = Fanout::new(1024);
    assert!(f.broadcast("hello").is_none());
    assert!(!f.is_empty());
}

#[test]
fn broadcast_over_cap_trims_from_head() {
    let mut f = Fanout::new(10);
    assert!(f.broadcast("0123456789").is_none());
    let dropped = f.broadcast("abc").expect("should drop");
    assert_eq!(dropped.dropped_bytes, 3);
    assert_eq!(dropped.backlog_bytes, 10);
}

#[test]
fn take_flush_payload_splits_on_utf8_boundary() {
    let mut f = Fanout::new(1 << 20);
    let mut s = "a".repeat(65530);
    s.push('🙂'); // 4-byte emoji straddling the 64 KiB cap
    s.push_str("tail");
    f.broadcast(&s);

    let first = f.take_flush_payload(65536).expect("first payload");
    assert!(first.len() <= 65536);
    assert!(std::str::from_utf8(first.as_bytes()).is_ok());
    assert!(f.backlog_remaining());

    let second = f.take_flush_payload(65536).expect("second payload");
    assert!(std::str::from_utf8(second.as_bytes()).is_ok());
    assert_eq!(first.len() + second.len(), s.len());
    assert!(!f.backlog_remaining());
}

#[test]
fn history_sync_queues_until_loaded() {
    let mut f = Fanout::new(1024);
    f.attach_client("c1".into(), 10, 1000);
    assert!(f.has_attached_clients());

    let (sent, queued) = f.route_payload("data", 11);
    assert!(sent.is_empty());
    assert_eq!(queued, vec!["c1".to_string()]);

    let drained = f.history_loaded("c1");
    assert_eq!(drained, vec!["data".to_string()]);

    let (sent2, queued2) = f.route_payload("more", 12);
    assert_eq!(sent2, vec!["c1".to_string()]);
    assert!(queued2.is_empty());
}

#[test]
fn client_below_marker_is_not_queued() {
    let mut f = Fanout::new(1024);
    f.attach_client("c1".into(), 10, 1000);
    let (sent, queued) = f.route_payload("data", 9);
    assert_eq!(sent, vec!["c1".to_string()]);
    assert!(queued.is_empty());
}

#[test]
fn detach_removes_client() {
    let mut f = Fanout::new(1024);
    f.attach_client("c1".into(), 0, 0);
    f.detach_client("c1");
    assert!(!f.has_attached_clients());
}

#[test]
fn should_schedule_flush_requires_attached_client_and_pending_data() {
    let mut f = Fanout::new(1024);
    assert!(!f.should_schedule_flush());
    f.broadcast("data");
    assert!(!f.should_schedule_flush());
    f.attach_client("c1".into(), 0, 0);
    assert!(f.should_schedule_flush());
}
