// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn fake_clock_holds_until_advanced() {
    let clock = FakeClock::new();
    let t0 = clock.now_ms();
    assert_eq!(clock.now_ms(), t0);
    clock.advance(500);
    assert_eq!(clock.now_ms(), t0 + 500);
}

#[test]
fn limiter_allows_up_to_limit_per_window() {
    let limiter = FixedWindowLimiter::new(3);
    assert!(limiter.allow(1000));
    assert!(limiter.allow(1100));
    assert!(limiter.allow(1900));
    assert!(!limiter.allow(1950));
}

#[test]
fn limiter_resets_on_next_window() {
    let limiter = FixedWindowLimiter::new(1);
    assert!(limiter.allow(1000));
    assert!(!limiter.allow(1500));
    assert!(limiter.allow(2000));
}

#[test]
fn per_user_create_limiter_tracks_independently() {
    let limiters = RateLimiters::new(300, 2);
    assert!(limiters.allow_create("alice", 1000));
    assert!(limiters.allow_create("alice", 1100));
    assert!(!limiters.allow_create("alice", 1200));
    assert!(limiters.allow_create("bob", 1200));
}
