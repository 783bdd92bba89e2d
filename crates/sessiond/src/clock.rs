// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic and wall-clock time source, abstracted so tests can control it
/// without a time-mocking dependency (the teacher has none).
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since an arbitrary but fixed epoch, monotonic.
    fn now_ms(&self) -> i64;
}

/// Real clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Deterministic clock for tests: starts at a fixed instant and only
/// advances when told to.
#[derive(Debug)]
pub struct FakeClock {
    start: Instant,
    offset_ms: Mutex<i64>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset_ms: Mutex::new(0),
        }
    }

    pub fn advance(&self, ms: i64) {
        let mut offset = self.offset_ms.lock().unwrap_or_else(|e| e.into_inner());
        *offset += ms;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> i64 {
        let _ = self.start;
        *self.offset_ms.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed-window rate limiter: allows up to `limit` calls within each
/// wall-clock-second-aligned window, then resets.
pub struct FixedWindowLimiter {
    limit: u32,
    window_start_ms: Mutex<i64>,
    count: Mutex<u32>,
}

impl FixedWindowLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            window_start_ms: Mutex::new(0),
            count: Mutex::new(0),
        }
    }

    /// Returns true if another operation is allowed in the current window.
    pub fn allow(&self, now_ms: i64) -> bool {
        let window = now_ms / 1000;
        let mut window_start = self.window_start_ms.lock().unwrap_or_else(|e| e.into_inner());
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());

        if *window_start != window {
            *window_start = window;
            *count = 0;
        }

        if *count >= self.limit {
            false
        } else {
            *count += 1;
            true
        }
    }
}

/// Global and per-user rate-limiter scopes (§4.A). The per-session scope
/// lives on the session itself (`supervisor::Session::rate_limiter`) since
/// every session operation already holds that session's lock. `global` is
/// `Arc`-wrapped so it can be handed to every `Session` as well, since §4.A
/// requires resize/terminate/scheduler operations to consult the same
/// process-wide budget that gates session creation.
pub struct RateLimiters {
    pub global: Arc<FixedWindowLimiter>,
    per_user_create_limit: u32,
    pub user_create: Mutex<HashMap<String, FixedWindowLimiter>>,
}

impl RateLimiters {
    pub fn new(global_per_sec: u32, user_create_per_sec: u32) -> Self {
        Self {
            global: Arc::new(FixedWindowLimiter::new(global_per_sec)),
            per_user_create_limit: user_create_per_sec,
            user_create: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow_create(&self, user: &str, now_ms: i64) -> bool {
        let mut map = self.user_create.lock().unwrap_or_else(|e| e.into_inner());
        let limiter = map
            .entry(user.to_string())
            .or_insert_with(|| FixedWindowLimiter::new(self.per_user_create_limit));
        limiter.allow(now_ms)
    }
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
