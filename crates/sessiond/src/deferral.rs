// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session deferred-input FIFO (§4.H). Owned by `Session` alongside
//! the scheduler and fan-out buffer, under the same session lock, so the
//! `(key, content_hash)` dedup check and the drain-on-inactive transition
//! stay atomic with the rest of the session's state.

use std::collections::VecDeque;

use serde::Serialize;

use crate::input::{content_hash, ActivityPolicy, EnterStyle, InjectOptions, InjectSource};

/// Maximum chars kept in the `list()` public preview (§4.H).
const LIST_PREVIEW_MAX: usize = 200;
/// Maximum chars kept in the `register` broadcast preview (§4.H).
const REGISTER_PREVIEW_MAX: usize = 120;

/// A pending deferred input (§3 `DeferredEntry`).
#[derive(Debug, Clone)]
pub struct DeferredEntry {
    pub id: String,
    pub key: String,
    pub source: InjectSource,
    pub data: String,
    pub raw: bool,
    pub submit: bool,
    pub enter_style: EnterStyle,
    pub activity_policy: ActivityPolicy,
    pub by: String,
    pub rule_id: Option<String>,
    pub content_hash: String,
    pub created_at: i64,
}

/// Public, truncated view of a `DeferredEntry` (never exposes full `data`).
#[derive(Debug, Clone, Serialize)]
pub struct DeferredEntryView {
    pub id: String,
    pub key: String,
    pub source: String,
    pub created_at: i64,
    pub bytes: usize,
    pub data_preview: String,
    pub activity_policy: String,
}

impl DeferredEntry {
    fn preview(&self, max: usize) -> String {
        truncate_chars(&self.data, max)
    }

    fn list_view(&self) -> DeferredEntryView {
        DeferredEntryView {
            id: self.id.clone(),
            key: self.key.clone(),
            source: self.source.as_str().to_string(),
            created_at: self.created_at,
            bytes: self.data.len(),
            data_preview: self.preview(LIST_PREVIEW_MAX),
            activity_policy: self.activity_policy.as_str().to_string(),
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// Specification for a new deferred entry, as supplied by the caller of
/// `register` (scheduler fire-with-defer-policy, or a `defer`-policy API
/// injection).
#[derive(Debug, Clone)]
pub struct DeferSpec {
    pub key: String,
    pub source: InjectSource,
    pub data: String,
    pub raw: bool,
    pub submit: bool,
    pub enter_style: EnterStyle,
    pub activity_policy: ActivityPolicy,
    pub by: String,
    pub rule_id: Option<String>,
}

/// Outcome of `register`.
pub enum RegisterOutcome {
    Added(DeferredEntryView),
    Duplicate,
}

/// Per-session FIFO of deferred inputs (§4.H). Drains in `created_at`
/// order, which is also insertion order since entries are only ever
/// appended.
#[derive(Debug, Default)]
pub struct DeferralQueue {
    entries: VecDeque<DeferredEntry>,
    next_id: u64,
}

impl DeferralQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Register a new deferred entry, rejecting duplicates that share the
    /// same `(key, content_hash)` (§3 invariant).
    pub fn register(&mut self, spec: DeferSpecInternal) -> RegisterOutcome {
        let hash = content_hash(&spec.data, spec.submit, spec.raw, spec.enter_style);
        if self
            .entries
            .iter()
            .any(|e| e.key == spec.key && e.content_hash == hash)
        {
            return RegisterOutcome::Duplicate;
        }

        let id = format!("def-{}", self.next_id);
        self.next_id += 1;

        let entry = DeferredEntry {
            id,
            key: spec.key,
            source: spec.source,
            data: spec.data,
            raw: spec.raw,
            submit: spec.submit,
            enter_style: spec.enter_style,
            activity_policy: spec.activity_policy,
            by: spec.by,
            rule_id: spec.rule_id,
            content_hash: hash,
            created_at: spec.created_at,
        };
        let mut view = entry.list_view();
        view.data_preview = entry.preview(REGISTER_PREVIEW_MAX);
        self.entries.push_back(entry);
        RegisterOutcome::Added(view)
    }

    pub fn list(&self) -> Vec<DeferredEntryView> {
        self.entries.iter().map(DeferredEntry::list_view).collect()
    }

    pub fn delete(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drain the whole queue, concatenating `data` with `\n` and building
    /// one `InjectOptions` using the *first* entry's options (§4.H.1).
    /// Returns `None` if the queue was empty.
    pub fn drain(&mut self) -> Option<InjectOptions> {
        let first = self.entries.front()?.clone();
        let joined = self
            .entries
            .iter()
            .map(|e| e.data.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.entries.clear();

        Some(InjectOptions {
            data: joined,
            raw: first.raw,
            submit: first.submit,
            enter_style: first.enter_style,
            delay_ms: None,
            simulate_typing: false,
            typing_delay_ms: 0,
            notify: true,
            activity_policy: ActivityPolicy::Immediate,
            by: first.by,
            source: first.source,
            rule_id: first.rule_id,
        })
    }
}

/// Internal spec carrying a resolved `created_at`, since `DeferSpec` is the
/// caller-facing shape and the clock belongs to `Session`.
pub struct DeferSpecInternal {
    pub key: String,
    pub source: InjectSource,
    pub data: String,
    pub raw: bool,
    pub submit: bool,
    pub enter_style: EnterStyle,
    pub activity_policy: ActivityPolicy,
    pub by: String,
    pub rule_id: Option<String>,
    pub created_at: i64,
}

impl DeferSpecInternal {
    pub fn from_spec(spec: DeferSpec, created_at: i64) -> Self {
        Self {
            key: spec.key,
            source: spec.source,
            data: spec.data,
            raw: spec.raw,
            submit: spec.submit,
            enter_style: spec.enter_style,
            activity_policy: spec.activity_policy,
            by: spec.by,
            rule_id: spec.rule_id,
            created_at,
        }
    }
}

#[cfg(test)]
#[path = "deferral_tests.rs"]
mod tests;
