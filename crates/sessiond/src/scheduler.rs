// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session offset/interval rule engine (§4.G).
//!
//! Rather than arming one OS/tokio timer per rule, rules carry an explicit
//! `next_run_at` and a session-level tick (driven by the supervisor's
//! event loop) calls `due_rules` / `fire` each pass. This keeps "at most
//! one timer per rule" trivially true (there is only ever one `next_run_at`
//! per rule) while matching the single-logical-event-loop model of §5.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::Limits;
use crate::error::CoreError;
use crate::input::{ActivityPolicy, EnterStyle, InjectOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Offset,
    Interval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Added,
    Updated,
    Removed,
    Fired,
    Cleared,
}

/// A scheduled rule (§3 `Rule`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub kind: RuleKind,
    pub data: String,
    pub raw: bool,
    pub submit: bool,
    pub enter_style: EnterStyle,
    pub activity_policy: ActivityPolicy,
    pub offset_ms: Option<u64>,
    pub interval_ms: Option<u64>,
    pub stop_after: Option<u64>,
    pub base_time_ms: i64,
    pub next_run_at: Option<i64>,
    pub times_fired: u64,
    pub paused: bool,
    pub created_by: String,
    pub created_at: i64,
}

/// A patch applied via `update_rule` (§4.G rule mutation).
#[derive(Debug, Default, Clone)]
pub struct RulePatch {
    pub paused: Option<bool>,
    pub offset_ms: Option<u64>,
    pub interval_ms: Option<u64>,
    pub data: Option<String>,
    pub activity_policy: Option<ActivityPolicy>,
    pub enter_style: Option<EnterStyle>,
}

/// Outcome of a rule firing, handed back to the caller (supervisor) to
/// actually perform the injection or hand off to the deferral manager.
pub enum FireOutcome {
    /// `removed` is true when this fire exhausted an interval rule's
    /// `stop_after` cap, so the caller must broadcast both `Fired` and
    /// `Removed` (§4.G step 4).
    Inject { opts: InjectOptions, removed: bool },
    /// Carries the rule's own data rather than just its id: an offset rule
    /// firing with `defer` policy is removed from the map in this same
    /// `fire()` call (one-shot, §4.G step 5), so the caller cannot look the
    /// rule back up afterward to build the deferred entry.
    Defer {
        key: String,
        data: String,
        raw: bool,
        submit: bool,
        enter_style: EnterStyle,
        created_by: String,
        rule_id: String,
        removed: bool,
    },
    /// Suppressed this tick. `removed` is true when the rule is gone for
    /// good (offset rules never get a second chance); false when an
    /// interval rule was merely skipped and already has a fresh
    /// `next_run_at` scheduled.
    Dropped { removed: bool },
}

/// Which way a rule wants to act this tick, before `stop_after` exhaustion
/// is folded in to produce the public `FireOutcome`.
enum FireKind {
    Inject(InjectOptions),
    Defer {
        key: String,
        data: String,
        raw: bool,
        submit: bool,
        enter_style: EnterStyle,
        created_by: String,
        rule_id: String,
    },
}

/// Per-session scheduler: a map of rule id -> rule.
#[derive(Default)]
pub struct Scheduler {
    rules: HashMap<String, Rule>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn list(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    pub fn get(&self, rule_id: &str) -> Option<&Rule> {
        self.rules.get(rule_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_rule(
        &mut self,
        limits: &Limits,
        id: String,
        kind: RuleKind,
        data: String,
        raw: bool,
        submit: bool,
        enter_style: EnterStyle,
        activity_policy: ActivityPolicy,
        offset_ms: Option<u64>,
        interval_ms: Option<u64>,
        stop_after: Option<u64>,
        created_by: String,
        now: i64,
    ) -> Result<(), CoreError> {
        if self.rules.len() >= limits.scheduled_input_max_rules_per_session {
            return Err(CoreError::limit_exceeded(
                "per-session rule limit reached",
                crate::error::LimitScope::Session,
            ));
        }
        if data.len() > limits.scheduled_input_max_bytes_per_rule {
            return Err(CoreError::bad_request("rule data exceeds per-rule byte limit"));
        }

        let next_run_at = match kind {
            RuleKind::Offset => {
                let offset = offset_ms.ok_or_else(|| CoreError::bad_request("offset_ms required"))?;
                validate_timing(offset)?;
                now + offset as i64
            }
            RuleKind::Interval => {
                let interval = interval_ms.ok_or_else(|| CoreError::bad_request("interval_ms required"))?;
                if interval < crate::config::MIN_INTERVAL_MS {
                    return Err(CoreError::bad_request("interval_ms below minimum"));
                }
                validate_timing(interval)?;
                now + interval as i64
            }
        };
        if let Some(stop_after) = stop_after {
            if stop_after == 0 || stop_after > crate::config::MAX_STOP_AFTER {
                return Err(CoreError::bad_request("stop_after out of range"));
            }
        }

        self.rules.insert(
            id.clone(),
            Rule {
                id,
                kind,
                data,
                raw,
                submit,
                enter_style,
                activity_policy,
                offset_ms,
                interval_ms,
                stop_after,
                base_time_ms: now,
                next_run_at: Some(next_run_at),
                times_fired: 0,
                paused: false,
                created_by,
                created_at: now,
            },
        );
        Ok(())
    }

    pub fn remove_rule(&mut self, rule_id: &str) -> Option<Rule> {
        self.rules.remove(rule_id)
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    /// Apply a patch (§4.G). `now` is used to recompute `next_run_at`.
    pub fn update_rule(&mut self, rule_id: &str, patch: RulePatch, now: i64) -> Result<(), CoreError> {
        let rule = self
            .rules
            .get_mut(rule_id)
            .ok_or_else(|| CoreError::not_found("rule not found"))?;

        if let Some(data) = patch.data {
            rule.data = data;
        }
        if let Some(policy) = patch.activity_policy {
            rule.activity_policy = policy;
        }
        if let Some(style) = patch.enter_style {
            rule.enter_style = style;
        }

        let mut rebased = false;
        if let Some(offset_ms) = patch.offset_ms {
            rule.offset_ms = Some(offset_ms);
            rebased = true;
        }
        if let Some(interval_ms) = patch.interval_ms {
            rule.interval_ms = Some(interval_ms);
            rebased = true;
        }
        if rebased {
            rule.base_time_ms = now;
            let duration = match rule.kind {
                RuleKind::Offset => rule.offset_ms.unwrap_or(0),
                RuleKind::Interval => rule.interval_ms.unwrap_or(crate::config::MIN_INTERVAL_MS),
            };
            rule.next_run_at = Some(now + duration as i64);
        }

        if let Some(paused) = patch.paused {
            if paused {
                rule.paused = true;
                rule.next_run_at = None;
            } else if rule.paused || rule.next_run_at.is_none() {
                rule.paused = false;
                rule.next_run_at = Some(match rule.kind {
                    RuleKind::Offset => (rule.base_time_ms + rule.offset_ms.unwrap_or(0) as i64).max(now),
                    RuleKind::Interval => next_aligned_tick(rule.base_time_ms, rule.interval_ms.unwrap_or(crate::config::MIN_INTERVAL_MS), now),
                });
            }
        }

        Ok(())
    }

    /// Rule ids whose `next_run_at` is due.
    pub fn due_rules(&self, now: i64) -> Vec<String> {
        self.rules
            .values()
            .filter(|r| !r.paused)
            .filter(|r| r.next_run_at.is_some_and(|t| t <= now))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Fire a rule: clears its timer, decides the fire outcome based on
    /// `activity_policy` and current activity, reschedules interval rules,
    /// and removes one-shot/offset and exhausted-interval rules.
    ///
    /// Returns `None` if the rule no longer exists (already removed).
    pub fn fire(&mut self, rule_id: &str, now: i64, session_active: bool) -> Option<FireOutcome> {
        let rule = self.rules.get_mut(rule_id)?;
        rule.next_run_at = None;

        let outcome = if rule.activity_policy == ActivityPolicy::Suppress && session_active {
            match rule.kind {
                RuleKind::Interval => {
                    rule.next_run_at = Some(next_aligned_tick(
                        rule.base_time_ms,
                        rule.interval_ms.unwrap_or(crate::config::MIN_INTERVAL_MS),
                        now,
                    ));
                    return Some(FireOutcome::Dropped { removed: false });
                }
                RuleKind::Offset => {
                    self.rules.remove(rule_id);
                    return Some(FireOutcome::Dropped { removed: true });
                }
            }
        } else if rule.activity_policy == ActivityPolicy::Defer && session_active {
            FireKind::Defer {
                key: format!("rule:{rule_id}"),
                data: rule.data.clone(),
                raw: rule.raw,
                submit: rule.submit,
                enter_style: rule.enter_style,
                created_by: rule.created_by.clone(),
                rule_id: rule.id.clone(),
            }
        } else {
            FireKind::Inject(InjectOptions {
                data: rule.data.clone(),
                raw: rule.raw,
                submit: rule.submit,
                enter_style: rule.enter_style,
                delay_ms: None,
                simulate_typing: false,
                typing_delay_ms: 0,
                notify: true,
                activity_policy: ActivityPolicy::Immediate,
                by: rule.created_by.clone(),
                source: crate::input::InjectSource::Scheduled,
                rule_id: Some(rule.id.clone()),
            })
        };

        let rule = self.rules.get_mut(rule_id)?;
        let removed = match rule.kind {
            RuleKind::Interval => {
                rule.times_fired += 1;
                let exhausted = rule.stop_after.is_some_and(|cap| rule.times_fired >= cap);
                if exhausted {
                    self.rules.remove(rule_id);
                } else {
                    rule.next_run_at = Some(next_aligned_tick(
                        rule.base_time_ms,
                        rule.interval_ms.unwrap_or(crate::config::MIN_INTERVAL_MS),
                        now,
                    ));
                }
                exhausted
            }
            RuleKind::Offset => {
                self.rules.remove(rule_id);
                true
            }
        };

        Some(match outcome {
            FireKind::Inject(opts) => FireOutcome::Inject { opts, removed },
            FireKind::Defer { key, data, raw, submit, enter_style, created_by, rule_id } => {
                FireOutcome::Defer { key, data, raw, submit, enter_style, created_by, rule_id, removed }
            }
        })
    }
}

fn validate_timing(ms: u64) -> Result<(), CoreError> {
    if ms > crate::config::MAX_RULE_TIMING_MS {
        Err(CoreError::bad_request("rule timing exceeds 7-day maximum"))
    } else {
        Ok(())
    }
}

/// `next_run_at = base + k*interval` with `k = floor((now-base)/interval)+1`,
/// advancing `k` once more if the result is not strictly greater than now.
fn next_aligned_tick(base_time_ms: i64, interval_ms: u64, now: i64) -> i64 {
    let interval = interval_ms as i64;
    let elapsed = (now - base_time_ms).max(0);
    let mut k = elapsed / interval + 1;
    let mut next = base_time_ms + k * interval;
    if next <= now {
        k += 1;
        next = base_time_ms + k * interval;
    }
    next
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
