// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared types for the unified input-injection path (§4.F). The actual
//! write sequence lives on `Session::inject` (it needs PTY access and
//! `.await` sleeps); this module holds the option/outcome shapes used by
//! every call site (scheduler fire, deferred drain, stop-inputs, the HTTP
//! API, and interactive stdin).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How a newline is sent after injected data (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnterStyle {
    Cr,
    Lf,
    CrLf,
}

impl Default for EnterStyle {
    fn default() -> Self {
        Self::Cr
    }
}

impl EnterStyle {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Cr => b"\r",
            Self::Lf => b"\n",
            Self::CrLf => b"\r\n",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cr => "cr",
            Self::Lf => "lf",
            Self::CrLf => "crlf",
        }
    }

    /// Normalize a free-form string the way `update_rule` option patches do
    /// (§4.G: "normalize `enter_style` (lowercase)").
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cr" => Some(Self::Cr),
            "lf" => Some(Self::Lf),
            "crlf" => Some(Self::CrLf),
            _ => None,
        }
    }
}

/// Whether an injection writes immediately, is silently dropped, or is
/// deferred until the session goes inactive (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityPolicy {
    Immediate,
    Suppress,
    Defer,
}

impl Default for ActivityPolicy {
    fn default() -> Self {
        Self::Immediate
    }
}

impl ActivityPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Suppress => "suppress",
            Self::Defer => "defer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "immediate" => Some(Self::Immediate),
            "suppress" => Some(Self::Suppress),
            "defer" => Some(Self::Defer),
            _ => None,
        }
    }
}

/// Who originated an injection (§4.F `source`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InjectSource {
    Api,
    Scheduled,
    StopInputs,
    User,
    Server,
}

impl InjectSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Scheduled => "scheduled",
            Self::StopInputs => "stop-inputs",
            Self::User => "user",
            Self::Server => "server",
        }
    }

    /// User-originated sources update `last_user_input_at` (§4.F step 6);
    /// `server`, `stop-inputs`, and `scheduled` do not.
    pub fn is_user_originated(&self) -> bool {
        matches!(self, Self::User | Self::Api)
    }
}

/// Full option set for one call to `Session::inject` (§4.F).
#[derive(Debug, Clone)]
pub struct InjectOptions {
    pub data: String,
    pub raw: bool,
    pub submit: bool,
    pub enter_style: EnterStyle,
    pub delay_ms: Option<u64>,
    pub simulate_typing: bool,
    pub typing_delay_ms: u64,
    pub notify: bool,
    pub activity_policy: ActivityPolicy,
    pub by: String,
    pub source: InjectSource,
    pub rule_id: Option<String>,
}

impl Default for InjectOptions {
    fn default() -> Self {
        Self {
            data: String::new(),
            raw: false,
            submit: true,
            enter_style: EnterStyle::default(),
            delay_ms: None,
            simulate_typing: false,
            typing_delay_ms: 0,
            notify: true,
            activity_policy: ActivityPolicy::default(),
            by: String::new(),
            source: InjectSource::User,
            rule_id: None,
        }
    }
}

/// Outcome of a call to `Session::inject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectOutcome {
    Written { bytes: u64 },
    Suppressed { reason: &'static str },
    Deferred,
}

/// SHA-256 over `data` plus the normalized submit/raw/enter_style triple,
/// used by the Deferral Manager's `(key, content_hash)` dedup (§3
/// `DeferredEntry`).
pub fn content_hash(data: &str, submit: bool, raw: bool, enter_style: EnterStyle) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hasher.update([b'|']);
    hasher.update([submit as u8, raw as u8]);
    hasher.update([b'|']);
    hasher.update(enter_style.as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
#[path = "input_tests.rs"]
mod tests;
