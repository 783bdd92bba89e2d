// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Multi-user terminal-session server.
#[derive(Debug, Parser)]
#[command(name = "sessiond", version, about)]
pub struct Config {
    /// HTTP port to listen on.
    #[arg(long, env = "SESSIOND_PORT", default_value = "7420")]
    pub port: u16,

    /// Host address to bind to.
    #[arg(long, env = "SESSIOND_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bearer token required on HTTP/WebSocket requests. If unset, the
    /// server accepts unauthenticated requests (development mode).
    #[arg(long, env = "SESSIOND_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Directory where terminated-session metadata and raw history logs
    /// are persisted.
    #[arg(long, env = "SESSIOND_SESSIONS_DIR", default_value = "./sessions")]
    pub sessions_dir: PathBuf,

    /// Default shell/command used when a session is created without one.
    #[arg(long, env = "SESSIOND_SHELL", default_value = "/bin/bash")]
    pub shell: String,

    /// Log format: json or text.
    #[arg(long, env = "SESSIOND_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "SESSIOND_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(flatten)]
    pub limits: Limits,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("--port must be nonzero");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid --log-format: {other}"),
        }
        self.limits.validate()
    }
}

/// Numeric knobs enumerated in §6 of the design, each independently
/// overridable so operators can tune batching and quota behavior without
/// a rebuild.
#[derive(Debug, Clone, Parser)]
pub struct Limits {
    /// Maximum bytes flushed to a client per fan-out tick.
    #[arg(long, env = "SESSIOND_MAX_FLUSH_BYTES_PER_TICK", default_value = "65536")]
    pub max_flush_bytes_per_tick: usize,

    /// Maximum buffered (undelivered) bytes per session before trimming.
    #[arg(long, env = "SESSIOND_MAX_BACKLOG_BYTES", default_value = "1048576")]
    pub max_backlog_bytes: usize,

    /// Milliseconds of no non-suppressed output before a session is
    /// considered inactive.
    #[arg(long, env = "SESSIOND_ACTIVITY_INACTIVE_AFTER_MS", default_value = "1000")]
    pub activity_inactive_after_ms: u64,

    /// Milliseconds after a resize during which output is not counted
    /// as activity.
    #[arg(long, env = "SESSIOND_ACTIVITY_SUPPRESS_AFTER_RESIZE_MS", default_value = "500")]
    pub activity_suppress_after_resize_ms: u64,

    /// Minimum cumulative burst bytes before a pending active transition
    /// becomes a durable one.
    #[arg(long, env = "SESSIOND_ACTIVITY_MIN_BYTES_FOR_ACTIVE_MARKER", default_value = "1")]
    pub activity_min_bytes_for_active_marker: usize,

    /// Bound on recorded activity transitions retained per session.
    #[arg(long, env = "SESSIOND_MAX_ACTIVITY_TRANSITIONS", default_value = "10000")]
    pub max_activity_transitions: usize,

    /// Bound on render markers retained per session (FIFO eviction).
    #[arg(long, env = "SESSIOND_MAX_RENDER_MARKERS", default_value = "2000")]
    pub max_render_markers: usize,

    /// Default delay (ms) before the second Enter when `delay_ms` is set
    /// on an injection but not explicitly overridden by the caller.
    #[arg(long, env = "SESSIOND_API_STDIN_DEFAULT_DELAY_MS", default_value = "1000")]
    pub api_stdin_default_delay_ms: u64,

    /// Default `simulate_typing` for API-sourced injections.
    #[arg(long, env = "SESSIOND_API_STDIN_DEFAULT_SIMULATE_TYPING", default_value = "false")]
    pub api_stdin_default_simulate_typing: bool,

    /// Default typing delay (ms) between characters.
    #[arg(long, env = "SESSIOND_API_STDIN_DEFAULT_TYPING_DELAY_MS", default_value = "0")]
    pub api_stdin_default_typing_delay_ms: u64,

    /// Whether to send Focus In (`ESC[I`) before API-sourced writes.
    #[arg(long, env = "SESSIOND_API_STDIN_SEND_FOCUS_IN", default_value = "false")]
    pub api_stdin_send_focus_in: bool,

    /// Whether to send Focus Out (`ESC[O`) after API-sourced writes.
    #[arg(long, env = "SESSIOND_API_STDIN_SEND_FOCUS_OUT", default_value = "false")]
    pub api_stdin_send_focus_out: bool,

    /// Per-session cap on API-sourced stdin injections.
    #[arg(long, env = "SESSIOND_API_STDIN_MAX_MESSAGES_PER_SESSION", default_value = "10000")]
    pub api_stdin_max_messages_per_session: u64,

    /// Per-session cap on scheduled-rule-sourced stdin injections.
    #[arg(long, env = "SESSIOND_SCHEDULED_INPUT_MAX_MESSAGES_PER_SESSION", default_value = "10000")]
    pub scheduled_input_max_messages_per_session: u64,

    /// Per-session cap on scheduler rules.
    #[arg(long, env = "SESSIOND_SCHEDULED_INPUT_MAX_RULES_PER_SESSION", default_value = "20")]
    pub scheduled_input_max_rules_per_session: usize,

    /// Per-rule cap on injected data bytes.
    #[arg(long, env = "SESSIOND_SCHEDULED_INPUT_MAX_BYTES_PER_RULE", default_value = "8192")]
    pub scheduled_input_max_bytes_per_rule: usize,

    /// Stop-inputs rearm allowance ceiling.
    #[arg(long, env = "SESSIOND_STOP_INPUTS_REARM_MAX", default_value = "10")]
    pub stop_inputs_rearm_max: u32,

    /// Grace period (ms) after the user's last keystroke during which
    /// stop-inputs injection is suppressed.
    #[arg(long, env = "SESSIOND_STOP_INPUTS_GRACE_MS", default_value = "2000")]
    pub stop_inputs_grace_ms: u64,

    /// Grace period (ms) after session creation during which stop-inputs
    /// injection is suppressed.
    #[arg(long, env = "SESSIOND_STOP_INPUTS_SESSION_START_GRACE_MS", default_value = "15000")]
    pub stop_inputs_session_start_grace_ms: u64,

    /// Global rate-limiter budget (ops/sec) across all sessions.
    #[arg(long, env = "SESSIOND_RATE_LIMIT_GLOBAL_PER_SEC", default_value = "300")]
    pub rate_limit_global_per_sec: u32,

    /// Per-session rate-limiter budget (ops/sec).
    #[arg(long, env = "SESSIOND_RATE_LIMIT_SESSION_PER_SEC", default_value = "100")]
    pub rate_limit_session_per_sec: u32,

    /// Per-user create-rate-limiter budget (ops/sec).
    #[arg(long, env = "SESSIOND_RATE_LIMIT_USER_CREATE_PER_SEC", default_value = "10")]
    pub rate_limit_user_create_per_sec: u32,
}

impl Default for Limits {
    fn default() -> Self {
        // clap's derive gives us defaults through `Parser::parse_from`; for
        // programmatic construction (tests, embedding) parse an empty
        // argv so every `default_value` above applies.
        Limits::parse_from(std::iter::once("limits"))
    }
}

/// Lower bound enforced on rule intervals (§4.G).
pub const MIN_INTERVAL_MS: u64 = 1000;
/// Upper bound enforced on offsets and intervals (§4.G): 7 days.
pub const MAX_RULE_TIMING_MS: u64 = 7 * 24 * 60 * 60 * 1000;
/// Upper bound on `stop_after` (§4.G).
pub const MAX_STOP_AFTER: u64 = 1_000_000;
/// Minimum terminal size (§3).
pub const MIN_COLS: u16 = 40;
pub const MIN_ROWS: u16 = 10;

impl Limits {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.activity_inactive_after_ms < 100 {
            anyhow::bail!("activity-inactive-after-ms floor is 100");
        }
        if self.scheduled_input_max_bytes_per_rule == 0 {
            anyhow::bail!("scheduled-input-max-bytes-per-rule must be nonzero");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
