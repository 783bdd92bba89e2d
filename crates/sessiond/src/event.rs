// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};

use crate::scheduler::RuleAction;

/// Server-to-client broadcast messages (§6). Every attached WebSocket
/// connection receives these as they happen; the transport layer is
/// responsible for serializing them (JSON today, see `transport::ws`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Attached {
        session_id: String,
        history_marker: u64,
        history_byte_offset: u64,
        should_load_history: bool,
    },
    Detached {
        session_id: String,
    },
    Stdout {
        session_id: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_queue: Option<bool>,
    },
    StdoutDropped {
        session_id: String,
        dropped_bytes: u64,
        backlog_bytes: u64,
    },
    StdinInjected {
        session_id: String,
        by: String,
        bytes: u64,
        submit: bool,
        enter_style: String,
        raw: bool,
        notify: bool,
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        activity_policy: Option<String>,
    },
    SessionActivity {
        session_id: String,
        activity_state: ActivityState,
        last_output_at: Option<i64>,
    },
    SessionUpdated {
        update_type: String,
        session_data: serde_json::Value,
    },
    ScheduledInputRuleUpdated {
        action: RuleAction,
        session_id: String,
        rule_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_run_at: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        paused: Option<bool>,
    },
    DeferredInputUpdated {
        session_id: String,
        action: String,
        count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pending: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pending_id: Option<String>,
    },
    Pong {
        timestamp: i64,
    },
}

/// Client-to-server messages accepted over the same WebSocket (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Attach {
        session_id: String,
    },
    Detach {
        session_id: String,
    },
    DetachClient {
        session_id: String,
        target_client_id: String,
    },
    Stdin {
        session_id: String,
        data: String,
    },
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    HistoryLoaded {
        session_id: String,
    },
    Ping {
        timestamp: i64,
    },
}

/// Whether a session is producing fresh, non-suppressed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Active,
    Inactive,
}
