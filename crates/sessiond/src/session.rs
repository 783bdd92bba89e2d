// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Supervisor (§4.D): owns one PTY, its history buffer, activity
//! state machine, fan-out buffer, scheduler, and deferral queue. Every
//! mutation to a session's internal state happens under `Session::inner`,
//! a `tokio::sync::Mutex` held across the `.await` points of `inject`
//! (typing simulation, Enter delays) so writes from different sources
//! never interleave mid-sequence, mirroring the single-writer-per-session
//! model of §5.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::classifier;
use crate::clock::{Clock, FixedWindowLimiter};
use crate::config::{Limits, MIN_COLS, MIN_ROWS};
use crate::deferral::{DeferSpec, DeferSpecInternal, DeferralQueue, DeferredEntryView, RegisterOutcome};
use crate::error::{CoreError, LimitScope};
use crate::event::{ActivityState, ServerEvent};
use crate::fanout::Fanout;
use crate::history::{History, InputMarker, MarkerKind, RenderMarker};
use crate::input::{ActivityPolicy, EnterStyle, InjectOptions, InjectOutcome, InjectSource};
use crate::osc;
use crate::pty::{Backend, ExitStatus, NativePty, SpawnOptions};
use crate::scheduler::{FireOutcome, Rule, RuleAction, RuleKind, RulePatch, Scheduler};

/// Session visibility (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Public,
    SharedReadonly,
}

/// Where a stop-input prompt came from (§3 `stop_inputs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopInputSource {
    Template,
    User,
}

/// One stop-input prompt.
#[derive(Debug, Clone, Serialize)]
pub struct StopInput {
    pub id: String,
    pub prompt: String,
    pub armed: bool,
    pub source: StopInputSource,
}

/// Everything needed to spawn a session (§4.D `create`).
pub struct CreateOptions {
    pub id: String,
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    pub visibility: Visibility,
    pub alias: Option<String>,
    pub owner: Option<String>,
    pub interactive: bool,
    pub created_by: String,
    /// Where to append the raw `<id>.log` history file. `None` disables
    /// disk persistence (used by tests).
    pub sessions_dir: Option<PathBuf>,
}

/// A recorded activity burst crossing `activity_min_bytes_for_active_marker`
/// (§4.D step 4), bounded by `max_activity_transitions` (FIFO eviction).
#[derive(Debug, Clone, Copy)]
pub struct ActivityTransition {
    pub offset: usize,
    pub seq: u64,
    pub t: i64,
}

struct PendingActiveTransition {
    offset: usize,
    seq: u64,
    bytes: usize,
}

/// Mutable session state, held under `Session::inner`.
struct SessionInner {
    is_active: bool,
    interactive: bool,
    exit_code: Option<i32>,
    ended_at: Option<i64>,
    last_output_at: Option<i64>,
    last_resize_at: i64,
    last_user_input_at: i64,
    cols: u16,
    rows: u16,
    visibility: Visibility,
    title: Option<String>,
    activity_state: ActivityState,
    pending_active_transition: Option<PendingActiveTransition>,
    activity_transitions: VecDeque<ActivityTransition>,
    classifier_carry: Vec<u8>,
    osc_carry: Vec<u8>,
    connected_clients: HashSet<String>,
    stop_inputs: Vec<StopInput>,
    stop_inputs_enabled: bool,
    stop_inputs_rearm_remaining: u32,
    api_stdin_count: u64,
    scheduled_input_count: u64,
    history: History,
    fanout: Fanout,
    scheduler: Scheduler,
    deferral: DeferralQueue,
    terminating: bool,
    /// Per-client event channels, keyed by client id. `Stdout` payloads are
    /// routed here directly rather than through the shared broadcast
    /// channel so a client mid-history-sync never sees live output
    /// duplicated against its queued backlog (§8 invariant: no gaps, no
    /// duplicates).
    client_txs: HashMap<String, mpsc::UnboundedSender<ServerEvent>>,
}

/// A live terminal session. Cheaply cloned via `Arc`; the registry is the
/// sole long-term owner (§4.I), other components hold only the id.
pub struct Session {
    pub id: String,
    pub alias: Mutex<Option<String>>,
    pub owner: Option<String>,
    pub created_at: i64,
    pub created_by: String,
    /// `command.join(" ")`, truncated, kept for terminated-session metadata
    /// (§6 "Persisted metadata") since the PTY spawn itself only needs the
    /// command once.
    pub command_preview: String,
    pub cwd: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    limits: Limits,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<ServerEvent>,
    input_tx: mpsc::Sender<Bytes>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    /// Child process group leader, if the backend forked a real process.
    /// `terminate` signals it directly rather than waiting on `Backend`'s
    /// `Drop` impl, which only runs once the PTY has already closed.
    child_pid: Option<Pid>,
    rule_seq: AtomicU64,
    stop_input_seq: AtomicU64,
    /// Gates resize/terminate/scheduler mutations (§4.A, §6). Stdin
    /// injection is intentionally exempt.
    session_limiter: FixedWindowLimiter,
    /// Process-wide 300/s budget (§4.A), shared with `Registry::create` and
    /// every other live session. Checked alongside `session_limiter` so
    /// resize/terminate/scheduler ops are gated by both scopes.
    global_limiter: Arc<FixedWindowLimiter>,
    log_path: Option<PathBuf>,
}

/// Public, serializable snapshot of a session (§6 `session_data`).
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub alias: Option<String>,
    pub is_active: bool,
    pub interactive: bool,
    pub visibility: Visibility,
    pub title: Option<String>,
    pub created_at: i64,
    pub last_output_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub cols: u16,
    pub rows: u16,
    pub activity_state: ActivityState,
}

impl Session {
    /// Spawn a real PTY-backed session (§4.D `create`).
    pub fn create(
        opts: CreateOptions,
        limits: Limits,
        clock: Arc<dyn Clock>,
        global_limiter: Arc<FixedWindowLimiter>,
    ) -> Result<Arc<Session>, CoreError> {
        if opts.cols < MIN_COLS || opts.rows < MIN_ROWS {
            return Err(CoreError::bad_request("terminal size below minimum (40x10)"));
        }

        let backend = NativePty::spawn(SpawnOptions {
            command: opts.command.clone(),
            cols: opts.cols,
            rows: opts.rows,
            cwd: opts.cwd.clone(),
            env: opts.env.clone(),
        })
        .map_err(|e| CoreError::fatal(format!("failed to spawn session: {e}")))?;

        Ok(Self::spawn_with_backend(opts, Box::new(backend), limits, clock, global_limiter))
    }

    /// Spawn a session driven by an arbitrary `Backend` (tests substitute a
    /// fake one that echoes scripted bytes without forking a real process).
    pub fn spawn_with_backend(
        opts: CreateOptions,
        mut backend: Box<dyn Backend>,
        limits: Limits,
        clock: Arc<dyn Clock>,
        global_limiter: Arc<FixedWindowLimiter>,
    ) -> Arc<Session> {
        let now = clock.now_ms();
        let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(256);
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(256);
        let (resize_tx, resize_rx) = mpsc::channel::<(u16, u16)>(8);
        let (events, _) = broadcast::channel(1024);

        let inner = SessionInner {
            is_active: true,
            interactive: opts.interactive,
            exit_code: None,
            ended_at: None,
            last_output_at: None,
            last_resize_at: 0,
            last_user_input_at: 0,
            cols: opts.cols,
            rows: opts.rows,
            visibility: opts.visibility,
            title: None,
            activity_state: ActivityState::Active,
            pending_active_transition: None,
            activity_transitions: VecDeque::new(),
            classifier_carry: Vec::new(),
            osc_carry: Vec::new(),
            connected_clients: HashSet::new(),
            stop_inputs: Vec::new(),
            stop_inputs_enabled: true,
            stop_inputs_rearm_remaining: limits.stop_inputs_rearm_max,
            api_stdin_count: 0,
            scheduled_input_count: 0,
            history: History::new(limits.max_render_markers),
            fanout: Fanout::new(limits.max_backlog_bytes),
            scheduler: Scheduler::new(),
            deferral: DeferralQueue::new(),
            terminating: false,
            client_txs: HashMap::new(),
        };

        let log_path = opts.sessions_dir.map(|dir| dir.join(format!("{}.log", opts.id)));
        let session_limiter = FixedWindowLimiter::new(limits.rate_limit_session_per_sec);
        let command_preview = truncate_chars(&opts.command.join(" "), 200);
        let child_pid = backend.child_pid().map(|pid| Pid::from_raw(pid as i32));

        let session = Arc::new(Session {
            id: opts.id,
            alias: Mutex::new(opts.alias),
            owner: opts.owner,
            created_at: now,
            created_by: opts.created_by,
            command_preview,
            cwd: opts.cwd,
            clock,
            limits,
            inner: Mutex::new(inner),
            events,
            input_tx,
            resize_tx,
            child_pid,
            rule_seq: AtomicU64::new(0),
            stop_input_seq: AtomicU64::new(0),
            session_limiter,
            global_limiter,
            log_path,
        });

        // Backend-driving task: forwards output, consumes input/resize,
        // and reports exit back to the supervisor's pump.
        let backend_done = {
            let session = session.clone();
            tokio::spawn(async move {
                let result = backend.run(output_tx, input_rx, resize_rx).await;
                session.on_exit(result).await;
            })
        };
        std::mem::drop(backend_done);

        // Output pump: every chunk from the backend runs the on-chunk
        // algorithm (§4.D). When the channel closes the backend task has
        // already recorded the exit status via `on_exit`.
        {
            let session = session.clone();
            tokio::spawn(async move {
                while let Some(chunk) = output_rx.recv().await {
                    session.on_output_chunk(chunk).await;
                }
            });
        }

        // Session tick: drives the scheduler, the inactivity timeout, and
        // fan-out re-flushes from one place rather than arming one OS timer
        // per rule (§5: drift up to one quantum is acceptable since
        // rescheduling is always computed from `base_time_ms`).
        {
            let session = session.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(50));
                loop {
                    interval.tick().await;
                    if session.tick().await {
                        break;
                    }
                }
            });
        }

        session
    }

    fn broadcast_event(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn check_rate_limit(&self, now: i64) -> Result<(), CoreError> {
        if !self.global_limiter.allow(now) {
            return Err(CoreError::limit_exceeded(
                "global operation rate limit reached",
                LimitScope::Global,
            ));
        }
        if self.session_limiter.allow(now) {
            Ok(())
        } else {
            Err(CoreError::limit_exceeded(
                "per-session operation rate limit reached",
                LimitScope::Session,
            ))
        }
    }

    /// Best-effort append to the raw `<id>.log` history file (ambient
    /// addition, grounded on the teacher's append-only event log writer).
    /// Errors are swallowed: disk persistence is a convenience, not a
    /// correctness requirement of the in-memory history buffer.
    fn append_raw_log(&self, data: &str) {
        let Some(path) = &self.log_path else {
            return;
        };
        if data.is_empty() {
            return;
        }
        let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) else {
            return;
        };
        let _ = file.write_all(data.as_bytes());
    }

    /// Per-tick maintenance: inactivity detection, scheduler firing, and
    /// fan-out re-flush for backlog that didn't fit in one tick. Returns
    /// `true` once the session has fully terminated and the tick loop
    /// should stop.
    async fn tick(self: &Arc<Self>) -> bool {
        let now = self.clock.now_ms();
        let mut fire_outcomes = Vec::new();
        let mut should_drain_inactive = false;

        {
            let mut inner = self.inner.lock().await;
            if inner.terminating && !inner.is_active {
                return true;
            }

            if inner.activity_state == ActivityState::Active {
                if let Some(last) = inner.last_output_at {
                    if now - last >= self.limits.activity_inactive_after_ms as i64 {
                        inner.activity_state = ActivityState::Inactive;
                        inner.pending_active_transition = None;
                        self.broadcast_event(ServerEvent::SessionActivity {
                            session_id: self.id.clone(),
                            activity_state: ActivityState::Inactive,
                            last_output_at: inner.last_output_at,
                        });
                        should_drain_inactive = true;
                    }
                }
            }

            let due = inner.scheduler.due_rules(now);
            let session_active = inner.activity_state == ActivityState::Active;
            for rule_id in due {
                if let Some(outcome) = inner.scheduler.fire(&rule_id, now, session_active) {
                    fire_outcomes.push((rule_id, outcome));
                }
            }

            if inner.fanout.backlog_remaining() {
                self.flush_fanout_locked(&mut inner, now);
            }
        }

        for (rule_id, outcome) in fire_outcomes {
            self.handle_fire_outcome(rule_id, outcome, now).await;
        }

        if should_drain_inactive {
            self.on_session_inactive(now).await;
        }

        false
    }

    async fn handle_fire_outcome(self: &Arc<Self>, rule_id: String, outcome: FireOutcome, now: i64) {
        match outcome {
            FireOutcome::Inject { opts, removed } => {
                let _ = self.inject(opts).await;
                self.broadcast_event(ServerEvent::ScheduledInputRuleUpdated {
                    action: RuleAction::Fired,
                    session_id: self.id.clone(),
                    rule_id: rule_id.clone(),
                    next_run_at: None,
                    paused: None,
                });
                if removed {
                    self.broadcast_event(ServerEvent::ScheduledInputRuleUpdated {
                        action: RuleAction::Removed,
                        session_id: self.id.clone(),
                        rule_id,
                        next_run_at: None,
                        paused: None,
                    });
                }
            }
            FireOutcome::Defer { key, data, raw, submit, enter_style, created_by, rule_id: fired_rule_id, removed } => {
                let spec = DeferSpec {
                    key,
                    source: InjectSource::Scheduled,
                    data,
                    raw,
                    submit,
                    enter_style,
                    activity_policy: ActivityPolicy::Defer,
                    by: created_by,
                    rule_id: Some(fired_rule_id),
                };
                self.register_deferred(spec, now).await;
                if removed {
                    self.broadcast_event(ServerEvent::ScheduledInputRuleUpdated {
                        action: RuleAction::Removed,
                        session_id: self.id.clone(),
                        rule_id,
                        next_run_at: None,
                        paused: None,
                    });
                }
            }
            // An interval rule merely skipped this tick (it already has a
            // fresh `next_run_at` scheduled) — nothing changed, nothing to
            // broadcast.
            FireOutcome::Dropped { removed: false } => {}
            // An offset rule was suppressed while the session was active;
            // per §4.G it gets one shot and is now gone for good.
            FireOutcome::Dropped { removed: true } => {
                self.broadcast_event(ServerEvent::ScheduledInputRuleUpdated {
                    action: RuleAction::Removed,
                    session_id: self.id.clone(),
                    rule_id,
                    next_run_at: None,
                    paused: None,
                });
            }
        }
    }

    async fn register_deferred(&self, spec: DeferSpec, now: i64) {
        let mut inner = self.inner.lock().await;
        let outcome = inner
            .deferral
            .register(DeferSpecInternal::from_spec(spec, now));
        let count = inner.deferral.len();
        drop(inner);
        if let RegisterOutcome::Added(entry) = outcome {
            self.broadcast_event(ServerEvent::DeferredInputUpdated {
                session_id: self.id.clone(),
                action: "added".to_string(),
                count,
                pending: serde_json::to_value(&entry).ok(),
                pending_id: Some(entry.id),
            });
        }
    }

    /// Deferral Manager drain on activity-inactive transition (§4.H).
    async fn on_session_inactive(self: &Arc<Self>, now: i64) {
        let drained = {
            let mut inner = self.inner.lock().await;
            inner.deferral.drain()
        };

        if let Some(opts) = drained {
            self.append_input_marker(MarkerKind::DeferredInput, now).await;
            let _ = self.inject(opts).await;
            self.broadcast_event(ServerEvent::DeferredInputUpdated {
                session_id: self.id.clone(),
                action: "cleared".to_string(),
                count: 0,
                pending: None,
                pending_id: None,
            });
            return;
        }

        self.maybe_inject_stop_inputs(now).await;
    }

    async fn maybe_inject_stop_inputs(self: &Arc<Self>, now: i64) {
        let alias = self.alias.lock().await.clone();
        let (payload, last_user_input_at) = {
            let inner = self.inner.lock().await;
            if !inner.stop_inputs_enabled {
                return;
            }
            let armed: Vec<&StopInput> = inner.stop_inputs.iter().filter(|s| s.armed).collect();
            if armed.is_empty() {
                return;
            }
            if now - inner.last_user_input_at < self.limits.stop_inputs_grace_ms as i64 {
                return;
            }
            if now - self.created_at < self.limits.stop_inputs_session_start_grace_ms as i64 {
                return;
            }
            let joined = armed
                .iter()
                .map(|s| interpolate(&s.prompt, &self.id, alias.as_deref(), &inner))
                .collect::<Vec<_>>()
                .join("\n");
            (joined, inner.last_user_input_at)
        };
        let _ = last_user_input_at;

        let opts = InjectOptions {
            data: payload,
            raw: false,
            submit: true,
            enter_style: EnterStyle::Cr,
            delay_ms: None,
            simulate_typing: false,
            typing_delay_ms: 0,
            notify: true,
            activity_policy: ActivityPolicy::Immediate,
            by: "server".to_string(),
            source: InjectSource::StopInputs,
            rule_id: None,
        };
        let _ = self.inject(opts).await;
    }

    /// The on-PTY-output-chunk algorithm (§4.D steps 1-7).
    async fn on_output_chunk(self: &Arc<Self>, chunk: Bytes) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;

        let offset_before = inner.history.len();
        let (_, seq) = inner.history.append_chunk(&chunk);

        let classification = classifier::classify(&chunk, &inner.classifier_carry);
        inner.classifier_carry = classification.carry.clone();
        let resize_suppressed = inner.last_resize_at > 0
            && now - inner.last_resize_at <= self.limits.activity_suppress_after_resize_ms as i64;
        let suppressed = classification.is_control_only || resize_suppressed;

        if !suppressed {
            inner.last_output_at = Some(now);
            if inner.activity_state == ActivityState::Inactive {
                inner.activity_state = ActivityState::Active;
                self.broadcast_event(ServerEvent::SessionActivity {
                    session_id: self.id.clone(),
                    activity_state: ActivityState::Active,
                    last_output_at: inner.last_output_at,
                });
            }

            let pending_bytes = match &mut inner.pending_active_transition {
                Some(pending) => {
                    pending.bytes += chunk.len();
                    pending.bytes
                }
                None => {
                    inner.pending_active_transition = Some(PendingActiveTransition {
                        offset: offset_before,
                        seq,
                        bytes: chunk.len(),
                    });
                    chunk.len()
                }
            };

            if pending_bytes >= self.limits.activity_min_bytes_for_active_marker {
                if let Some(pending) = inner.pending_active_transition.take() {
                    if inner.activity_transitions.len() >= self.limits.max_activity_transitions {
                        inner.activity_transitions.pop_front();
                    }
                    inner.activity_transitions.push_back(ActivityTransition {
                        offset: pending.offset,
                        seq: pending.seq,
                        t: now,
                    });
                }
            }
        }

        let title_scan = osc::scan(&chunk, &inner.osc_carry);
        inner.osc_carry = title_scan.carry.clone();
        if let Some(title) = title_scan.title {
            inner.title = Some(title.clone());
            self.broadcast_event(ServerEvent::SessionUpdated {
                update_type: "title".to_string(),
                session_data: serde_json::json!({ "session_id": self.id, "title": title }),
            });
        }

        if !inner.fanout.has_attached_clients() && classifier::contains_cursor_position_request(&chunk) {
            let _ = self.input_tx.try_send(Bytes::from_static(b"\x1b[1;1R"));
        }

        let data = String::from_utf8_lossy(&chunk).into_owned();
        self.push_history_bytes(&mut inner, &data, now);
    }

    /// Pop a single tick's worth of buffered output (≤`max_flush_bytes_per_tick`)
    /// and route it to attached clients (§4.E flush step 1/3). Any remaining
    /// backlog is left for the next tick rather than drained in one call, so
    /// a large backlog can't starve the event loop.
    fn flush_fanout_locked(&self, inner: &mut SessionInner, _now: i64) {
        let Some(payload) = inner
            .fanout
            .take_flush_payload(self.limits.max_flush_bytes_per_tick)
        else {
            return;
        };
        let current_seq = inner.history.sequence_number();
        let (to_send, _queued_for) = inner.fanout.route_payload(&payload, current_seq);
        for client_id in &to_send {
            if let Some(tx) = inner.client_txs.get(client_id) {
                let _ = tx.send(ServerEvent::Stdout {
                    session_id: self.id.clone(),
                    data: payload.clone(),
                    from_queue: None,
                });
            }
        }
    }

    async fn on_exit(self: Arc<Self>, result: anyhow::Result<ExitStatus>) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;
        inner.is_active = false;
        inner.ended_at = Some(now);
        inner.exit_code = match result {
            Ok(status) => status.code,
            Err(_) => None,
        };
    }

    // -- Public operations (§4.D) --------------------------------------

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), CoreError> {
        let cols = cols.max(MIN_COLS);
        let rows = rows.max(MIN_ROWS);
        let now = self.clock.now_ms();
        self.check_rate_limit(now)?;
        {
            let mut inner = self.inner.lock().await;
            if !inner.is_active {
                return Err(CoreError::conflict("session not active"));
            }
            inner.cols = cols;
            inner.rows = rows;
            inner.last_resize_at = now;
        }
        self.resize_tx
            .send((cols, rows))
            .await
            .map_err(|_| CoreError::transient("pty resize channel closed"))
    }

    pub async fn append_input_marker(&self, kind: MarkerKind, t: i64) -> u64 {
        let mut inner = self.inner.lock().await;
        let (seq, hidden) = inner.history.append_input_marker(kind, t);
        self.push_history_bytes(&mut inner, &hidden, t);
        seq
    }

    /// Route bytes already written to `History` (PTY output or a hidden
    /// input marker) through the fan-out buffer so attached clients never
    /// see a gap between what history holds and what the live stream
    /// delivers (§8 invariant: no gaps, no duplicates).
    fn push_history_bytes(&self, inner: &mut SessionInner, data: &str, now: i64) {
        self.append_raw_log(data);
        if let Some(dropped) = inner.fanout.broadcast(data) {
            self.broadcast_event(ServerEvent::StdoutDropped {
                session_id: self.id.clone(),
                dropped_bytes: dropped.dropped_bytes,
                backlog_bytes: dropped.backlog_bytes,
            });
        }
        if inner.fanout.should_schedule_flush() {
            inner.fanout.mark_scheduled();
            self.flush_fanout_locked(inner, now);
        }
    }

    pub async fn record_render_marker(&self, t: i64, line: i64) {
        let mut inner = self.inner.lock().await;
        inner.history.record_render_marker(t, line);
    }

    /// Unified input-injection entry point (§4.F), used by interactive
    /// stdin, the scheduler, deferred drains, stop-inputs, and the HTTP API.
    pub async fn inject(self: &Arc<Self>, opts: InjectOptions) -> Result<InjectOutcome, CoreError> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;

        if !inner.is_active {
            return Err(CoreError::conflict("session not active"));
        }
        if !inner.interactive {
            return Err(CoreError::bad_request("session is not interactive"));
        }

        match opts.source {
            InjectSource::Api => {
                if inner.api_stdin_count >= self.limits.api_stdin_max_messages_per_session {
                    return Err(CoreError::limit_exceeded(
                        "per-session API stdin limit reached",
                        LimitScope::Session,
                    ));
                }
                inner.api_stdin_count += 1;
            }
            InjectSource::Scheduled => {
                if inner.scheduled_input_count >= self.limits.scheduled_input_max_messages_per_session {
                    return Err(CoreError::limit_exceeded(
                        "per-session scheduled input limit reached",
                        LimitScope::Session,
                    ));
                }
                inner.scheduled_input_count += 1;
            }
            _ => {}
        }

        if opts.activity_policy == ActivityPolicy::Suppress && inner.activity_state == ActivityState::Active {
            return Ok(InjectOutcome::Suppressed { reason: "active" });
        }
        if opts.activity_policy == ActivityPolicy::Defer && inner.activity_state == ActivityState::Active {
            let key = format!("{}:{}", opts.source.as_str(), opts.by);
            let spec = DeferSpecInternal::from_spec(
                DeferSpec {
                    key,
                    source: opts.source,
                    data: opts.data.clone(),
                    raw: opts.raw,
                    submit: opts.submit,
                    enter_style: opts.enter_style,
                    activity_policy: opts.activity_policy,
                    by: opts.by.clone(),
                    rule_id: opts.rule_id.clone(),
                },
                now,
            );
            let outcome = inner.deferral.register(spec);
            let count = inner.deferral.len();
            drop(inner);
            if let RegisterOutcome::Added(entry) = outcome {
                self.broadcast_event(ServerEvent::DeferredInputUpdated {
                    session_id: self.id.clone(),
                    action: "added".to_string(),
                    count,
                    pending: serde_json::to_value(&entry).ok(),
                    pending_id: Some(entry.id),
                });
            }
            return Ok(InjectOutcome::Deferred);
        }

        let bytes = self.perform_write(&opts).await?;

        let marker_kind = match opts.source {
            InjectSource::User => Some(MarkerKind::UserInput),
            InjectSource::Api => Some(MarkerKind::ApiInput),
            InjectSource::Scheduled => Some(MarkerKind::ScheduledInput),
            InjectSource::StopInputs => Some(MarkerKind::StopInput),
            InjectSource::Server => None,
        };
        if let Some(kind) = marker_kind {
            let (_, hidden) = inner.history.append_input_marker(kind, now);
            self.push_history_bytes(&mut inner, &hidden, now);
        }

        if opts.source.is_user_originated() {
            inner.last_user_input_at = now;
        }

        if opts.source == InjectSource::StopInputs {
            if inner.stop_inputs_rearm_remaining > 0 {
                inner.stop_inputs_rearm_remaining -= 1;
            } else {
                inner.stop_inputs_enabled = false;
            }
            drop(inner);
            self.broadcast_event(ServerEvent::SessionUpdated {
                update_type: "stop_inputs".to_string(),
                session_data: serde_json::json!({ "session_id": self.id }),
            });
        } else {
            drop(inner);
        }

        if opts.notify {
            self.broadcast_event(ServerEvent::StdinInjected {
                session_id: self.id.clone(),
                by: opts.by.clone(),
                bytes,
                submit: opts.submit,
                enter_style: opts.enter_style.as_str().to_string(),
                raw: opts.raw,
                notify: opts.notify,
                source: opts.source.as_str().to_string(),
                rule_id: opts.rule_id.clone(),
                activity_policy: Some(opts.activity_policy.as_str().to_string()),
            });
        }

        Ok(InjectOutcome::Written { bytes })
    }

    /// The write sequence proper (§4.F steps 1-4), run with the session
    /// lock held so a second caller cannot interleave bytes mid-sequence.
    async fn perform_write(&self, opts: &InjectOptions) -> Result<u64, CoreError> {
        let mut bytes = 0u64;

        if self.limits.api_stdin_send_focus_in {
            self.send_raw(b"\x1b[I").await?;
        }

        if opts.raw {
            bytes += self.send_raw(opts.data.as_bytes()).await?;
        } else if opts.simulate_typing {
            let mut char_buf = [0u8; 4];
            for ch in opts.data.chars() {
                let encoded = ch.encode_utf8(&mut char_buf);
                bytes += self.send_raw(encoded.as_bytes()).await?;
                if opts.typing_delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(opts.typing_delay_ms)).await;
                }
            }
        } else {
            bytes += self.send_raw(opts.data.as_bytes()).await?;
        }

        if opts.submit && !opts.raw {
            tokio::time::sleep(Duration::from_millis(200)).await;
            bytes += self.send_raw(opts.enter_style.as_bytes()).await?;
            if let Some(delay) = opts.delay_ms {
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    bytes += self.send_raw(opts.enter_style.as_bytes()).await?;
                }
            }
        }

        if self.limits.api_stdin_send_focus_out {
            self.send_raw(b"\x1b[O").await?;
        }

        Ok(bytes)
    }

    async fn send_raw(&self, data: &[u8]) -> Result<u64, CoreError> {
        self.input_tx
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| CoreError::transient("pty input channel closed"))?;
        Ok(data.len() as u64)
    }

    /// Idempotent teardown (§4.D `terminate`).
    pub async fn terminate(self: &Arc<Self>) -> Result<(), CoreError> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;
        if inner.terminating {
            return Ok(());
        }
        self.check_rate_limit(now)?;
        inner.terminating = true;
        inner.is_active = false;
        if inner.ended_at.is_none() {
            inner.ended_at = Some(now);
        }
        inner.scheduler.clear();
        inner.deferral.clear();
        inner.client_txs.clear();
        drop(inner);
        // SIGHUP the child directly rather than waiting for it to exit on
        // its own: the backend's run loop only returns once the PTY master
        // reports EOF, so nothing else would ever unblock it. The fake
        // backend used in tests has no pid and this is a no-op for it.
        // `NativePty::drop` escalates to SIGKILL once the backend task
        // unwinds, after `run()` observes the hangup and returns.
        if let Some(pid) = self.child_pid {
            let _ = kill(pid, Signal::SIGHUP);
        }
        Ok(())
    }

    /// Register a new attached client and hand back its dedicated event
    /// channel. The transport layer owns forwarding from the returned
    /// receiver to the actual connection; `Stdout` payloads are only ever
    /// sent here, never on the shared broadcast channel (§8 invariant: no
    /// gaps, no duplicates).
    pub async fn attach(&self, client_id: String) -> (u64, u64, bool, mpsc::UnboundedReceiver<ServerEvent>) {
        let mut inner = self.inner.lock().await;
        inner.connected_clients.insert(client_id.clone());
        let marker = inner.history.sequence_number();
        let byte_offset = inner.history.len() as u64;
        let should_load_history = byte_offset > 0;
        inner.fanout.attach_client(client_id.clone(), marker, byte_offset);
        let (tx, rx) = mpsc::unbounded_channel();
        inner.client_txs.insert(client_id, tx);
        (marker, byte_offset, should_load_history, rx)
    }

    pub async fn detach(&self, client_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.connected_clients.remove(client_id);
        inner.fanout.detach_client(client_id);
        inner.client_txs.remove(client_id);
        drop(inner);
        self.broadcast_event(ServerEvent::Detached {
            session_id: self.id.clone(),
        });
    }

    /// Drain a client's history-sync queue onto its dedicated channel once
    /// it reports `history_loaded` (§4.E).
    pub async fn history_loaded(&self, client_id: &str) {
        let mut inner = self.inner.lock().await;
        let queued = inner.fanout.history_loaded(client_id);
        if queued.is_empty() {
            return;
        }
        let Some(tx) = inner.client_txs.get(client_id) else {
            return;
        };
        for data in queued {
            let _ = tx.send(ServerEvent::Stdout {
                session_id: self.id.clone(),
                data,
                from_queue: Some(true),
            });
        }
    }

    pub async fn read_history_from(&self, offset: usize) -> Vec<u8> {
        let inner = self.inner.lock().await;
        inner.history.read_from(offset).to_vec()
    }

    pub async fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock().await;
        SessionSummary {
            id: self.id.clone(),
            alias: self.alias.lock().await.clone(),
            is_active: inner.is_active,
            interactive: inner.interactive,
            visibility: inner.visibility,
            title: inner.title.clone(),
            created_at: self.created_at,
            last_output_at: inner.last_output_at,
            ended_at: inner.ended_at,
            exit_code: inner.exit_code,
            cols: inner.cols,
            rows: inner.rows,
            activity_state: inner.activity_state,
        }
    }

    // -- Scheduler passthrough (§4.G) -----------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn add_rule(
        &self,
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
    ) -> Result<String, CoreError> {
        let now = self.clock.now_ms();
        self.check_rate_limit(now)?;
        let id = format!("rule-{}", self.rule_seq.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock().await;
        inner.scheduler.add_rule(
            &self.limits,
            id.clone(),
            kind,
            data,
            raw,
            submit,
            enter_style,
            activity_policy,
            offset_ms,
            interval_ms,
            stop_after,
            created_by,
            now,
        )?;
        drop(inner);
        self.broadcast_event(ServerEvent::ScheduledInputRuleUpdated {
            action: RuleAction::Added,
            session_id: self.id.clone(),
            rule_id: id.clone(),
            next_run_at: None,
            paused: Some(false),
        });
        Ok(id)
    }

    pub async fn remove_rule(&self, rule_id: &str) -> Result<Option<Rule>, CoreError> {
        let now = self.clock.now_ms();
        self.check_rate_limit(now)?;
        let mut inner = self.inner.lock().await;
        let removed = inner.scheduler.remove_rule(rule_id);
        drop(inner);
        if removed.is_some() {
            self.broadcast_event(ServerEvent::ScheduledInputRuleUpdated {
                action: RuleAction::Removed,
                session_id: self.id.clone(),
                rule_id: rule_id.to_string(),
                next_run_at: None,
                paused: None,
            });
        }
        Ok(removed)
    }

    pub async fn update_rule(&self, rule_id: &str, patch: RulePatch) -> Result<(), CoreError> {
        let now = self.clock.now_ms();
        self.check_rate_limit(now)?;
        let mut inner = self.inner.lock().await;
        inner.scheduler.update_rule(rule_id, patch, now)?;
        let next_run_at = inner.scheduler.get(rule_id).and_then(|r| r.next_run_at);
        let paused = inner.scheduler.get(rule_id).map(|r| r.paused);
        drop(inner);
        self.broadcast_event(ServerEvent::ScheduledInputRuleUpdated {
            action: RuleAction::Updated,
            session_id: self.id.clone(),
            rule_id: rule_id.to_string(),
            next_run_at,
            paused,
        });
        Ok(())
    }

    pub async fn list_rules(&self) -> Vec<Rule> {
        let inner = self.inner.lock().await;
        inner.scheduler.list().cloned().collect()
    }

    // -- Stop-inputs passthrough (§3 `stop_inputs`) ---------------------

    pub async fn add_stop_input(
        &self,
        prompt: String,
        source: StopInputSource,
        armed: bool,
    ) -> Result<String, CoreError> {
        let now = self.clock.now_ms();
        self.check_rate_limit(now)?;
        let id = format!("stop-{}", self.stop_input_seq.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock().await;
        inner.stop_inputs.push(StopInput {
            id: id.clone(),
            prompt,
            armed,
            source,
        });
        drop(inner);
        self.broadcast_event(ServerEvent::SessionUpdated {
            update_type: "stop_inputs".to_string(),
            session_data: serde_json::json!({ "session_id": self.id, "action": "added", "id": id }),
        });
        Ok(id)
    }

    pub async fn remove_stop_input(&self, id: &str) -> Result<bool, CoreError> {
        let now = self.clock.now_ms();
        self.check_rate_limit(now)?;
        let mut inner = self.inner.lock().await;
        let before = inner.stop_inputs.len();
        inner.stop_inputs.retain(|s| s.id != id);
        let removed = inner.stop_inputs.len() != before;
        drop(inner);
        if removed {
            self.broadcast_event(ServerEvent::SessionUpdated {
                update_type: "stop_inputs".to_string(),
                session_data: serde_json::json!({ "session_id": self.id, "action": "removed", "id": id }),
            });
        }
        Ok(removed)
    }

    pub async fn list_stop_inputs(&self) -> Vec<StopInput> {
        self.inner.lock().await.stop_inputs.clone()
    }

    pub async fn set_stop_inputs_enabled(&self, enabled: bool) -> Result<(), CoreError> {
        let now = self.clock.now_ms();
        self.check_rate_limit(now)?;
        let mut inner = self.inner.lock().await;
        inner.stop_inputs_enabled = enabled;
        if enabled {
            inner.stop_inputs_rearm_remaining = self.limits.stop_inputs_rearm_max;
        }
        drop(inner);
        self.broadcast_event(ServerEvent::SessionUpdated {
            update_type: "stop_inputs".to_string(),
            session_data: serde_json::json!({ "session_id": self.id, "enabled": enabled }),
        });
        Ok(())
    }

    // -- Deferral Manager passthrough (§4.H) ----------------------------

    pub async fn list_deferred(&self) -> Vec<DeferredEntryView> {
        self.inner.lock().await.deferral.list()
    }

    pub async fn delete_deferred(&self, id: &str) -> Result<bool, CoreError> {
        let now = self.clock.now_ms();
        self.check_rate_limit(now)?;
        let mut inner = self.inner.lock().await;
        let removed = inner.deferral.delete(id);
        let count = inner.deferral.len();
        drop(inner);
        if removed {
            self.broadcast_event(ServerEvent::DeferredInputUpdated {
                session_id: self.id.clone(),
                action: "removed".to_string(),
                count,
                pending: None,
                pending_id: Some(id.to_string()),
            });
        }
        Ok(removed)
    }

    pub async fn clear_deferred(&self) -> Result<(), CoreError> {
        let now = self.clock.now_ms();
        self.check_rate_limit(now)?;
        let mut inner = self.inner.lock().await;
        inner.deferral.clear();
        drop(inner);
        self.broadcast_event(ServerEvent::DeferredInputUpdated {
            session_id: self.id.clone(),
            action: "cleared".to_string(),
            count: 0,
            pending: None,
            pending_id: None,
        });
        Ok(())
    }

    /// Snapshot of input and render markers, used by the registry to
    /// populate terminated-session metadata (§6 "Persisted metadata").
    pub async fn history_markers(&self) -> (Vec<InputMarker>, Vec<RenderMarker>) {
        let inner = self.inner.lock().await;
        (
            inner.history.input_markers().to_vec(),
            inner.history.render_markers().cloned().collect(),
        )
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// Minimal `{{var}}` substitution for stop-input prompt text (§4.H
/// ambient addition). Unknown variables resolve to the empty string.
fn interpolate(template: &str, session_id: &str, alias: Option<&str>, inner: &SessionInner) -> String {
    let mut out = String::with_capacity(template.len());
    let mut i = 0;
    while i < template.len() {
        if template[i..].starts_with("{{") {
            if let Some(end) = template[i..].find("}}") {
                let var = template[i + 2..i + end].trim();
                out.push_str(&resolve_var(var, session_id, alias, inner));
                i += end + 2;
                continue;
            }
        }
        match template[i..].chars().next() {
            Some(ch) => {
                out.push(ch);
                i += ch.len_utf8();
            }
            None => break,
        }
    }
    out
}

fn resolve_var(var: &str, session_id: &str, alias: Option<&str>, inner: &SessionInner) -> String {
    match var {
        "session_id" => session_id.to_string(),
        "alias" => alias.unwrap_or_default().to_string(),
        "last_output_at" => inner
            .last_output_at
            .map(|t| t.to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
