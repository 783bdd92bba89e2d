// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP request/response types and axum handler implementations for the
//! session-lifecycle and stdin/rule surface (§6). Real-time fan-out and
//! the attach/detach protocol live over the WebSocket in `transport::ws`;
//! this module covers the REST operations a caller needs before or
//! alongside a WS connection: create, list, inspect, resize, terminate,
//! raw history replay, and scheduler-rule CRUD.

use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deferral::DeferredEntryView;
use crate::error::{CoreError, ErrorBody};
use crate::input::{ActivityPolicy, EnterStyle, InjectOptions, InjectOutcome, InjectSource};
use crate::scheduler::{Rule, RuleKind, RulePatch};
use crate::session::{CreateOptions, SessionSummary, StopInput, StopInputSource, Visibility};
use crate::transport::state::AppState;

/// Wraps a `CoreError` so handlers can `?`-propagate it straight into an
/// axum response carrying the right HTTP status (mirrors the teacher's
/// `ErrorCode::to_http_response`, translated through `CoreError::http_status`).
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Header carrying the caller's identity for per-user rate limiting and
/// session ownership (§4.A, §6). There is no broader identity provider in
/// scope here — see DESIGN.md's resolution of this Open Question — so a
/// missing header just means "anonymous".
fn requester(headers: &axum::http::HeaderMap) -> String {
    headers
        .get("x-user")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| "anonymous".to_string())
}

// -- Lifecycle ------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
}

pub async fn ready() -> impl IntoResponse {
    Json(ReadyResponse { ready: true })
}

// -- Sessions ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub command: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub visibility: Visibility,
    pub alias: Option<String>,
    pub owner: Option<String>,
    #[serde(default = "default_true")]
    pub interactive: bool,
}

fn default_true() -> bool {
    true
}

/// `POST /api/v1/sessions`
pub async fn create_session(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = requester(&headers);
    let id = Uuid::new_v4().to_string();
    let command = req
        .command
        .unwrap_or_else(|| vec![state.config.shell.clone()]);

    let opts = CreateOptions {
        id: id.clone(),
        command,
        cwd: req.cwd,
        env: req.env,
        cols: req.cols,
        rows: req.rows,
        visibility: req.visibility,
        alias: req.alias,
        owner: req.owner.or_else(|| Some(user.clone())),
        interactive: req.interactive,
        created_by: user.clone(),
        sessions_dir: None,
    };

    let session = state.registry.create(&user, opts).await?;
    Ok((StatusCode::CREATED, Json(session.summary().await)))
}

/// `GET /api/v1/sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.registry.list().await)
}

/// `GET /api/v1/sessions/terminated`
pub async fn list_terminated(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list_terminated().await)
}

/// `GET /api/v1/sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionSummary>> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;
    Ok(Json(session.summary().await))
}

/// `POST /api/v1/sessions/{id}/terminate`
pub async fn terminate_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let resolved = state.registry.resolve(&id).await;
    state.registry.terminate(&resolved).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// `POST /api/v1/sessions/{id}/resize`
pub async fn resize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> ApiResult<impl IntoResponse> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;
    session.resize(req.cols, req.rows).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct StdinRequest {
    pub data: String,
    #[serde(default)]
    pub raw: bool,
    #[serde(default = "default_true")]
    pub submit: bool,
    #[serde(default)]
    pub enter_style: Option<String>,
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub simulate_typing: bool,
    #[serde(default)]
    pub typing_delay_ms: u64,
    #[serde(default = "default_true")]
    pub notify: bool,
    #[serde(default)]
    pub activity_policy: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StdinResponse {
    Written { bytes: u64 },
    Suppressed { reason: &'static str },
    Deferred,
}

impl From<InjectOutcome> for StdinResponse {
    fn from(o: InjectOutcome) -> Self {
        match o {
            InjectOutcome::Written { bytes } => Self::Written { bytes },
            InjectOutcome::Suppressed { reason } => Self::Suppressed { reason },
            InjectOutcome::Deferred => Self::Deferred,
        }
    }
}

/// `POST /api/v1/sessions/{id}/stdin` — API-sourced injection (§4.F).
pub async fn post_stdin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: axum::http::HeaderMap,
    Json(req): Json<StdinRequest>,
) -> ApiResult<Json<StdinResponse>> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;

    let enter_style = match req.enter_style.as_deref() {
        Some(s) => EnterStyle::parse(s).ok_or_else(|| CoreError::bad_request("invalid enter_style"))?,
        None => EnterStyle::default(),
    };
    let activity_policy = match req.activity_policy.as_deref() {
        Some(s) => ActivityPolicy::parse(s).ok_or_else(|| CoreError::bad_request("invalid activity_policy"))?,
        None => ActivityPolicy::default(),
    };

    let opts = InjectOptions {
        data: req.data,
        raw: req.raw,
        submit: req.submit,
        enter_style,
        delay_ms: req.delay_ms,
        simulate_typing: req.simulate_typing,
        typing_delay_ms: req.typing_delay_ms,
        notify: req.notify,
        activity_policy,
        by: requester(&headers),
        source: InjectSource::Api,
        rule_id: None,
    };
    let outcome = session.inject(opts).await?;
    Ok(Json(outcome.into()))
}

/// Raw byte range `[offset, offset+limit)` of a session's history, used by
/// clients to fetch the `[0, byte_offset)` prefix named in the attach
/// protocol (§4.E) before switching over to the live WS stream.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub data: String,
    pub offset: usize,
}

/// `GET /api/v1/sessions/{id}/history`
pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;
    let bytes = session.read_history_from(q.offset).await;
    Ok(Json(HistoryResponse {
        data: String::from_utf8_lossy(&bytes).into_owned(),
        offset: q.offset,
    }))
}

// -- Scheduler rules (§4.G) ---------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AddRuleRequest {
    pub kind: RuleKind,
    pub data: String,
    #[serde(default)]
    pub raw: bool,
    #[serde(default = "default_true")]
    pub submit: bool,
    pub enter_style: Option<String>,
    pub activity_policy: Option<String>,
    pub offset_ms: Option<u64>,
    pub interval_ms: Option<u64>,
    pub stop_after: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct AddRuleResponse {
    pub rule_id: String,
}

/// `POST /api/v1/sessions/{id}/rules`
pub async fn add_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: axum::http::HeaderMap,
    Json(req): Json<AddRuleRequest>,
) -> ApiResult<Json<AddRuleResponse>> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;

    let enter_style = match req.enter_style.as_deref() {
        Some(s) => EnterStyle::parse(s).ok_or_else(|| CoreError::bad_request("invalid enter_style"))?,
        None => EnterStyle::default(),
    };
    let activity_policy = match req.activity_policy.as_deref() {
        Some(s) => ActivityPolicy::parse(s).ok_or_else(|| CoreError::bad_request("invalid activity_policy"))?,
        None => ActivityPolicy::default(),
    };

    let rule_id = session
        .add_rule(
            req.kind,
            req.data,
            req.raw,
            req.submit,
            enter_style,
            activity_policy,
            req.offset_ms,
            req.interval_ms,
            req.stop_after,
            requester(&headers),
        )
        .await?;
    Ok(Json(AddRuleResponse { rule_id }))
}

/// `GET /api/v1/sessions/{id}/rules`
pub async fn list_rules(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Rule>>> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;
    Ok(Json(session.list_rules().await))
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateRuleRequest {
    pub paused: Option<bool>,
    pub offset_ms: Option<u64>,
    pub interval_ms: Option<u64>,
    pub data: Option<String>,
    pub activity_policy: Option<String>,
    pub enter_style: Option<String>,
}

/// `PATCH /api/v1/sessions/{id}/rules/{rule_id}`
pub async fn update_rule(
    State(state): State<AppState>,
    Path((id, rule_id)): Path<(String, String)>,
    Json(req): Json<UpdateRuleRequest>,
) -> ApiResult<impl IntoResponse> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;

    let activity_policy = match req.activity_policy.as_deref() {
        Some(s) => Some(ActivityPolicy::parse(s).ok_or_else(|| CoreError::bad_request("invalid activity_policy"))?),
        None => None,
    };
    let enter_style = match req.enter_style.as_deref() {
        Some(s) => Some(EnterStyle::parse(s).ok_or_else(|| CoreError::bad_request("invalid enter_style"))?),
        None => None,
    };

    let patch = RulePatch {
        paused: req.paused,
        offset_ms: req.offset_ms,
        interval_ms: req.interval_ms,
        data: req.data,
        activity_policy,
        enter_style,
    };
    session.update_rule(&rule_id, patch).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /api/v1/sessions/{id}/rules/{rule_id}`
pub async fn remove_rule(
    State(state): State<AppState>,
    Path((id, rule_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;
    let removed = session.remove_rule(&rule_id).await?;
    match removed {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(CoreError::not_found("rule not found").into()),
    }
}

// -- Deferral Manager (§4.H) ---------------------------------------------

/// `GET /api/v1/sessions/{id}/deferred`
pub async fn list_deferred(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<DeferredEntryView>>> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;
    Ok(Json(session.list_deferred().await))
}

/// `DELETE /api/v1/sessions/{id}/deferred/{entry_id}`
pub async fn delete_deferred(
    State(state): State<AppState>,
    Path((id, entry_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;
    if session.delete_deferred(&entry_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CoreError::not_found("deferred entry not found").into())
    }
}

/// `DELETE /api/v1/sessions/{id}/deferred`
pub async fn clear_deferred(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;
    session.clear_deferred().await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Stop-inputs (§3 `stop_inputs`) ---------------------------------------

#[derive(Debug, Deserialize)]
pub struct AddStopInputRequest {
    pub prompt: String,
    #[serde(default = "default_true")]
    pub armed: bool,
}

#[derive(Debug, Serialize)]
pub struct AddStopInputResponse {
    pub id: String,
}

/// `POST /api/v1/sessions/{id}/stop-inputs`
pub async fn add_stop_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AddStopInputRequest>,
) -> ApiResult<Json<AddStopInputResponse>> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;
    let id = session
        .add_stop_input(req.prompt, StopInputSource::User, req.armed)
        .await?;
    Ok(Json(AddStopInputResponse { id }))
}

/// `GET /api/v1/sessions/{id}/stop-inputs`
pub async fn list_stop_inputs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<StopInput>>> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;
    Ok(Json(session.list_stop_inputs().await))
}

/// `DELETE /api/v1/sessions/{id}/stop-inputs/{stop_input_id}`
pub async fn remove_stop_input(
    State(state): State<AppState>,
    Path((id, stop_input_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;
    if session.remove_stop_input(&stop_input_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CoreError::not_found("stop-input not found").into())
    }
}

#[derive(Debug, Deserialize)]
pub struct SetStopInputsEnabledRequest {
    pub enabled: bool,
}

/// `PUT /api/v1/sessions/{id}/stop-inputs/enabled`
pub async fn set_stop_inputs_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetStopInputsEnabledRequest>,
) -> ApiResult<impl IntoResponse> {
    let resolved = state.registry.resolve(&id).await;
    let session = state
        .registry
        .get(&resolved)
        .await
        .ok_or_else(|| CoreError::not_found("session not found"))?;
    session.set_stop_inputs_enabled(req.enabled).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
