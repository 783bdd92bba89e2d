// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! API contract types and server implementation for the HTTP and WebSocket
//! transports (§6).

pub mod auth;
pub mod http;
pub mod state;
pub mod ws;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::transport::state::AppState;

/// Build the axum `Router` with every HTTP and WebSocket route.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(http::health))
        .route("/api/v1/ready", get(http::ready))
        .route("/api/v1/sessions", post(http::create_session).get(http::list_sessions))
        .route("/api/v1/sessions/terminated", get(http::list_terminated))
        .route("/api/v1/sessions/{id}", get(http::get_session))
        .route("/api/v1/sessions/{id}/terminate", post(http::terminate_session))
        .route("/api/v1/sessions/{id}/resize", post(http::resize_session))
        .route("/api/v1/sessions/{id}/stdin", post(http::post_stdin))
        .route("/api/v1/sessions/{id}/history", get(http::get_history))
        .route("/api/v1/sessions/{id}/rules", post(http::add_rule).get(http::list_rules))
        .route(
            "/api/v1/sessions/{id}/rules/{rule_id}",
            axum::routing::patch(http::update_rule).delete(http::remove_rule),
        )
        .route(
            "/api/v1/sessions/{id}/deferred",
            get(http::list_deferred).delete(http::clear_deferred),
        )
        .route("/api/v1/sessions/{id}/deferred/{entry_id}", axum::routing::delete(http::delete_deferred))
        .route(
            "/api/v1/sessions/{id}/stop-inputs",
            post(http::add_stop_input).get(http::list_stop_inputs),
        )
        .route(
            "/api/v1/sessions/{id}/stop-inputs/enabled",
            axum::routing::put(http::set_stop_inputs_enabled),
        )
        .route(
            "/api/v1/sessions/{id}/stop-inputs/{stop_input_id}",
            axum::routing::delete(http::remove_stop_input),
        )
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
