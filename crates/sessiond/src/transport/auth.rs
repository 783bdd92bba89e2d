// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::{CoreError, ErrorBody};
use crate::transport::state::AppState;

/// Constant-time string comparison so token checks don't leak length/prefix
/// information through response timing.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate a Bearer token from HTTP headers. `Ok(())` when `expected` is
/// `None` (auth disabled) or the header matches.
pub fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), CoreError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CoreError::forbidden("missing authorization header"))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| CoreError::forbidden("malformed authorization header"))?;

    if constant_time_eq(token, expected) {
        Ok(())
    } else {
        Err(CoreError::forbidden("invalid bearer token"))
    }
}

/// Validate a token carried on a WebSocket upgrade's query string.
pub fn validate_ws_token(token: Option<&str>, expected: Option<&str>) -> Result<(), CoreError> {
    match (expected, token) {
        (None, _) => Ok(()),
        (Some(exp), Some(tok)) if constant_time_eq(exp, tok) => Ok(()),
        _ => Err(CoreError::forbidden("invalid or missing token")),
    }
}

/// Axum middleware enforcing Bearer auth on every route except the health
/// probe and the WebSocket upgrade (which authenticates via query token
/// instead, since browsers cannot set a custom header on a WS handshake).
pub async fn auth_layer(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/api/v1/health" || path == "/api/v1/ready" || path == "/ws" {
        return next.run(req).await;
    }

    if let Err(e) = validate_bearer(req.headers(), state.config.auth_token.as_deref()) {
        let body = ErrorBody::from(&e);
        return (
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::FORBIDDEN),
            Json(body),
        )
            .into_response();
    }

    next.run(req).await
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
