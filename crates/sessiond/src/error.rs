// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kind shared across every transport (HTTP, WebSocket) and the core
/// components themselves. Kept separate from the human-readable message so
/// transports can translate it without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    BadRequest,
    Forbidden,
    LimitExceeded,
    Transient,
    Fatal,
}

impl ErrorKind {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::LimitExceeded => 429,
            Self::Transient => 503,
            Self::Fatal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::BadRequest => "BAD_REQUEST",
            Self::Forbidden => "FORBIDDEN",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::Transient => "TRANSIENT",
            Self::Fatal => "FATAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scope a `LimitExceeded` error applies to, per §7 of the design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitScope {
    Global,
    User,
    Session,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::User => "user",
            Self::Session => "session",
        }
    }
}

/// Unified error type returned by every core operation.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    pub scope: Option<LimitScope>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            scope: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn limit_exceeded(message: impl Into<String>, scope: LimitScope) -> Self {
        Self {
            kind: ErrorKind::LimitExceeded,
            message: message.into(),
            scope: Some(scope),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }
}

/// Machine-readable error envelope shared across transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl From<&CoreError> for ErrorBody {
    fn from(e: &CoreError) -> Self {
        ErrorBody {
            code: e.kind.as_str().to_owned(),
            message: e.message.clone(),
            scope: e.scope.map(|s| s.as_str().to_owned()),
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
