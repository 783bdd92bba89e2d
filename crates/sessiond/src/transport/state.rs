// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use crate::config::Config;
use crate::registry::Registry;

/// Shared application state passed to every handler via axum's `State`
/// extractor (grounded on the teacher's `Store`, trimmed to the two things
/// this transport actually needs: the registry and the static config).
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: Arc<Config>,
}
