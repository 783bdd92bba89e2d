// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Registry (§4.I): maps ids and aliases to live `Session`
//! supervisors, tracks terminated-session metadata, and is the single
//! long-term owner of every `Arc<Session>` — every other component holds
//! only an id or a handle obtained through here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::clock::{Clock, RateLimiters};
use crate::config::Limits;
use crate::error::CoreError;
use crate::history::{InputMarker, RenderMarker};
use crate::session::{CreateOptions, Session, SessionSummary, Visibility};

/// Snapshot of a session whose PTY has exited but which has not yet been
/// purged (§6 "Persisted metadata"). Written once, atomically, to
/// `<sessions_dir>/<id>.json` when `terminate()` finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminatedSessionMetadata {
    pub id: String,
    pub alias: Option<String>,
    pub command_preview: String,
    pub cwd: Option<PathBuf>,
    pub created_at: i64,
    pub last_output_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub cols: u16,
    pub rows: u16,
    pub visibility: Visibility,
    pub interactive: bool,
    pub owner: Option<String>,
    pub input_markers: Vec<InputMarker>,
    pub render_markers: Vec<RenderMarker>,
    pub log_file: String,
}

/// Maps ids and aliases to live sessions (§4.I). Cheaply cloned via `Arc`
/// and shared across the transport layer.
pub struct Registry {
    sessions_dir: PathBuf,
    limits: Limits,
    clock: Arc<dyn Clock>,
    rate_limiters: RateLimiters,
    live: RwLock<HashMap<String, Arc<Session>>>,
    aliases: RwLock<HashMap<String, String>>,
    terminated: Mutex<HashMap<String, TerminatedSessionMetadata>>,
}

impl Registry {
    pub fn new(sessions_dir: PathBuf, limits: Limits, clock: Arc<dyn Clock>) -> Arc<Self> {
        let rate_limiters = RateLimiters::new(
            limits.rate_limit_global_per_sec,
            limits.rate_limit_user_create_per_sec,
        );
        Arc::new(Self {
            sessions_dir,
            limits,
            clock,
            rate_limiters,
            live: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            terminated: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn and register a new session (§4.D `create`, gated by the
    /// global and per-user create rate limiters, §4.A).
    pub async fn create(self: &Arc<Self>, user: &str, mut opts: CreateOptions) -> Result<Arc<Session>, CoreError> {
        let now = self.clock.now_ms();
        if !self.rate_limiters.global.allow(now) {
            return Err(CoreError::limit_exceeded(
                "global operation rate limit reached",
                crate::error::LimitScope::Global,
            ));
        }
        if !self.rate_limiters.allow_create(user, now) {
            return Err(CoreError::limit_exceeded(
                "per-user session-create rate limit reached",
                crate::error::LimitScope::User,
            ));
        }

        let _ = std::fs::create_dir_all(&self.sessions_dir);
        opts.sessions_dir = Some(self.sessions_dir.clone());
        let session = Session::create(
            opts,
            self.limits.clone(),
            self.clock.clone(),
            self.rate_limiters.global.clone(),
        )?;
        self.insert(session.clone()).await;
        Ok(session)
    }

    /// Test-only constructor that drives the session with a fake `Backend`
    /// instead of forking a real PTY.
    #[cfg(test)]
    pub async fn create_with_backend(
        self: &Arc<Self>,
        mut opts: CreateOptions,
        backend: Box<dyn crate::pty::Backend>,
    ) -> Arc<Session> {
        opts.sessions_dir = Some(self.sessions_dir.clone());
        let session = Session::spawn_with_backend(
            opts,
            backend,
            self.limits.clone(),
            self.clock.clone(),
            self.rate_limiters.global.clone(),
        );
        self.insert(session.clone()).await;
        session
    }

    async fn insert(self: &Arc<Self>, session: Arc<Session>) {
        let alias = session.alias.lock().await.clone();
        let id = session.id.clone();
        self.live.write().await.insert(id.clone(), session.clone());
        if let Some(alias) = alias {
            self.aliases.write().await.insert(alias, id);
        }
        self.spawn_termination_watcher(session);
    }

    /// Watches a session to completion and finalizes it into the
    /// terminated-metadata map once its PTY has actually exited — whether
    /// that happens via `terminate()` or the child process exiting on its
    /// own.
    fn spawn_termination_watcher(self: &Arc<Self>, session: Arc<Session>) {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                let summary = session.summary().await;
                if !summary.is_active {
                    registry.finalize(session, summary).await;
                    break;
                }
            }
        });
    }

    async fn finalize(&self, session: Arc<Session>, summary: SessionSummary) {
        let (input_markers, render_markers) = session.history_markers().await;
        let metadata = TerminatedSessionMetadata {
            id: summary.id.clone(),
            alias: summary.alias.clone(),
            command_preview: session.command_preview.clone(),
            cwd: session.cwd.clone(),
            created_at: summary.created_at,
            last_output_at: summary.last_output_at,
            ended_at: summary.ended_at,
            exit_code: summary.exit_code,
            cols: summary.cols,
            rows: summary.rows,
            visibility: summary.visibility,
            interactive: summary.interactive,
            owner: session.owner.clone(),
            input_markers,
            render_markers,
            log_file: format!("{}.log", summary.id),
        };

        if let Err(e) = write_metadata_atomic(&self.sessions_dir, &metadata) {
            tracing::warn!(session_id = %summary.id, error = %e, "failed to persist terminated-session metadata");
        }

        self.live.write().await.remove(&summary.id);
        self.terminated.lock().await.insert(summary.id.clone(), metadata);
    }

    /// Resolve an alias to its session id; unknown keys resolve to
    /// themselves (treated as a raw session id) per §4.I.
    pub async fn resolve(&self, alias_or_id: &str) -> String {
        self.aliases
            .read()
            .await
            .get(alias_or_id)
            .cloned()
            .unwrap_or_else(|| alias_or_id.to_string())
    }

    /// Register or move an alias onto a different session id.
    pub async fn register_alias(&self, alias: String, id: String) {
        self.aliases.write().await.insert(alias, id);
    }

    pub async fn unregister_alias(&self, alias: &str) {
        self.aliases.write().await.remove(alias);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.live.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let live = self.live.read().await;
        let mut out = Vec::with_capacity(live.len());
        for session in live.values() {
            out.push(session.summary().await);
        }
        out
    }

    pub async fn list_terminated(&self) -> Vec<TerminatedSessionMetadata> {
        self.terminated.lock().await.values().cloned().collect()
    }

    /// Terminate a live session (§4.D `terminate`). The actual move into
    /// the terminated map happens asynchronously once the watcher observes
    /// `is_active == false`, mirroring how a session that exits on its own
    /// (without an explicit `terminate()` call) is finalized the same way.
    pub async fn terminate(&self, id: &str) -> Result<(), CoreError> {
        let Some(session) = self.get(id).await else {
            return Err(CoreError::not_found("session not found"));
        };
        session.terminate().await
    }
}

fn write_metadata_atomic(sessions_dir: &Path, metadata: &TerminatedSessionMetadata) -> anyhow::Result<()> {
    let path = sessions_dir.join(format!("{}.json", metadata.id));
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
