// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#[cfg(test)]
pub mod fake;
pub mod nbio;
pub mod spawn;

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

pub use spawn::{NativePty, SpawnOptions};

/// Outcome of a child process exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Terminal backend abstraction over a PTY.
///
/// Object-safe for use as `Box<dyn Backend>`, so the supervisor can be
/// driven by a fake backend in tests without forking a real process.
pub trait Backend: Send + 'static {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        input_rx: mpsc::Receiver<Bytes>,
        resize_rx: mpsc::Receiver<(u16, u16)>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ExitStatus>> + Send + '_>>;

    fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()>;

    fn child_pid(&self) -> Option<u32>;
}
