// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scripted `Backend` used by the supervisor's own tests and the
//! registry's tests so neither has to fork a real process.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Backend, ExitStatus};

/// Emits a fixed script of output chunks, then idles echoing nothing
/// further while recording every byte written to "stdin" until the input
/// channel closes.
pub struct FakeBackend {
    chunks: Vec<Bytes>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl FakeBackend {
    pub fn new(chunks: Vec<&'static [u8]>) -> Self {
        Self {
            chunks: chunks.into_iter().map(Bytes::from_static).collect(),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn written(&self) -> Arc<Mutex<Vec<u8>>> {
        self.written.clone()
    }
}

impl Backend for FakeBackend {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<Bytes>,
        mut resize_rx: mpsc::Receiver<(u16, u16)>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ExitStatus>> + Send + '_>> {
        let chunks = std::mem::take(&mut self.chunks);
        let written = self.written.clone();
        Box::pin(async move {
            for chunk in chunks {
                if output_tx.send(chunk).await.is_err() {
                    break;
                }
            }
            loop {
                tokio::select! {
                    input = input_rx.recv() => {
                        match input {
                            Some(data) => written.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(&data),
                            None => break,
                        }
                    }
                    resize = resize_rx.recv() => {
                        if resize.is_none() {
                            break;
                        }
                    }
                }
            }
            Ok(ExitStatus { code: Some(0), signal: None })
        })
    }

    fn resize(&self, _cols: u16, _rows: u16) -> anyhow::Result<()> {
        Ok(())
    }

    fn child_pid(&self) -> Option<u32> {
        None
    }
}
