// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The supervisor's append-only output history (§3). Unlike the fan-out
//! backlog (`fanout.rs`), history is never trimmed — its length only ever
//! grows, and `output_sequence_number` strictly increases on every append.

use serde::{Deserialize, Serialize};

/// Kind of an input marker (§4.D `append_input_marker`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    UserInput,
    ApiInput,
    ScheduledInput,
    DeferredInput,
    StopInput,
}

impl MarkerKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::UserInput => "user",
            Self::ApiInput => "api",
            Self::ScheduledInput => "scheduled",
            Self::DeferredInput => "deferred",
            Self::StopInput => "stop-inputs",
        }
    }
}

/// An ordinal marker recorded alongside the byte stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputMarker {
    pub idx: u64,
    pub t: i64,
    pub kind: MarkerKind,
}

/// A client-reported render position (§3 `render_markers`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderMarker {
    pub t: i64,
    pub line: i64,
}

/// Append-only, never-trimmed output history plus the markers recorded
/// alongside it.
#[derive(Debug, Default)]
pub struct History {
    data: Vec<u8>,
    sequence_number: u64,
    input_markers: Vec<InputMarker>,
    render_markers: std::collections::VecDeque<RenderMarker>,
    max_render_markers: usize,
    next_marker_idx: u64,
}

impl History {
    pub fn new(max_render_markers: usize) -> Self {
        Self {
            data: Vec::new(),
            sequence_number: 0,
            input_markers: Vec::new(),
            render_markers: std::collections::VecDeque::new(),
            max_render_markers,
            next_marker_idx: 0,
        }
    }

    /// Current total length of the history buffer in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Append a raw PTY output chunk. Returns the offset the chunk was
    /// appended at and its new sequence number.
    pub fn append_chunk(&mut self, chunk: &[u8]) -> (usize, u64) {
        let offset = self.data.len();
        self.data.extend_from_slice(chunk);
        self.sequence_number += 1;
        (offset, self.sequence_number)
    }

    /// Push an ordinal input marker and write its hidden in-band OSC 133
    /// sequence into the history. Strictly increments the sequence number.
    /// Returns the new sequence number and the hidden marker bytes, which
    /// the caller must also route through the fan-out buffer so attached
    /// clients never see a gap between history and the live stream.
    pub fn append_input_marker(&mut self, kind: MarkerKind, t: i64) -> (u64, String) {
        let idx = self.next_marker_idx;
        self.next_marker_idx += 1;
        self.input_markers.push(InputMarker { idx, t, kind });

        let hidden = format!("\x1b]133;ts:{};t={}\x07", kind.as_str(), t);
        self.data.extend_from_slice(hidden.as_bytes());
        self.sequence_number += 1;
        (self.sequence_number, hidden)
    }

    /// Append-only; `line <= 0` is ignored. Bounded FIFO eviction.
    pub fn record_render_marker(&mut self, t: i64, line: i64) {
        if line <= 0 {
            return;
        }
        if self.render_markers.len() >= self.max_render_markers {
            self.render_markers.pop_front();
        }
        self.render_markers.push_back(RenderMarker { t, line });
    }

    pub fn input_markers(&self) -> &[InputMarker] {
        &self.input_markers
    }

    pub fn render_markers(&self) -> impl Iterator<Item = &RenderMarker> {
        self.render_markers.iter()
    }

    /// Read a byte range `[offset, len())` for the raw-history endpoint.
    pub fn read_from(&self, offset: usize) -> &[u8] {
        if offset >= self.data.len() {
            &[]
        } else {
            &self.data[offset..]
        }
    }
}

#[cfg(test)]
#[path = "history_tests.rs"]
mod tests;
