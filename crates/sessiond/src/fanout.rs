// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session output batching, backpressure, and client history-sync
//! queues (§4.E). Distinct from `history::History`: this buffer is
//! trimmed when it exceeds its cap, history never is.

use std::collections::{HashMap, VecDeque};

/// One dropped range reported back to the caller so it can broadcast
/// `stdout_dropped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dropped {
    pub dropped_bytes: u64,
    pub backlog_bytes: u64,
}

/// Per-client history-sync state (§3 `ClientSyncState`).
#[derive(Debug, Default)]
pub struct ClientSyncState {
    pub loading: bool,
    pub marker: u64,
    pub byte_offset: u64,
    pub queued_output: VecDeque<String>,
}

/// Per-session fan-out buffer and the set of attached clients.
pub struct Fanout {
    chunks: VecDeque<String>,
    total_bytes: usize,
    scheduled: bool,
    max_backlog_bytes: usize,
    clients: HashMap<String, ClientSyncState>,
}

impl Fanout {
    pub fn new(max_backlog_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            scheduled: false,
            max_backlog_bytes,
            clients: HashMap::new(),
        }
    }

    pub fn has_attached_clients(&self) -> bool {
        !self.clients.is_empty()
    }

    pub fn attach_client(&mut self, client_id: String, marker: u64, byte_offset: u64) {
        self.clients.insert(
            client_id,
            ClientSyncState {
                loading: true,
                marker,
                byte_offset,
                queued_output: VecDeque::new(),
            },
        );
    }

    pub fn detach_client(&mut self, client_id: &str) {
        self.clients.remove(client_id);
    }

    /// Drain a client's queued output once it reports `history_loaded`.
    pub fn history_loaded(&mut self, client_id: &str) -> Vec<String> {
        if let Some(state) = self.clients.get_mut(client_id) {
            state.loading = false;
            state.queued_output.drain(..).collect()
        } else {
            Vec::new()
        }
    }

    /// Enqueue new output data. Returns `Some(Dropped)` if the backlog cap
    /// was exceeded and data had to be trimmed from the head.
    ///
    /// The caller is responsible for deciding whether to schedule a flush
    /// (`should_schedule_flush`) since that also depends on whether any
    /// client is attached.
    pub fn broadcast(&mut self, data: &str) -> Option<Dropped> {
        if !data.is_empty() {
            self.total_bytes += data.len();
            self.chunks.push_back(data.to_string());
        }

        if self.total_bytes <= self.max_backlog_bytes {
            return None;
        }

        let mut dropped_bytes = 0u64;
        while self.total_bytes > self.max_backlog_bytes {
            let Some(front) = self.chunks.pop_front() else {
                break;
            };
            let front_len = front.len();
            if self.total_bytes - front_len >= self.max_backlog_bytes {
                self.total_bytes -= front_len;
                dropped_bytes += front_len as u64;
                continue;
            }

            // Trim only part of this chunk, on a UTF-8 boundary.
            let excess = self.total_bytes - self.max_backlog_bytes;
            let mut cut = excess.min(front_len);
            while cut < front_len && !front.is_char_boundary(cut) {
                cut += 1;
            }
            dropped_bytes += cut as u64;
            self.total_bytes -= cut;
            let remainder = front[cut..].to_string();
            if !remainder.is_empty() {
                self.chunks.push_front(remainder);
            }
            break;
        }

        if dropped_bytes == 0 {
            None
        } else {
            Some(Dropped {
                dropped_bytes,
                backlog_bytes: self.total_bytes as u64,
            })
        }
    }

    pub fn should_schedule_flush(&self) -> bool {
        self.has_attached_clients() && !self.scheduled && self.total_bytes > 0
    }

    pub fn mark_scheduled(&mut self) {
        self.scheduled = true;
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0 && self.chunks.is_empty()
    }

    /// Pop up to `cap` bytes from the head of the backlog, splitting the
    /// last string on a UTF-8 character boundary so no code point is split
    /// across two payloads.
    pub fn take_flush_payload(&mut self, cap: usize) -> Option<String> {
        let mut payload = String::new();
        let mut budget = cap;

        while budget > 0 {
            let Some(front) = self.chunks.pop_front() else {
                break;
            };
            if front.len() <= budget {
                budget -= front.len();
                self.total_bytes -= front.len();
                payload.push_str(&front);
            } else {
                let mut cut = budget;
                while cut > 0 && !front.is_char_boundary(cut) {
                    cut -= 1;
                }
                let (head, tail) = front.split_at(cut);
                payload.push_str(head);
                self.total_bytes -= head.len();
                if !tail.is_empty() {
                    self.chunks.push_front(tail.to_string());
                }
                budget = 0;
            }
        }

        if self.chunks.is_empty() && self.total_bytes == 0 {
            self.scheduled = false;
        }

        if payload.is_empty() {
            None
        } else {
            Some(payload)
        }
    }

    pub fn backlog_remaining(&self) -> bool {
        !self.chunks.is_empty()
    }

    /// Route a flushed payload: clients still `loading` with
    /// `current_seq >= marker` get it queued, everyone else gets it sent
    /// immediately. Returns `(to_send, queued_for)`.
    pub fn route_payload(&mut self, payload: &str, current_seq: u64) -> (Vec<String>, Vec<String>) {
        let mut to_send = Vec::new();
        let mut queued_for = Vec::new();
        for (client_id, state) in self.clients.iter_mut() {
            if state.loading && current_seq >= state.marker {
                state.queued_output.push_back(payload.to_string());
                queued_for.push(client_id.clone());
            } else {
                to_send.push(client_id.clone());
            }
        }
        (to_send, queued_for)
    }
}

#[cfg(test)]
#[path = "fanout_tests.rs"]
mod tests;
