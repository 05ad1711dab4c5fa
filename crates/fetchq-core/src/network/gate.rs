//! Bounded admission of queued requests.
//!
//! At most `limit` entries execute at once; the rest wait in FIFO order.
//! A slot is held from admission until the entry settles, including any
//! time it spends waiting in the retry queue.

use crate::network::descriptor::{RequestDescriptor, ResponseBody};
use crate::Result;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// A request waiting for, or holding, an execution slot.
pub(crate) struct QueueEntry {
    pub descriptor: RequestDescriptor,
    responder: oneshot::Sender<Result<ResponseBody>>,
    /// Message shown when this entry was last queued for retry.
    pub retry_reason: Option<String>,
}

impl QueueEntry {
    pub fn new(
        descriptor: RequestDescriptor,
        responder: oneshot::Sender<Result<ResponseBody>>,
    ) -> Self {
        Self {
            descriptor,
            responder,
            retry_reason: None,
        }
    }

    /// Deliver the final outcome. Consuming `self` makes this happen once.
    pub fn settle(self, outcome: Result<ResponseBody>) {
        // The receiver is gone only if every caller dropped its future.
        let _ = self.responder.send(outcome);
    }
}

struct GateState {
    running: usize,
    limit: usize,
    queue: VecDeque<QueueEntry>,
}

pub(crate) struct ConcurrencyGate {
    state: Mutex<GateState>,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                running: 0,
                limit: limit.max(1),
                queue: VecDeque::new(),
            }),
        }
    }

    pub fn push(&self, entry: QueueEntry) {
        self.state.lock().unwrap().queue.push_back(entry);
    }

    /// Pop the head entry if a slot is free, marking the slot taken.
    pub fn next_admission(&self) -> Option<QueueEntry> {
        let mut state = self.state.lock().unwrap();
        if state.running >= state.limit {
            return None;
        }
        let entry = state.queue.pop_front()?;
        state.running += 1;
        Some(entry)
    }

    /// Give back the slot of a settled entry.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = state.running.saturating_sub(1);
    }

    pub fn set_limit(&self, limit: usize) {
        self.state.lock().unwrap().limit = limit.max(1);
    }

    pub fn running(&self) -> usize {
        self.state.lock().unwrap().running
    }

    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}
