//! Offline-retry queue.
//!
//! Requests that failed with a transient condition wait here until a fixed
//! quiescence delay has passed, then the whole queue is drained and every
//! entry goes back through the full execution path.

use crate::network::gate::QueueEntry;
use std::sync::Mutex;
use std::time::Duration;

/// Retry eligibility and timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    /// How long the retry queue waits before resubmitting.
    pub quiescence: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, quiescence: Duration) -> Self {
        Self {
            max_attempts,
            quiescence,
        }
    }

    /// Whether a request that has already been retried `attempts` times may
    /// be retried again. Only GETs are ever retried.
    pub fn allows(&self, is_get: bool, attempts: u32) -> bool {
        is_get && attempts < self.max_attempts.saturating_sub(1)
    }
}

/// What the caller must do after an entry was queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPlan {
    /// First queued entry with this reason; report it.
    pub announce: bool,
    /// No drain is pending; start the quiescence timer.
    pub start_timer: bool,
}

#[derive(Default)]
struct RetryState {
    queue: Vec<QueueEntry>,
    timer_pending: bool,
}

#[derive(Default)]
pub(crate) struct RetryScheduler {
    state: Mutex<RetryState>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, entry: QueueEntry) -> RetryPlan {
        let mut state = self.state.lock().unwrap();

        let announce = match &entry.retry_reason {
            Some(reason) => !state
                .queue
                .iter()
                .any(|queued| queued.retry_reason.as_deref() == Some(reason.as_str())),
            None => false,
        };

        let start_timer = !state.timer_pending;
        state.timer_pending = true;
        state.queue.push(entry);

        RetryPlan {
            announce,
            start_timer,
        }
    }

    /// Take every waiting entry; the next enqueue starts a new timer.
    pub fn drain(&self) -> Vec<QueueEntry> {
        let mut state = self.state.lock().unwrap();
        state.timer_pending = false;
        std::mem::take(&mut state.queue)
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}
