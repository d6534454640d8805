//! Progress reporting with a minimum spacing between updates.

use std::time::{Duration, Instant};

/// Bytes staged so far and the declared total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
}

/// Lets at most one update through per `interval`.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    pending: bool,
}

impl ProgressThrottle {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            pending: false,
        }
    }

    /// Records an update at `now`; true when it should be emitted.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        let due = self
            .last_emit
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.last_emit = Some(now);
            self.pending = false;
        } else {
            self.pending = true;
        }
        due
    }

    /// True when an update was swallowed since the last emit. Clears the flag.
    pub fn take_pending(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }
}
