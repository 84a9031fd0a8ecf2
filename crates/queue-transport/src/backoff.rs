//! Idle backoff for poll loops.
//!
//! Each empty poll grows the delay before the next one by the peek interval,
//! up to the configured ceiling. A poll that returns anything resets the
//! delay immediately, so bursts are picked up without waiting.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-loop idle delay accumulator. Not shared between loops.
#[derive(Debug, Clone)]
pub struct BackoffStrategy {
    peek_interval: Duration,
    max_wait: Duration,
    current: Duration,
}

impl BackoffStrategy {
    pub fn new(peek_interval: Duration, max_wait: Duration) -> Self {
        Self {
            peek_interval,
            max_wait,
            current: Duration::ZERO,
        }
    }

    /// Delay the next poll should wait for, given how many items the last
    /// poll returned. Updates the accumulated state.
    pub fn next_delay(&mut self, received: usize) -> Duration {
        if received > 0 {
            self.current = Duration::ZERO;
            return self.current;
        }

        self.current = (self.current + self.peek_interval).min(self.max_wait);
        self.current
    }

    /// Record a poll result and suspend for the resulting delay.
    ///
    /// Returns early, without error, when `cancel` fires.
    pub async fn on_batch(&mut self, received: usize, cancel: &CancellationToken) {
        let delay = self.next_delay(received);
        if delay.is_zero() {
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    /// Delay accumulated so far
    pub fn current_delay(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
