//! Repeated-failures-over-time circuit breaker.
//!
//! Poll loops report every failed and successful fetch. The first failure
//! arms the breaker; if failures keep coming for longer than the configured
//! window without a success in between, the breaker triggers and raises the
//! critical error callback once. Triggering never stops the loop, it only
//! tells the host that the transport is not making progress. Every failure
//! also delays the caller so a broken dependency is not hammered.

use crate::config::CircuitBreakerSettings;
use crate::error::TransportError;
use crate::pipeline::CriticalError;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(test)]
#[path = "circuit_breaker_tests.rs"]
mod tests;

/// Breaker state as observed from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// No failure since the last success
    Disarmed,
    /// Failing, but not for long enough to escalate
    Armed,
    /// Failing past the window; the critical error was raised
    Triggered,
}

#[derive(Debug)]
struct InternalState {
    state: BreakerState,
    armed_at: Option<Instant>,
    consecutive_failures: u64,
}

/// Circuit breaker for one poll loop family
pub struct RepeatedFailuresCircuitBreaker {
    name: String,
    time_to_wait_before_triggering: Duration,
    delay_after_failure: Duration,
    critical_error: CriticalError,
    state: Mutex<InternalState>,
}

impl RepeatedFailuresCircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        settings: &CircuitBreakerSettings,
        critical_error: CriticalError,
    ) -> Self {
        Self::with_timings(
            name,
            settings.time_to_wait_before_triggering(),
            settings.delay_after_failure(),
            critical_error,
        )
    }

    pub fn with_timings(
        name: impl Into<String>,
        time_to_wait_before_triggering: Duration,
        delay_after_failure: Duration,
        critical_error: CriticalError,
    ) -> Self {
        Self {
            name: name.into(),
            time_to_wait_before_triggering,
            delay_after_failure,
            critical_error,
            state: Mutex::new(InternalState {
                state: BreakerState::Disarmed,
                armed_at: None,
                consecutive_failures: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InternalState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.lock().consecutive_failures
    }

    /// Record a successful operation, disarming the breaker
    pub fn success(&self) {
        let mut state = self.lock();
        if state.state == BreakerState::Disarmed {
            return;
        }

        info!(
            breaker = %self.name,
            failures = state.consecutive_failures,
            "Circuit breaker disarmed"
        );
        state.state = BreakerState::Disarmed;
        state.armed_at = None;
        state.consecutive_failures = 0;
    }

    /// Record a failed operation, then wait the failure delay.
    ///
    /// The wait returns early when `cancel` fires.
    pub async fn failure(&self, error: TransportError, cancel: &CancellationToken) {
        let error = anyhow::Error::new(error);
        let trigger = {
            let mut state = self.lock();
            state.consecutive_failures += 1;
            let now = Instant::now();

            match state.state {
                BreakerState::Disarmed => {
                    warn!(
                        breaker = %self.name,
                        error = %error,
                        "Circuit breaker armed"
                    );
                    state.state = BreakerState::Armed;
                    state.armed_at = Some(now);
                    false
                }
                BreakerState::Armed => {
                    let armed_at = state.armed_at.unwrap_or(now);
                    if now.duration_since(armed_at) >= self.time_to_wait_before_triggering {
                        state.state = BreakerState::Triggered;
                        true
                    } else {
                        false
                    }
                }
                BreakerState::Triggered => false,
            }
        };

        if trigger {
            self.critical_error.raise(
                &format!(
                    "{} has been failing for longer than {:?}",
                    self.name, self.time_to_wait_before_triggering
                ),
                &error,
            );
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.delay_after_failure) => {}
        }
    }
}
