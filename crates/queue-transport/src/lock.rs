//! Distributed lock over a shared lease resource.
//!
//! Used to elect a single leader among transport instances sharing one
//! delayed-delivery store. The lock is a two-state machine:
//!
//! ```text
//! Unheld --acquire ok--> Held --renew conflict--> Unheld
//!   ^                      |
//!   +------- release ------+
//! ```
//!
//! A conflict reported by the lease service is taken as the truth about who
//! holds the lock; local clocks are only used to decide when to renew.

use crate::client::{LeaseClient, LeaseId};
use crate::error::{ProviderError, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;

#[derive(Debug, Clone)]
enum LockState {
    Unheld,
    Held {
        lease_id: LeaseId,
        renewed_at: Instant,
        expires_at: Instant,
    },
}

/// Mutual exclusion over one lease resource, held for a fixed duration
///
/// # Example
///
/// ```rust
/// use queue_transport::{DistributedLock, InMemoryLeaseClient};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let leases = Arc::new(InMemoryLeaseClient::new());
/// let first = DistributedLock::new("delays-lock", leases.clone(), Duration::from_secs(15));
/// let second = DistributedLock::new("delays-lock", leases, Duration::from_secs(15));
///
/// assert!(first.try_lock_or_renew().await.unwrap());
/// assert!(!second.try_lock_or_renew().await.unwrap());
/// # });
/// ```
pub struct DistributedLock {
    name: String,
    client: Arc<dyn LeaseClient>,
    duration: Duration,
    resource_ready: OnceCell<()>,
    state: Mutex<LockState>,
}

impl DistributedLock {
    pub fn new(name: impl Into<String>, client: Arc<dyn LeaseClient>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            client,
            duration,
            resource_ready: OnceCell::new(),
            state: Mutex::new(LockState::Unheld),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    async fn ensure_resource(&self) -> Result<(), TransportError> {
        self.resource_ready
            .get_or_try_init(|| async {
                debug!(lock = %self.name, "Ensuring lease resource exists");
                self.client
                    .ensure_resource()
                    .await
                    .map_err(|e| TransportError::provider("ensure_resource", &self.name, e))
            })
            .await
            .map(|_| ())
    }

    /// Acquire the lock if unheld, renew it if held.
    ///
    /// Returns `Ok(false)` when another holder is active or the lock was
    /// lost to one; errors are reserved for failures talking to the lease
    /// service.
    pub async fn try_lock_or_renew(&self) -> Result<bool, TransportError> {
        self.ensure_resource().await?;

        let mut state = self.state.lock().await;
        match &*state {
            LockState::Unheld => match self.client.acquire(self.duration).await {
                Ok(lease_id) => {
                    info!(lock = %self.name, lease_id = %lease_id, "Lock acquired");
                    let now = Instant::now();
                    *state = LockState::Held {
                        lease_id,
                        renewed_at: now,
                        expires_at: now + self.duration,
                    };
                    Ok(true)
                }
                Err(ProviderError::Conflict { .. }) => {
                    debug!(lock = %self.name, "Lock is held by another instance");
                    Ok(false)
                }
                Err(e) => Err(TransportError::provider("acquire", &self.name, e)),
            },
            LockState::Held { lease_id, .. } => {
                let lease_id = lease_id.clone();
                match self.client.renew(&lease_id).await {
                    Ok(()) => {
                        let now = Instant::now();
                        *state = LockState::Held {
                            lease_id,
                            renewed_at: now,
                            expires_at: now + self.duration,
                        };
                        Ok(true)
                    }
                    Err(ProviderError::Conflict { .. }) => {
                        warn!(lock = %self.name, lease_id = %lease_id, "Lock lost to another instance");
                        *state = LockState::Unheld;
                        Ok(false)
                    }
                    Err(e) => Err(TransportError::provider("renew", &self.name, e)),
                }
            }
        }
    }

    /// Whether this instance believes it holds an unexpired lock
    pub async fn is_held(&self) -> bool {
        match &*self.state.lock().await {
            LockState::Unheld => false,
            LockState::Held { expires_at, .. } => Instant::now() < *expires_at,
        }
    }

    /// Confirm with the lease service that the lock is still ours. Never
    /// acquires; an unheld lock stays unheld.
    pub async fn confirm_held(&self) -> Result<bool, TransportError> {
        if matches!(&*self.state.lock().await, LockState::Unheld) {
            return Ok(false);
        }
        self.try_lock_or_renew().await
    }

    /// Confirm the lock is still ours, renewing once half its duration has
    /// passed since the last renewal.
    pub async fn ensure_held(&self) -> Result<bool, TransportError> {
        let needs_renewal = match &*self.state.lock().await {
            LockState::Unheld => return Ok(false),
            LockState::Held { renewed_at, .. } => renewed_at.elapsed() >= self.duration / 2,
        };

        if needs_renewal {
            self.try_lock_or_renew().await
        } else {
            Ok(true)
        }
    }

    /// Release the lock if held. Failures are logged and swallowed; an
    /// unreleased lease expires on its own.
    pub async fn try_release(&self) {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, LockState::Unheld);

        if let LockState::Held { lease_id, .. } = previous {
            match self.client.release(&lease_id).await {
                Ok(()) => info!(lock = %self.name, lease_id = %lease_id, "Lock released"),
                Err(e) => debug!(
                    lock = %self.name,
                    lease_id = %lease_id,
                    error = %e,
                    "Failed to release lock; it will expire"
                ),
            }
        }
    }
}
