//! Adaptive-concurrency message pump.
//!
//! The pump runs one or more receive loops against the input queue. Each
//! loop polls with its own batch size and idle backoff; every received
//! message takes one permit from a semaphore shared by all loops before it
//! is handed to the receive strategy on its own task. Total in-flight
//! processing therefore never exceeds the concurrency the pump was started
//! with, however many loops there are.
//!
//! Stopping cancels the loops and waits up to the shutdown timeout for every
//! permit to come back. Messages a loop received but could not start before
//! the cancellation are released back to the queue.

pub mod planner;

pub use planner::ReceiverConfiguration;

use crate::backoff::BackoffStrategy;
use crate::circuit_breaker::RepeatedFailuresCircuitBreaker;
use crate::config::TransportSettings;
use crate::error::{ConfigurationError, TransportError};
use crate::lease::{LeaseContext, MessageLease};
use crate::message::QueueName;
use crate::pipeline::{CriticalError, MessageProcessor};
use crate::receive::ReceiveStrategy;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

struct Pipeline {
    processor: Arc<dyn MessageProcessor>,
    critical_error: CriticalError,
}

/// State shared by every loop of one running pump
struct ReceiveShared {
    strategy: ReceiveStrategy,
    processor: Arc<dyn MessageProcessor>,
    critical_error: CriticalError,
    lease_context: LeaseContext,
    breaker: RepeatedFailuresCircuitBreaker,
    limiter: Arc<Semaphore>,
    settings: TransportSettings,
}

struct Running {
    cancel: CancellationToken,
    loops: Vec<JoinHandle<()>>,
    limiter: Arc<Semaphore>,
    max_concurrency: u32,
}

/// Receives from the input queue and feeds the message pipeline
pub struct MessagePump {
    lease_context: LeaseContext,
    settings: TransportSettings,
    strategy: ReceiveStrategy,
    pipeline: Option<Pipeline>,
    running: Option<Running>,
}

impl MessagePump {
    pub fn new(lease_context: LeaseContext, settings: TransportSettings) -> Self {
        let strategy = ReceiveStrategy::for_transaction_mode(settings.transaction_mode);
        Self {
            lease_context,
            settings,
            strategy,
            pipeline: None,
            running: None,
        }
    }

    pub fn strategy(&self) -> ReceiveStrategy {
        self.strategy
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Register the pipeline callbacks. Must happen before receiving starts.
    pub fn initialize(&mut self, processor: Arc<dyn MessageProcessor>, critical_error: CriticalError) {
        self.pipeline = Some(Pipeline {
            processor,
            critical_error,
        });
    }

    /// Start the receive loops with at most `max_concurrency` messages in flight
    pub fn start_receive(&mut self, max_concurrency: u32) -> Result<(), TransportError> {
        let pipeline = self.pipeline.as_ref().ok_or_else(|| ConfigurationError::Invalid {
            message: "message pump must be initialized before receiving".to_string(),
        })?;
        if self.running.is_some() {
            return Err(ConfigurationError::Invalid {
                message: "message pump is already receiving".to_string(),
            }
            .into());
        }
        if max_concurrency == 0 {
            return Err(ConfigurationError::OutOfRange {
                key: "max_concurrency".to_string(),
                message: "must be at least 1".to_string(),
            }
            .into());
        }

        let plan = ReceiverConfiguration::plan(
            max_concurrency,
            self.settings.receive_batch_size,
            self.settings.degree_of_receive_parallelism,
        );
        let queue = self.lease_context.source.name().clone();

        info!(
            queue = %queue,
            max_concurrency = max_concurrency,
            batch_sizes = ?plan.batch_sizes(),
            strategy = ?self.strategy,
            "Starting message pump"
        );

        let limiter = Arc::new(Semaphore::new(max_concurrency as usize));
        let shared = Arc::new(ReceiveShared {
            strategy: self.strategy,
            processor: Arc::clone(&pipeline.processor),
            critical_error: pipeline.critical_error.clone(),
            lease_context: self.lease_context.clone(),
            breaker: RepeatedFailuresCircuitBreaker::new(
                format!("message pump for '{}'", queue),
                &self.settings.circuit_breaker,
                pipeline.critical_error.clone(),
            ),
            limiter: Arc::clone(&limiter),
            settings: self.settings.clone(),
        });

        let cancel = CancellationToken::new();
        let loops = plan
            .batch_sizes()
            .iter()
            .enumerate()
            .map(|(index, &batch_size)| {
                tokio::spawn(receive_loop(
                    index,
                    batch_size,
                    Arc::clone(&shared),
                    cancel.child_token(),
                ))
            })
            .collect();

        self.running = Some(Running {
            cancel,
            loops,
            limiter,
            max_concurrency,
        });
        Ok(())
    }

    /// Stop polling and wait, up to the shutdown timeout, for in-flight
    /// messages to finish. A timeout is logged, not returned.
    pub async fn stop_receive(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let queue = self.lease_context.source.name();

        info!(queue = %queue, "Stopping message pump");
        running.cancel.cancel();

        for handle in running.loops {
            if let Err(e) = handle.await {
                error!(queue = %queue, error = %e, "Receive loop terminated abnormally");
            }
        }

        let drain = tokio::time::timeout(
            self.settings.shutdown_timeout(),
            running.limiter.acquire_many(running.max_concurrency),
        )
        .await;

        match drain {
            Ok(Ok(_permits)) => info!(queue = %queue, "Message pump stopped"),
            Ok(Err(e)) => warn!(queue = %queue, error = %e, "Concurrency limiter closed during shutdown"),
            Err(_) => error!(
                queue = %queue,
                in_flight = running.max_concurrency as usize - running.limiter.available_permits(),
                timeout = ?self.settings.shutdown_timeout(),
                "Timed out waiting for in-flight messages to complete"
            ),
        }
    }
}

async fn receive_loop(
    index: usize,
    batch_size: u32,
    shared: Arc<ReceiveShared>,
    cancel: CancellationToken,
) {
    let source = Arc::clone(&shared.lease_context.source);
    let visibility_timeout = shared.lease_context.visibility_timeout;
    let mut backoff = BackoffStrategy::new(
        shared.settings.peek_interval(),
        shared.settings.max_wait_time_when_idle(),
    );

    debug!(queue = %source.name(), receive_loop = index, batch_size = batch_size, "Receive loop started");

    while !cancel.is_cancelled() {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = source.receive_batch(batch_size, visibility_timeout) => polled,
        };

        let messages = match polled {
            Ok(messages) => {
                shared.breaker.success();
                messages
            }
            Err(e) => {
                warn!(queue = %source.name(), receive_loop = index, error = %e, "Failed to receive messages");
                shared
                    .breaker
                    .failure(TransportError::provider("receive", source.name().as_str(), e), &cancel)
                    .await;
                continue;
            }
        };

        let received = messages.len();
        // The visibility window started with the receive call.
        let leases: Vec<MessageLease> = messages
            .into_iter()
            .map(|raw| MessageLease::new(raw, shared.lease_context.clone()))
            .collect();

        let mut leases = leases.into_iter();
        while let Some(lease) = leases.next() {
            // A free permit wins over cancellation, so received messages still
            // start during shutdown unless the loop would have to wait.
            let permit = tokio::select! {
                biased;
                permit = Arc::clone(&shared.limiter).acquire_owned() => permit.ok(),
                _ = cancel.cancelled() => None,
            };
            let Some(permit) = permit else {
                release_unstarted(std::iter::once(lease).chain(leases), source.name()).await;
                break;
            };

            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let _permit = permit;
                let native_message_id = lease.native_message_id().to_string();
                let result = shared
                    .strategy
                    .receive(lease, shared.processor.as_ref(), &shared.critical_error)
                    .await;

                match result {
                    Ok(()) => {}
                    Err(e) if e.is_lease_expired() => warn!(
                        native_message_id = %native_message_id,
                        "Processing exceeded the visibility timeout; message will be redelivered"
                    ),
                    Err(TransportError::EnvelopeDeserializationFailed { source, .. }) => error!(
                        native_message_id = %native_message_id,
                        error = %source,
                        "Message could not be deserialized and was moved to the error queue"
                    ),
                    Err(e) => warn!(
                        native_message_id = %native_message_id,
                        error = %e,
                        "Failed to complete message"
                    ),
                }
            });
        }

        backoff.on_batch(received, &cancel).await;
    }

    debug!(queue = %source.name(), receive_loop = index, "Receive loop stopped");
}

/// Make received but unstarted messages visible again
async fn release_unstarted(leases: impl Iterator<Item = MessageLease>, queue: &QueueName) {
    let mut released = 0;
    for lease in leases {
        match lease.nack().await {
            Ok(()) => released += 1,
            Err(e) => debug!(
                queue = %queue,
                native_message_id = %lease.native_message_id(),
                error = %e,
                "Failed to release unstarted message; it reappears when its lease expires"
            ),
        }
    }
    if released > 0 {
        info!(queue = %queue, released = released, "Released messages not started before shutdown");
    }
}
