//! Leader-elected poller sending delayed entries once they are due.
//!
//! Only the instance holding the [`DistributedLock`] polls. Each cycle
//! renews the lock, fetches up to one batch of due entries, renews again
//! with the lease service (leadership may have moved during the query) and
//! processes the entries in due order, re-checking the lock as the batch
//! goes on.
//!
//! The order of delete and send depends on the transaction mode:
//!
//! - receive-only: send, then delete. A crash in between sends the entry
//!   twice.
//! - none: delete, then send. A crash in between loses the entry.
//!
//! Neither order removes the window in which a poller that lost the lock to
//! clock drift still acts on a batch.

use crate::backoff::BackoffStrategy;
use crate::circuit_breaker::RepeatedFailuresCircuitBreaker;
use crate::client::{DelayedStore, LeaseClient};
use crate::config::{TransactionMode, TransportSettings};
use crate::delayed::DelayedEntry;
use crate::dispatch::Dispatcher;
use crate::error::{ConfigurationError, ProviderError, TransportError};
use crate::lease::fault_headers;
use crate::lock::DistributedLock;
use crate::message::{headers, QueueName};
use crate::pipeline::CriticalError;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "poller_tests.rs"]
mod tests;

/// Result of one poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another instance holds the lock
    NotLeader,
    /// Entries processed this cycle
    Processed(usize),
}

/// Sends due delayed entries through the dispatcher
pub struct DelayedDeliveryPoller {
    store: Arc<dyn DelayedStore>,
    lock: DistributedLock,
    dispatcher: Arc<Dispatcher>,
    transaction_mode: TransactionMode,
    poison_queue: String,
    /// Queue name recorded as the failed queue in poison fault headers
    failed_queue: QueueName,
    batch_size: usize,
    breaker: RepeatedFailuresCircuitBreaker,
    peek_interval: Duration,
    max_wait_time_when_idle: Duration,
}

impl DelayedDeliveryPoller {
    pub fn new(
        store: Arc<dyn DelayedStore>,
        lease_client: Arc<dyn LeaseClient>,
        dispatcher: Arc<Dispatcher>,
        settings: &TransportSettings,
        critical_error: CriticalError,
    ) -> Result<Self, ConfigurationError> {
        let delayed = &settings.delayed_delivery;
        let poison_queue = match delayed.poison_queue_address()? {
            Some(address) => address,
            None => settings.error_queue_address()?,
        };

        Ok(Self {
            store,
            lock: DistributedLock::new(
                format!("{}-lock", delayed.table_name),
                lease_client,
                delayed.lease_duration(),
            ),
            dispatcher,
            transaction_mode: settings.transaction_mode,
            poison_queue: poison_queue.to_string(),
            failed_queue: settings.input_queue_name()?,
            batch_size: delayed.batch_size,
            breaker: RepeatedFailuresCircuitBreaker::new(
                format!("delayed delivery poller for '{}'", delayed.table_name),
                &settings.circuit_breaker,
                critical_error,
            ),
            peek_interval: settings.peek_interval(),
            max_wait_time_when_idle: settings.max_wait_time_when_idle(),
        })
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Run one cycle: take or keep leadership, then send what is due
    pub async fn poll_once(&self) -> Result<PollOutcome, TransportError> {
        if !self.lock.try_lock_or_renew().await? {
            return Ok(PollOutcome::NotLeader);
        }

        let due = self
            .store
            .query_due_before(Utc::now(), self.batch_size)
            .await
            .map_err(|e| TransportError::provider("query_due_before", "delayed", e))?;

        if !due.is_empty() && !self.lock.confirm_held().await? {
            info!(due = due.len(), "Lost delayed delivery lock during query");
            return Ok(PollOutcome::NotLeader);
        }

        let mut processed = 0;
        for entry in due {
            if !self.lock.ensure_held().await? {
                info!(processed = processed, "Lost delayed delivery lock during batch");
                return Ok(PollOutcome::NotLeader);
            }

            if let Err(e) = self.process(&entry).await {
                error!(
                    message_id = %entry.message_id,
                    destination = %entry.destination,
                    error = %e,
                    "Failed to process delayed message"
                );
            }
            processed += 1;
        }

        Ok(PollOutcome::Processed(processed))
    }

    async fn process(&self, entry: &DelayedEntry) -> Result<(), TransportError> {
        match self.transaction_mode {
            TransactionMode::None => {
                if !self.delete(entry).await? {
                    return Ok(());
                }
                self.send_or_poison(entry).await
            }
            TransactionMode::ReceiveOnly => {
                self.send_or_poison(entry).await?;
                self.delete(entry).await.map(|_| ())
            }
        }
    }

    /// `Ok(false)` when the entry was already gone
    async fn delete(&self, entry: &DelayedEntry) -> Result<bool, TransportError> {
        match self.store.delete(entry).await {
            Ok(()) => Ok(true),
            Err(ProviderError::NotFound { .. }) => {
                debug!(message_id = %entry.message_id, "Delayed entry already removed");
                Ok(false)
            }
            Err(e) => Err(TransportError::provider("delete", "delayed", e)),
        }
    }

    async fn send_or_poison(&self, entry: &DelayedEntry) -> Result<(), TransportError> {
        let error = match self
            .dispatcher
            .send_immediately(&entry.destination, entry.to_outgoing(), entry.time_to_live())
            .await
        {
            Ok(()) => {
                debug!(message_id = %entry.message_id, destination = %entry.destination, "Delayed message sent");
                return Ok(());
            }
            Err(e) => anyhow::Error::new(e),
        };

        warn!(
            message_id = %entry.message_id,
            destination = %entry.destination,
            poison_queue = %self.poison_queue,
            error = %error,
            "Failed to send delayed message; moving it to the poison queue"
        );

        let mut poisoned = entry.to_outgoing();
        poisoned.headers.extend(fault_headers(&self.failed_queue, &error));
        poisoned.headers.insert(
            headers::DELAYED_DELIVERY_DESTINATION.to_string(),
            entry.destination.clone(),
        );
        poisoned
            .headers
            .insert(headers::DELAYED_DELIVERY_DUE.to_string(), entry.due.to_rfc3339());

        self.dispatcher
            .send_immediately(&self.poison_queue, poisoned, None)
            .await
    }

    /// Poll until `cancel` fires, then release the lock
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = BackoffStrategy::new(self.peek_interval, self.max_wait_time_when_idle);
        info!(batch_size = self.batch_size, "Delayed delivery poller started");

        while !cancel.is_cancelled() {
            match self.poll_once().await {
                Ok(PollOutcome::Processed(count)) => {
                    self.breaker.success();
                    backoff.on_batch(count, &cancel).await;
                }
                Ok(PollOutcome::NotLeader) => {
                    self.breaker.success();
                    backoff.reset();
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.lock.duration() / 2) => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Delayed delivery poll failed");
                    self.breaker.failure(e, &cancel).await;
                    backoff.on_batch(0, &cancel).await;
                }
            }
        }

        self.lock.try_release().await;
        info!("Delayed delivery poller stopped");
    }

    /// Spawn [`Self::run`] on the runtime
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
