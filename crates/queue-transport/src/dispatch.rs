//! Outgoing message dispatch.
//!
//! The dispatcher resolves each destination through the [`AccountRouter`],
//! checks the destination queue exists (once per destination, for the
//! lifetime of the dispatcher), rewrites address headers to alias form and
//! either sends the message or, when it carries a delay, stores it for the
//! delayed delivery poller.

use crate::addressing::{AccountRouter, QueueAddress, ResolvedQueue};
use crate::client::DelayedStore;
use crate::config::MAX_TIME_TO_LIVE;
use crate::delayed::DelayedEntry;
use crate::error::{ConfigurationError, TransportError};
use crate::message::{headers, MessageEnvelope, MessageIntent, OutgoingMessage};
use crate::serialization::EnvelopeSerializer;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;

/// When a message may be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayConstraint {
    /// Deliver once this much time has passed
    DelayDeliveryWith(Duration),
    /// Deliver at or after this instant
    DoNotDeliverBefore(DateTime<Utc>),
}

impl DelayConstraint {
    pub fn due_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::DelayDeliveryWith(delay) => chrono::Duration::from_std(*delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Self::DoNotDeliverBefore(at) => *at,
        }
    }
}

/// Delivery constraints of one outgoing operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchConstraints {
    pub delay: Option<DelayConstraint>,
    pub time_to_live: Option<Duration>,
}

/// One message to one destination
#[derive(Debug, Clone)]
pub struct TransportOperation {
    pub message: OutgoingMessage,
    /// `queue` or `queue@alias`
    pub destination: String,
    pub constraints: DispatchConstraints,
}

impl TransportOperation {
    pub fn new(message: OutgoingMessage, destination: impl Into<String>) -> Self {
        Self {
            message,
            destination: destination.into(),
            constraints: DispatchConstraints::default(),
        }
    }

    pub fn with_delay(mut self, delay: DelayConstraint) -> Self {
        self.constraints.delay = Some(delay);
        self
    }

    pub fn with_time_to_live(mut self, time_to_live: Duration) -> Self {
        self.constraints.time_to_live = Some(time_to_live);
        self
    }
}

/// Destinations already confirmed to exist. Queues are assumed not to be
/// deleted while the process runs.
#[derive(Debug, Default)]
pub struct QueueExistenceCache {
    known: RwLock<HashSet<QueueAddress>>,
}

impl QueueExistenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, address: &QueueAddress) -> bool {
        self.known.read().await.contains(address)
    }

    pub async fn insert(&self, address: QueueAddress) {
        self.known.write().await.insert(address);
    }
}

struct DelayedTable {
    store: Arc<dyn DelayedStore>,
    table_name: String,
    ready: OnceCell<()>,
}

/// Sends outgoing messages to resolved destinations
pub struct Dispatcher {
    router: AccountRouter,
    serializer: Arc<dyn EnvelopeSerializer>,
    existing_queues: QueueExistenceCache,
    delayed: Option<DelayedTable>,
}

impl Dispatcher {
    pub fn new(router: AccountRouter, serializer: Arc<dyn EnvelopeSerializer>) -> Self {
        Self {
            router,
            serializer,
            existing_queues: QueueExistenceCache::new(),
            delayed: None,
        }
    }

    /// Store delayed sends in `store` instead of rejecting them
    pub fn with_delayed_store(
        mut self,
        store: Arc<dyn DelayedStore>,
        table_name: impl Into<String>,
    ) -> Self {
        self.delayed = Some(DelayedTable {
            store,
            table_name: table_name.into(),
            ready: OnceCell::new(),
        });
        self
    }

    pub fn router(&self) -> &AccountRouter {
        &self.router
    }

    /// Dispatch all operations concurrently; the first failure is returned
    pub async fn dispatch(&self, operations: Vec<TransportOperation>) -> Result<(), TransportError> {
        try_join_all(operations.into_iter().map(|op| self.dispatch_one(op))).await?;
        Ok(())
    }

    async fn dispatch_one(&self, operation: TransportOperation) -> Result<(), TransportError> {
        let TransportOperation {
            message,
            destination,
            constraints,
        } = operation;

        // Address errors are reported even for messages that would be dropped.
        let address = QueueAddress::parse(&destination)?;
        let resolved = self.router.resolve(&address)?;
        let message = self.rewrite_address_headers(message)?;

        let Some(time_to_live) = check_time_to_live(&message, constraints.time_to_live)? else {
            return Ok(());
        };

        if let Some(delay) = constraints.delay {
            let now = Utc::now();
            let due = delay.due_time(now);
            if due > now {
                return self.schedule(due, resolved.address, message, time_to_live).await;
            }
        }

        self.send(resolved, message, time_to_live).await
    }

    /// Send without delay handling; used for messages that are already due
    pub async fn send_immediately(
        &self,
        destination: &str,
        message: OutgoingMessage,
        time_to_live: Option<Duration>,
    ) -> Result<(), TransportError> {
        let address = QueueAddress::parse(destination)?;
        let resolved = self.router.resolve(&address)?;
        let message = self.rewrite_address_headers(message)?;

        let Some(time_to_live) = check_time_to_live(&message, time_to_live)? else {
            return Ok(());
        };
        self.send(resolved, message, time_to_live).await
    }

    /// Reply-to and originating-endpoint always leave in `queue@alias` form
    fn rewrite_address_headers(
        &self,
        mut message: OutgoingMessage,
    ) -> Result<OutgoingMessage, ConfigurationError> {
        for key in [headers::REPLY_TO_ADDRESS, headers::ORIGINATING_ENDPOINT] {
            if let Some(value) = message.headers.get(key) {
                let rewritten = self.router.to_alias_form(value)?;
                message.headers.insert(key.to_string(), rewritten);
            }
        }
        Ok(message)
    }

    async fn ensure_queue_exists(&self, resolved: &ResolvedQueue) -> Result<(), TransportError> {
        if self.existing_queues.contains(&resolved.address).await {
            return Ok(());
        }

        let exists = resolved
            .client
            .exists()
            .await
            .map_err(|e| TransportError::provider("exists", resolved.client.name().as_str(), e))?;

        if !exists {
            return Err(TransportError::QueueNotFound {
                queue_name: resolved.address.to_string(),
            });
        }

        debug!(destination = %resolved.address, "Destination queue exists");
        self.existing_queues.insert(resolved.address.clone()).await;
        Ok(())
    }

    async fn send(
        &self,
        resolved: ResolvedQueue,
        message: OutgoingMessage,
        time_to_live: Option<Duration>,
    ) -> Result<(), TransportError> {
        self.ensure_queue_exists(&resolved).await?;

        let message_id = message.message_id.clone();
        let envelope = envelope_for(message, time_to_live);
        let body = self.serializer.serialize(&envelope)?;

        resolved
            .client
            .send(body, time_to_live)
            .await
            .map_err(|e| TransportError::provider("send", &resolved.address.to_string(), e))?;

        debug!(message_id = %message_id, destination = %resolved.address, "Message sent");
        Ok(())
    }

    async fn schedule(
        &self,
        due: DateTime<Utc>,
        destination: QueueAddress,
        message: OutgoingMessage,
        time_to_live: Option<Duration>,
    ) -> Result<(), TransportError> {
        let Some(delayed) = &self.delayed else {
            return Err(ConfigurationError::DelayedDeliveryDisabled {
                message_id: message.message_id.to_string(),
            }
            .into());
        };

        delayed
            .ready
            .get_or_try_init(|| async {
                delayed
                    .store
                    .ensure_exists()
                    .await
                    .map_err(|e| TransportError::provider("ensure_table", &delayed.table_name, e))
            })
            .await?;

        let message_id = message.message_id.clone();
        let entry = DelayedEntry::new(due, destination.to_string(), message, time_to_live);
        delayed
            .store
            .insert(entry)
            .await
            .map_err(|e| TransportError::provider("insert", &delayed.table_name, e))?;

        debug!(message_id = %message_id, destination = %destination, due = %due, "Message scheduled");
        Ok(())
    }
}

/// `Ok(None)` means the send is skipped; otherwise the time-to-live to apply
fn check_time_to_live(
    message: &OutgoingMessage,
    time_to_live: Option<Duration>,
) -> Result<Option<Option<Duration>>, ConfigurationError> {
    match time_to_live {
        Some(ttl) if ttl.is_zero() => {
            warn!(
                message_id = %message.message_id,
                "Message has a time-to-live of zero and will not be sent"
            );
            Ok(None)
        }
        Some(ttl) if ttl > MAX_TIME_TO_LIVE => Err(ConfigurationError::TimeToLiveTooLong {
            ttl,
            max: MAX_TIME_TO_LIVE,
        }),
        ttl => Ok(Some(ttl)),
    }
}

fn envelope_for(message: OutgoingMessage, time_to_live: Option<Duration>) -> MessageEnvelope {
    let OutgoingMessage {
        message_id,
        headers: message_headers,
        body,
    } = message;

    let id_header = message_id.to_string();
    let mut envelope = MessageEnvelope::new(message_id, body);
    if let Some(correlation_id) = message_headers.get(headers::CORRELATION_ID) {
        envelope = envelope.with_correlation_id(correlation_id.clone());
    }
    if let Some(reply_to) = message_headers.get(headers::REPLY_TO_ADDRESS) {
        envelope = envelope.with_reply_to_address(reply_to.clone());
    }
    if let Some(intent) = message_headers
        .get(headers::MESSAGE_INTENT)
        .and_then(|value| value.parse::<MessageIntent>().ok())
    {
        envelope = envelope.with_intent(intent);
    }
    if let Some(ttl) = time_to_live {
        envelope = envelope.with_time_to_be_received(ttl);
    }

    envelope
        .with_headers(message_headers)
        .with_header(headers::MESSAGE_ID, id_header)
}
