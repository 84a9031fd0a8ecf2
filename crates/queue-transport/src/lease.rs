//! Lease-bound handle on one received message.
//!
//! A [`MessageLease`] owns the ack, nack and error-route operations for a
//! single [`RawMessage`]. All of them must happen inside the visibility
//! window the message was received with; after that another consumer may
//! already have it, and the operation fails with
//! [`TransportError::LeaseExpired`] instead of touching the queue.

use crate::client::QueueClient;
use crate::error::{ProviderError, TransportError};
use crate::message::{headers, MessageEnvelope, QueueName, RawMessage};
use crate::serialization::{EnvelopeSerializer, MessageUnwrapper};
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Build the fault headers describing a processing failure
pub fn fault_headers(failed_queue: &QueueName, error: &anyhow::Error) -> BTreeMap<String, String> {
    let mut fault = minimal_fault_headers(failed_queue);
    fault.insert(
        headers::FAULTS_EXCEPTION_MESSAGE.to_string(),
        format!("{:#}", error),
    );
    fault
}

fn minimal_fault_headers(failed_queue: &QueueName) -> BTreeMap<String, String> {
    let mut fault = BTreeMap::new();
    fault.insert(
        headers::FAULTS_FAILED_QUEUE.to_string(),
        failed_queue.to_string(),
    );
    fault.insert(
        headers::FAULTS_TIME_OF_FAILURE.to_string(),
        Utc::now().to_rfc3339(),
    );
    fault
}

/// Collaborators a lease needs, shared by every lease a receiver creates
#[derive(Clone)]
pub struct LeaseContext {
    pub source: Arc<dyn QueueClient>,
    pub error_queue: Arc<dyn QueueClient>,
    pub unwrapper: Arc<dyn MessageUnwrapper>,
    pub serializer: Arc<dyn EnvelopeSerializer>,
    pub visibility_timeout: Duration,
}

/// Exclusive handle on one received message
pub struct MessageLease {
    raw: RawMessage,
    context: LeaseContext,
    received_at: Instant,
}

impl MessageLease {
    /// Start the lease; the visibility window counts from now
    pub fn new(raw: RawMessage, context: LeaseContext) -> Self {
        Self {
            raw,
            context,
            received_at: Instant::now(),
        }
    }

    pub fn raw(&self) -> &RawMessage {
        &self.raw
    }

    pub fn native_message_id(&self) -> &str {
        &self.raw.message_id
    }

    pub fn delivery_count(&self) -> u32 {
        self.raw.dequeue_count
    }

    pub fn source_queue(&self) -> &QueueName {
        self.context.source.name()
    }

    /// Instant after which the message may be handed to someone else
    pub fn deadline(&self) -> Instant {
        self.received_at + self.context.visibility_timeout
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > self.deadline()
    }

    fn assert_not_expired(&self) -> Result<(), TransportError> {
        if self.is_expired() {
            return Err(self.lease_expired());
        }
        Ok(())
    }

    fn lease_expired(&self) -> TransportError {
        TransportError::LeaseExpired {
            message_id: self.raw.message_id.clone(),
        }
    }

    /// Deserialize the body. A body that cannot be read is parked in the
    /// error queue unmodified before the error is returned.
    pub async fn unwrap(&self) -> Result<MessageEnvelope, TransportError> {
        match self.context.unwrapper.unwrap(&self.raw) {
            Ok(envelope) => Ok(envelope),
            Err(source) => {
                warn!(
                    native_message_id = %self.raw.message_id,
                    queue = %self.source_queue(),
                    error = %source,
                    "Failed to unwrap message; moving it to the error queue"
                );

                self.move_unmodified_to_error_queue().await?;

                Err(TransportError::EnvelopeDeserializationFailed {
                    message_id: self.raw.message_id.clone(),
                    source,
                })
            }
        }
    }

    /// Remove the message from the source queue
    pub async fn ack(&self) -> Result<(), TransportError> {
        self.assert_not_expired()?;

        match self
            .context
            .source
            .delete(&self.raw.message_id, &self.raw.pop_receipt)
            .await
        {
            Ok(()) => Ok(()),
            // The pop receipt no longer matches: our window closed on the
            // service side even if the local clock disagrees.
            Err(ProviderError::NotFound { .. }) => Err(self.lease_expired()),
            Err(e) => Err(TransportError::provider(
                "delete",
                self.source_queue().as_str(),
                e,
            )),
        }
    }

    /// Make the message visible again immediately
    pub async fn nack(&self) -> Result<(), TransportError> {
        self.assert_not_expired()?;

        match self
            .context
            .source
            .update_visibility(&self.raw.message_id, &self.raw.pop_receipt, Duration::ZERO)
            .await
        {
            Ok(()) => Ok(()),
            Err(ProviderError::NotFound { .. }) => {
                debug!(
                    native_message_id = %self.raw.message_id,
                    "Message already gone while releasing it"
                );
                Ok(())
            }
            Err(e) => Err(TransportError::provider(
                "update_visibility",
                self.source_queue().as_str(),
                e,
            )),
        }
    }

    /// Copy the raw body to the error queue, then remove the source
    pub async fn move_unmodified_to_error_queue(&self) -> Result<(), TransportError> {
        self.send_to_error_queue(self.raw.body.clone()).await?;
        self.ack().await
    }

    /// Copy the envelope annotated with `fault_headers` to the error queue,
    /// then remove the source. Falls back to the unmodified body when the
    /// annotated copy is too large.
    pub async fn move_to_error_queue(
        &self,
        envelope: &MessageEnvelope,
        fault_headers: BTreeMap<String, String>,
    ) -> Result<(), TransportError> {
        match self.copy_to_error_queue(envelope, fault_headers).await {
            Ok(()) => {}
            Err(TransportError::MessageSizeExceeded { size, max_size, .. }) => {
                warn!(
                    native_message_id = %self.raw.message_id,
                    size = size,
                    max_size = max_size,
                    "Annotated message exceeds the size limit; moving it unmodified"
                );
                self.send_to_error_queue(self.raw.body.clone()).await?;
            }
            Err(e) => return Err(e),
        }

        self.ack().await
    }

    /// Move with only the failed-queue and time-of-failure headers
    pub async fn move_to_error_queue_with_minimal_headers(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<(), TransportError> {
        let fault = minimal_fault_headers(self.source_queue());
        self.move_to_error_queue(envelope, fault).await
    }

    pub(crate) async fn copy_to_error_queue(
        &self,
        envelope: &MessageEnvelope,
        fault_headers: BTreeMap<String, String>,
    ) -> Result<(), TransportError> {
        let annotated = envelope.clone().with_headers(fault_headers);
        let body = self.context.serializer.serialize(&annotated)?;
        self.send_to_error_queue(body).await
    }

    async fn send_to_error_queue(&self, body: Bytes) -> Result<(), TransportError> {
        let error_queue = &self.context.error_queue;
        error_queue
            .send(body, None)
            .await
            .map_err(|e| TransportError::provider("send", error_queue.name().as_str(), e))
    }
}

#[cfg(test)]
#[path = "lease_tests.rs"]
mod tests;
