//! Delivery-guarantee policies for received messages.
//!
//! The strategy is picked once from the configured [`TransactionMode`]:
//!
//! - [`ReceiveStrategy::AtLeastOnce`] acknowledges only after the pipeline
//!   succeeded or the failure was handled. A crash mid-processing means the
//!   message reappears once its visibility timeout lapses.
//! - [`ReceiveStrategy::AtMostOnce`] acknowledges before running the
//!   pipeline. The message is never processed twice, and is lost if
//!   processing fails.

use crate::config::TransactionMode;
use crate::error::TransportError;
use crate::lease::MessageLease;
use crate::message::MessageEnvelope;
use crate::pipeline::{
    CriticalError, ErrorContext, ErrorHandleResult, MessageContext, MessageProcessor,
};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "receive_tests.rs"]
mod tests;

/// How a received message is acknowledged relative to processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStrategy {
    AtLeastOnce,
    AtMostOnce,
}

impl ReceiveStrategy {
    pub fn for_transaction_mode(mode: TransactionMode) -> Self {
        match mode {
            TransactionMode::ReceiveOnly => Self::AtLeastOnce,
            TransactionMode::None => Self::AtMostOnce,
        }
    }

    /// Run one leased message through the pipeline.
    ///
    /// Pipeline failures never escape as errors; they are turned into an
    /// ack, nack or error-queue move. What does escape is lease expiry and
    /// deserialization failure, both only after the message was parked or
    /// left for redelivery.
    pub async fn receive(
        &self,
        lease: MessageLease,
        processor: &dyn MessageProcessor,
        critical_error: &CriticalError,
    ) -> Result<(), TransportError> {
        let envelope = lease.unwrap().await?;

        match self {
            Self::AtLeastOnce => {
                receive_at_least_once(&lease, envelope, processor, critical_error).await
            }
            Self::AtMostOnce => {
                receive_at_most_once(&lease, envelope, processor, critical_error).await
            }
        }
    }
}

fn message_context(lease: &MessageLease, envelope: &MessageEnvelope) -> MessageContext {
    MessageContext {
        envelope: envelope.clone(),
        native_message_id: lease.native_message_id().to_string(),
        delivery_count: lease.delivery_count(),
    }
}

async fn receive_at_least_once(
    lease: &MessageLease,
    envelope: MessageEnvelope,
    processor: &dyn MessageProcessor,
    critical_error: &CriticalError,
) -> Result<(), TransportError> {
    let error = match processor
        .on_message(message_context(lease, &envelope))
        .await
    {
        Ok(()) => return lease.ack().await,
        Err(error) => error,
    };

    debug!(
        message_id = %envelope.id(),
        delivery_count = lease.delivery_count(),
        error = %error,
        "Message processing failed; consulting error policy"
    );

    let decision = processor
        .on_error(ErrorContext::new(
            &envelope,
            &error,
            lease.delivery_count(),
            lease,
        ))
        .await;

    match decision {
        // No in-process retry: another instance may pick the message up.
        Ok(ErrorHandleResult::RetryRequired) => lease.nack().await,
        Ok(ErrorHandleResult::Handled) => lease.ack().await,
        Err(policy_error) if TransportError::is_size_exceeded(&policy_error) => {
            warn!(
                message_id = %envelope.id(),
                error = %policy_error,
                "Error queue rejected the annotated message; moving it with minimal headers"
            );
            lease.move_to_error_queue_with_minimal_headers(&envelope).await
        }
        Err(policy_error) => {
            critical_error.raise(
                &format!(
                    "Failed to execute recoverability policy for message '{}'",
                    envelope.id()
                ),
                &policy_error,
            );

            match lease.nack().await {
                Ok(()) => Ok(()),
                Err(e) if e.is_lease_expired() => Err(e),
                Err(e) => {
                    // The message reappears once its visibility timeout lapses.
                    warn!(
                        message_id = %envelope.id(),
                        error = %e,
                        "Failed to release message after policy failure"
                    );
                    Ok(())
                }
            }
        }
    }
}

async fn receive_at_most_once(
    lease: &MessageLease,
    envelope: MessageEnvelope,
    processor: &dyn MessageProcessor,
    critical_error: &CriticalError,
) -> Result<(), TransportError> {
    lease.ack().await?;

    let error = match processor
        .on_message(message_context(lease, &envelope))
        .await
    {
        Ok(()) => return Ok(()),
        Err(error) => error,
    };

    // The message is gone already; the policy result only matters for
    // diagnostics.
    let decision = processor
        .on_error(ErrorContext::new(
            &envelope,
            &error,
            lease.delivery_count(),
            lease,
        ))
        .await;

    match decision {
        Ok(ErrorHandleResult::RetryRequired) => {
            warn!(
                message_id = %envelope.id(),
                error = %error,
                "Retry requested for a message received without a transaction; it will not be retried"
            );
        }
        Ok(ErrorHandleResult::Handled) => {}
        Err(policy_error) => {
            critical_error.raise(
                &format!(
                    "Failed to execute recoverability policy for message '{}'",
                    envelope.id()
                ),
                &policy_error,
            );
        }
    }

    Ok(())
}
