//! Message pipeline used by the development host.
//!
//! Every message is logged and accepted. Messages whose body is the text
//! `fail` are rejected so the retry and error-queue paths can be exercised
//! by hand; once they reach the configured delivery limit they are parked in
//! the error queue.

use async_trait::async_trait;
use queue_transport::lease::fault_headers;
use queue_transport::{
    ErrorContext, ErrorHandleResult, MessageContext, MessageProcessor, QueueName,
};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;

const FAILURE_BODY: &[u8] = b"fail";

pub struct LoggingProcessor {
    input_queue: QueueName,
    max_delivery_attempts: u32,
    processed: AtomicU64,
}

impl LoggingProcessor {
    pub fn new(input_queue: QueueName, max_delivery_attempts: u32) -> Self {
        Self {
            input_queue,
            max_delivery_attempts,
            processed: AtomicU64::new(0),
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageProcessor for LoggingProcessor {
    async fn on_message(&self, context: MessageContext) -> anyhow::Result<()> {
        let envelope = &context.envelope;
        if envelope.body().as_ref() == FAILURE_BODY {
            anyhow::bail!("message {} asked to fail", envelope.id());
        }

        let total = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            message_id = %envelope.id(),
            native_message_id = %context.native_message_id,
            delivery_count = context.delivery_count,
            intent = ?envelope.intent(),
            body_len = envelope.body().len(),
            total_processed = total,
            "Message processed"
        );
        Ok(())
    }

    async fn on_error(&self, context: ErrorContext<'_>) -> anyhow::Result<ErrorHandleResult> {
        if context.delivery_count < self.max_delivery_attempts {
            warn!(
                message_id = %context.message_id(),
                delivery_count = context.delivery_count,
                error = %context.error,
                "Processing failed; message will be retried"
            );
            return Ok(ErrorHandleResult::RetryRequired);
        }

        warn!(
            message_id = %context.message_id(),
            delivery_count = context.delivery_count,
            error = %context.error,
            "Delivery limit reached; moving message to the error queue"
        );
        context
            .send_to_error_queue(fault_headers(&self.input_queue, context.error))
            .await?;
        Ok(ErrorHandleResult::Handled)
    }
}
