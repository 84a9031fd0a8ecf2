//! Interfaces the hosting framework plugs into the transport.
//!
//! The transport calls [`MessageProcessor::on_message`] for every received
//! envelope and [`MessageProcessor::on_error`] when processing fails. The
//! error callback decides between retrying and treating the failure as
//! handled; it can copy the message to the error queue through the
//! [`ErrorContext`]. Failures the transport cannot resolve itself go to the
//! [`CriticalError`] callback.

use crate::error::TransportError;
use crate::lease::MessageLease;
use crate::message::{MessageEnvelope, MessageId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::error;

/// Everything the pipeline gets to see about a received message
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub envelope: MessageEnvelope,
    /// Service-assigned identifier of the underlying queue message
    pub native_message_id: String,
    pub delivery_count: u32,
}

/// Decision returned by the error callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandleResult {
    /// Make the message visible again for another attempt
    RetryRequired,
    /// The failure was dealt with; remove the message
    Handled,
}

/// Context handed to [`MessageProcessor::on_error`]
pub struct ErrorContext<'a> {
    pub envelope: &'a MessageEnvelope,
    pub error: &'a anyhow::Error,
    pub delivery_count: u32,
    lease: &'a MessageLease,
}

impl<'a> ErrorContext<'a> {
    pub(crate) fn new(
        envelope: &'a MessageEnvelope,
        error: &'a anyhow::Error,
        delivery_count: u32,
        lease: &'a MessageLease,
    ) -> Self {
        Self {
            envelope,
            error,
            delivery_count,
            lease,
        }
    }

    /// Copy the envelope, annotated with `fault_headers`, to the error queue.
    ///
    /// The source message is left alone; return [`ErrorHandleResult::Handled`]
    /// afterwards so the transport removes it. A message that no longer fits
    /// once annotated fails with [`TransportError::MessageSizeExceeded`].
    pub async fn send_to_error_queue(
        &self,
        fault_headers: BTreeMap<String, String>,
    ) -> Result<(), TransportError> {
        self.lease
            .copy_to_error_queue(self.envelope, fault_headers)
            .await
    }

    pub fn message_id(&self) -> &MessageId {
        self.envelope.id()
    }
}

/// User message pipeline
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn on_message(&self, context: MessageContext) -> anyhow::Result<()>;

    async fn on_error(&self, context: ErrorContext<'_>) -> anyhow::Result<ErrorHandleResult>;
}

type CriticalErrorHandler = dyn Fn(&str, &anyhow::Error) + Send + Sync;

/// Callback for failures that need operator attention
#[derive(Clone)]
pub struct CriticalError {
    handler: Arc<CriticalErrorHandler>,
}

impl CriticalError {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &anyhow::Error) + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// Callback that only logs
    pub fn log_only() -> Self {
        Self::new(|_, _| {})
    }

    pub fn raise(&self, message: &str, error: &anyhow::Error) {
        error!(error = %error, "{}", message);
        (self.handler)(message, error);
    }
}

impl Default for CriticalError {
    fn default() -> Self {
        Self::log_only()
    }
}

impl fmt::Debug for CriticalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalError").finish_non_exhaustive()
    }
}
