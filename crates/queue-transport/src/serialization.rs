//! Envelope wire format and raw message unwrapping.
//!
//! The queue only stores bytes. Envelopes travel inside a JSON wrapper whose
//! body field is base64 encoded. Both the envelope serializer and the unwrap
//! step are traits so endpoints can interoperate with producers that do not
//! use the wrapper.

use crate::error::SerializationError;
use crate::message::{MessageEnvelope, MessageId, MessageIntent, RawMessage};
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Converts envelopes to queue bodies and back
pub trait EnvelopeSerializer: Send + Sync {
    fn serialize(&self, envelope: &MessageEnvelope) -> Result<Bytes, SerializationError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<MessageEnvelope, SerializationError>;
}

/// Turns a raw queue message into an envelope
pub trait MessageUnwrapper: Send + Sync {
    fn unwrap(&self, raw: &RawMessage) -> Result<MessageEnvelope, SerializationError>;
}

// ============================================================================
// JSON wrapper
// ============================================================================

/// Wire representation of an envelope. Field order is fixed and headers are
/// kept sorted, so serializing the same envelope always yields the same bytes.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MessageWrapper {
    id: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to_address: Option<String>,
    #[serde(default)]
    message_intent: MessageIntent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time_to_be_received_ms: Option<u64>,
}

/// JSON envelope serializer
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEnvelopeSerializer;

impl EnvelopeSerializer for JsonEnvelopeSerializer {
    fn serialize(&self, envelope: &MessageEnvelope) -> Result<Bytes, SerializationError> {
        let time_to_be_received_ms = envelope
            .time_to_be_received()
            .map(|ttl| {
                u64::try_from(ttl.as_millis()).map_err(|_| SerializationError::ValueOutOfRange {
                    field: "TimeToBeReceivedMs".to_string(),
                })
            })
            .transpose()?;

        let wrapper = MessageWrapper {
            id: envelope.id().to_string(),
            headers: envelope.headers().clone(),
            body: general_purpose::STANDARD.encode(envelope.body()),
            correlation_id: envelope.correlation_id().map(str::to_string),
            reply_to_address: envelope.reply_to_address().map(str::to_string),
            message_intent: envelope.intent(),
            time_to_be_received_ms,
        };

        Ok(Bytes::from(serde_json::to_vec(&wrapper)?))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<MessageEnvelope, SerializationError> {
        let wrapper: MessageWrapper = serde_json::from_slice(bytes)?;

        let id = wrapper
            .id
            .parse::<MessageId>()
            .map_err(|_| SerializationError::MissingField {
                field: "Id".to_string(),
            })?;
        let body = general_purpose::STANDARD.decode(wrapper.body)?;

        let mut envelope = MessageEnvelope::new(id, Bytes::from(body))
            .with_headers(wrapper.headers)
            .with_intent(wrapper.message_intent);
        if let Some(correlation_id) = wrapper.correlation_id {
            envelope = envelope.with_correlation_id(correlation_id);
        }
        if let Some(reply_to) = wrapper.reply_to_address {
            envelope = envelope.with_reply_to_address(reply_to);
        }
        if let Some(ttl_ms) = wrapper.time_to_be_received_ms {
            envelope = envelope.with_time_to_be_received(Duration::from_millis(ttl_ms));
        }

        Ok(envelope)
    }
}

// ============================================================================
// Unwrappers
// ============================================================================

/// Unwraps bodies produced by this transport's own serializer
#[derive(Clone)]
pub struct NativeMessageUnwrapper {
    serializer: Arc<dyn EnvelopeSerializer>,
}

impl NativeMessageUnwrapper {
    pub fn new(serializer: Arc<dyn EnvelopeSerializer>) -> Self {
        Self { serializer }
    }
}

impl Default for NativeMessageUnwrapper {
    fn default() -> Self {
        Self::new(Arc::new(JsonEnvelopeSerializer))
    }
}

impl MessageUnwrapper for NativeMessageUnwrapper {
    fn unwrap(&self, raw: &RawMessage) -> Result<MessageEnvelope, SerializationError> {
        self.serializer.deserialize(&raw.body)
    }
}

/// Treats the whole queue body as the payload, for producers that write
/// plain messages. The service message id becomes the envelope id.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainBodyUnwrapper;

impl MessageUnwrapper for PlainBodyUnwrapper {
    fn unwrap(&self, raw: &RawMessage) -> Result<MessageEnvelope, SerializationError> {
        let id = raw
            .message_id
            .parse::<MessageId>()
            .map_err(|_| SerializationError::MissingField {
                field: "message_id".to_string(),
            })?;
        Ok(MessageEnvelope::new(id, raw.body.clone()))
    }
}

#[cfg(test)]
#[path = "serialization_tests.rs"]
mod tests;
