//! Message types for transport operations including core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Well-known header names the transport reads or writes.
pub mod headers {
    pub const MESSAGE_ID: &str = "Transport.MessageId";
    pub const CORRELATION_ID: &str = "Transport.CorrelationId";
    pub const REPLY_TO_ADDRESS: &str = "Transport.ReplyToAddress";
    pub const ORIGINATING_ENDPOINT: &str = "Transport.OriginatingEndpoint";
    pub const MESSAGE_INTENT: &str = "Transport.MessageIntent";
    pub const TIME_TO_BE_RECEIVED: &str = "Transport.TimeToBeReceived";

    pub const FAULTS_EXCEPTION_MESSAGE: &str = "Faults.ExceptionMessage";
    pub const FAULTS_FAILED_QUEUE: &str = "Faults.FailedQueue";
    pub const FAULTS_TIME_OF_FAILURE: &str = "Faults.TimeOfFailure";

    pub const DELAYED_DELIVERY_DESTINATION: &str = "DelayedDelivery.Destination";
    pub const DELAYED_DELIVERY_DUE: &str = "DelayedDelivery.Due";
}

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated storage queue name
///
/// Queue names are 3-63 characters of lowercase letters, digits and single
/// hyphens, starting with a letter or digit and not ending with a hyphen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.len() < 3 || name.len() > 63 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: format!("'{}' must be 3-63 characters", name),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: format!(
                    "'{}' may only contain lowercase letters, digits and hyphens",
                    name
                ),
            });
        }

        if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: format!(
                    "'{}' has a leading, trailing or consecutive hyphen",
                    name
                ),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for QueueName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

/// Unique identifier of a logical message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

// ============================================================================
// Raw Messages
// ============================================================================

/// A message exactly as the queue service returned it from a receive call
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Service-assigned identifier
    pub message_id: String,
    /// Pop receipt proving ownership of the current visibility window
    pub pop_receipt: String,
    /// Number of times the service handed this message out
    pub dequeue_count: u32,
    /// When the message becomes visible to other consumers again
    pub next_visible_on: DateTime<Utc>,
    pub body: Bytes,
}

// ============================================================================
// Envelopes
// ============================================================================

/// What the sender intended the message to be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageIntent {
    #[default]
    Send,
    Publish,
    Subscribe,
    Unsubscribe,
    Reply,
}

impl fmt::Display for MessageIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Send => "Send",
            Self::Publish => "Publish",
            Self::Subscribe => "Subscribe",
            Self::Unsubscribe => "Unsubscribe",
            Self::Reply => "Reply",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for MessageIntent {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Send" => Ok(Self::Send),
            "Publish" => Ok(Self::Publish),
            "Subscribe" => Ok(Self::Subscribe),
            "Unsubscribe" => Ok(Self::Unsubscribe),
            "Reply" => Ok(Self::Reply),
            other => Err(ValidationError::InvalidFormat {
                field: "message_intent".to_string(),
                message: format!("unknown intent '{}'", other),
            }),
        }
    }
}

/// Deserialized business message. Immutable once built; the `with_*`
/// methods consume the envelope and return a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    id: MessageId,
    headers: BTreeMap<String, String>,
    body: Bytes,
    correlation_id: Option<String>,
    reply_to_address: Option<String>,
    intent: MessageIntent,
    time_to_be_received: Option<Duration>,
}

impl MessageEnvelope {
    /// Create new envelope with body
    pub fn new(id: MessageId, body: Bytes) -> Self {
        Self {
            id,
            headers: BTreeMap::new(),
            body,
            correlation_id: None,
            reply_to_address: None,
            intent: MessageIntent::default(),
            time_to_be_received: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Merge headers, later values replacing earlier ones with the same key
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to_address(mut self, address: impl Into<String>) -> Self {
        self.reply_to_address = Some(address.into());
        self
    }

    pub fn with_intent(mut self, intent: MessageIntent) -> Self {
        self.intent = intent;
        self
    }

    pub fn with_time_to_be_received(mut self, ttl: Duration) -> Self {
        self.time_to_be_received = Some(ttl);
        self
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn reply_to_address(&self) -> Option<&str> {
        self.reply_to_address.as_deref()
    }

    pub fn intent(&self) -> MessageIntent {
        self.intent
    }

    pub fn time_to_be_received(&self) -> Option<Duration> {
        self.time_to_be_received
    }
}

/// A message handed to the dispatcher for sending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub message_id: MessageId,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl OutgoingMessage {
    pub fn new(message_id: MessageId, body: Bytes) -> Self {
        Self {
            message_id,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
