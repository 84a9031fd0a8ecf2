//! Error types for transport operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Ack or nack attempted after the visibility deadline passed. Another
    /// consumer may already own the message.
    #[error("Lease on message '{message_id}' expired; it may be processed again")]
    LeaseExpired { message_id: String },

    /// The raw body could not be unwrapped into an envelope. The raw message
    /// has already been moved to the error queue when this surfaces.
    #[error("Failed to deserialize envelope of message '{message_id}': {source}")]
    EnvelopeDeserializationFailed {
        message_id: String,
        #[source]
        source: SerializationError,
    },

    #[error("Message too large for queue '{queue_name}': {size} bytes (max: {max_size})")]
    MessageSizeExceeded {
        queue_name: String,
        size: usize,
        max_size: usize,
    },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Provider operation '{operation}' failed: {source}")]
    Provider {
        operation: String,
        #[source]
        source: ProviderError,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl TransportError {
    /// Wrap a provider failure, lifting size rejections into their own variant.
    pub fn provider(operation: &str, queue_name: &str, source: ProviderError) -> Self {
        match source {
            ProviderError::MessageTooLarge { size, max_size } => Self::MessageSizeExceeded {
                queue_name: queue_name.to_string(),
                size,
                max_size,
            },
            source => Self::Provider {
                operation: operation.to_string(),
                source,
            },
        }
    }

    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::LeaseExpired { .. } => false,
            Self::EnvelopeDeserializationFailed { .. } => false,
            Self::MessageSizeExceeded { .. } => false,
            Self::QueueNotFound { .. } => false,
            Self::Provider { source, .. } => source.is_transient(),
            Self::Serialization(_) => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }

    /// Check if error is a lease expiry
    pub fn is_lease_expired(&self) -> bool {
        matches!(self, Self::LeaseExpired { .. })
    }

    /// Check if the error (or one nested in a pipeline error) is a size rejection
    pub fn is_size_exceeded(error: &anyhow::Error) -> bool {
        error
            .chain()
            .filter_map(|cause| cause.downcast_ref::<TransportError>())
            .any(|e| matches!(e, TransportError::MessageSizeExceeded { .. }))
    }
}

/// Failures reported by the storage collaborators (queue, lease and table clients).
///
/// `Conflict` and `NotFound` carry meaning the transport acts on; everything
/// else is treated as an I/O failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Another party holds the lease or the precondition failed
    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Payload of {size} bytes exceeds provider limit of {max_size} bytes")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Request timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Service error {code}: {message}")]
    Service { code: String, message: String },
}

impl ProviderError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::NotFound { .. } => false,
            Self::MessageTooLarge { .. } => false,
            Self::Timeout { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::Service { .. } => true,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors during envelope serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Body is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,

    #[error("Envelope field '{field}' is missing or empty")]
    MissingField { field: String },

    #[error("Header '{key}' has invalid value '{value}'")]
    InvalidHeader { key: String, value: String },

    #[error("Envelope field '{field}' does not fit the wire format")]
    ValueOutOfRange { field: String },
}

/// Configuration errors. Never corrected silently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Setting '{key}' out of range: {message}")]
    OutOfRange { key: String, message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Account alias '{alias}' is not mapped to any storage account")]
    UnmappedAlias { alias: String },

    #[error("Account alias '{alias}' is mapped more than once")]
    DuplicateAlias { alias: String },

    #[error(
        "Address '{address}' contains a connection string; register the account under an alias instead"
    )]
    ConnectionStringInAddress { address: String },

    #[error("Time to live {ttl:?} exceeds the maximum of {max:?}")]
    TimeToLiveTooLong { ttl: Duration, max: Duration },

    #[error("Delayed delivery is not enabled but message '{message_id}' requested a delay")]
    DelayedDeliveryDisabled { message_id: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
