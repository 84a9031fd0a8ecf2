//! # Queue Transport
//!
//! Storage queue transport for a message-oriented framework: leased receive
//! with two delivery guarantees, adaptive concurrent polling, cross-account
//! addressing and leader-elected delayed delivery.
//!
//! This library provides:
//! - Lease-bound ack / nack / error-queue handling of received messages
//! - At-least-once and at-most-once receive strategies
//! - A message pump that splits a concurrency budget into poll loops
//! - A distributed lock and a delayed delivery poller gated by it
//! - A dispatcher resolving `queue@alias` addresses to storage accounts
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all transport operations
//! - [`message`] - Queue names, raw messages and envelopes
//! - [`client`] - Storage collaborator traits
//! - [`providers`] - In-memory collaborator implementations
//! - [`pump`] and [`receive`] - The inbound path
//! - [`dispatch`] and [`delayed`] - The outbound path
//! - [`transport`] - Assembly and lifecycle

// Module declarations
pub mod addressing;
pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod delayed;
pub mod dispatch;
pub mod error;
pub mod lease;
pub mod lock;
pub mod message;
pub mod pipeline;
pub mod providers;
pub mod pump;
pub mod receive;
pub mod serialization;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use addressing::{AccountRouter, QueueAddress};
pub use backoff::BackoffStrategy;
pub use circuit_breaker::{BreakerState, RepeatedFailuresCircuitBreaker};
pub use client::{DelayedStore, LeaseClient, LeaseId, QueueClient, QueueService};
pub use config::{
    CircuitBreakerSettings, DelayedDeliverySettings, TransactionMode, TransportSettings,
};
pub use delayed::{DelayedDeliveryPoller, DelayedEntry, PollOutcome};
pub use dispatch::{DelayConstraint, DispatchConstraints, Dispatcher, TransportOperation};
pub use error::{
    ConfigurationError, ProviderError, SerializationError, TransportError, ValidationError,
};
pub use lease::{LeaseContext, MessageLease};
pub use lock::DistributedLock;
pub use message::{
    headers, MessageEnvelope, MessageId, MessageIntent, OutgoingMessage, QueueName, RawMessage,
};
pub use pipeline::{
    CriticalError, ErrorContext, ErrorHandleResult, MessageContext, MessageProcessor,
};
pub use providers::{
    InMemoryDelayedStore, InMemoryLeaseClient, InMemoryQueueClient, InMemoryQueueService,
};
pub use pump::{MessagePump, ReceiverConfiguration};
pub use receive::ReceiveStrategy;
pub use serialization::{
    EnvelopeSerializer, JsonEnvelopeSerializer, MessageUnwrapper, NativeMessageUnwrapper,
    PlainBodyUnwrapper,
};
pub use transport::{TransportDependencies, TransportInfrastructure};
