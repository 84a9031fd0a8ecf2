//! Collaborator traits for the storage services the transport drives.
//!
//! These are the capabilities a cloud binding has to provide: a visibility
//! timeout queue, a lease over a shared blob for leader election and a
//! table-like store with range queries for delayed messages. The
//! [`crate::providers::memory`] module implements all of them in process.

use crate::delayed::DelayedEntry;
use crate::error::ProviderError;
use crate::message::{QueueName, RawMessage};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Operations on a single storage queue
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Name of the queue this client talks to
    fn name(&self) -> &QueueName;

    /// Create the queue, succeeding if it already exists
    async fn create_if_not_exists(&self) -> Result<(), ProviderError>;

    async fn exists(&self) -> Result<bool, ProviderError>;

    /// Receive up to `max_messages`, hiding them for `visibility_timeout`
    async fn receive_batch(
        &self,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<RawMessage>, ProviderError>;

    /// Delete a received message. Fails with `NotFound` if the pop receipt
    /// no longer matches.
    async fn delete(&self, message_id: &str, pop_receipt: &str) -> Result<(), ProviderError>;

    /// Change how long a received message stays hidden
    async fn update_visibility(
        &self,
        message_id: &str,
        pop_receipt: &str,
        visibility_timeout: Duration,
    ) -> Result<(), ProviderError>;

    /// Enqueue a body, optionally expiring after `time_to_live`
    async fn send(&self, body: Bytes, time_to_live: Option<Duration>)
        -> Result<(), ProviderError>;
}

/// One storage account, handing out queue clients by name
pub trait QueueService: Send + Sync {
    /// Account name, used only for logging
    fn account_name(&self) -> &str;

    fn queue_client(&self, queue: &QueueName) -> Arc<dyn QueueClient>;
}

/// Opaque identifier of an acquired lease
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseId(pub String);

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exclusive lease over one shared resource
///
/// `acquire` and `renew` report another active holder as
/// [`ProviderError::Conflict`].
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Create the leased resource if it is missing
    async fn ensure_resource(&self) -> Result<(), ProviderError>;

    async fn acquire(&self, duration: Duration) -> Result<LeaseId, ProviderError>;

    async fn renew(&self, lease_id: &LeaseId) -> Result<(), ProviderError>;

    async fn release(&self, lease_id: &LeaseId) -> Result<(), ProviderError>;
}

/// Time-indexed store holding messages until they are due
#[async_trait]
pub trait DelayedStore: Send + Sync {
    /// Create the backing table if it is missing
    async fn ensure_exists(&self) -> Result<(), ProviderError>;

    async fn insert(&self, entry: DelayedEntry) -> Result<(), ProviderError>;

    /// Entries due at or before `now`, in ascending due order, at most `take`
    async fn query_due_before(
        &self,
        now: DateTime<Utc>,
        take: usize,
    ) -> Result<Vec<DelayedEntry>, ProviderError>;

    /// Remove an entry. Fails with `NotFound` if it is already gone.
    async fn delete(&self, entry: &DelayedEntry) -> Result<(), ProviderError>;
}
