//! In-memory storage provider implementation for testing and development.
//!
//! This module provides in-process versions of every collaborator the
//! transport needs:
//! - Queues with visibility timeouts, pop receipts, dequeue counts, message
//!   TTL and the 64 KiB message size limit
//! - A lease over a shared resource for leader election
//! - A delayed-message table ordered by due time
//!
//! Timing uses `tokio::time::Instant`, so tests running with paused time
//! observe visibility and lease expiry deterministically.
//!
//! This provider is intended for:
//! - Unit testing of transport components
//! - Development with the host binary
//! - Reference implementation for cloud bindings

use crate::client::{DelayedStore, LeaseClient, LeaseId, QueueClient, QueueService};
use crate::delayed::DelayedEntry;
use crate::error::ProviderError;
use crate::message::{QueueName, RawMessage};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Largest message body a storage queue accepts
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock cannot leave the maps half-updated.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn injected_failure(operation: &str) -> ProviderError {
    ProviderError::ConnectionFailed {
        message: format!("injected {} failure", operation),
    }
}

// ============================================================================
// Queues
// ============================================================================

/// A message stored in a queue with its delivery metadata
#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: Bytes,
    dequeue_count: u32,
    pop_receipt: Option<String>,
    visible_at: Instant,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
}

/// Call counters, for asserting what the transport did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCallCounts {
    pub receives: u64,
    pub deletes: u64,
    pub visibility_updates: u64,
    pub sends: u64,
}

#[derive(Default)]
struct AccountState {
    queues: HashMap<QueueName, QueueState>,
    counts: HashMap<QueueName, QueueCallCounts>,
    failing_receives: u32,
    failing_sends: HashMap<QueueName, u32>,
}

/// In-memory storage account
#[derive(Clone)]
pub struct InMemoryQueueService {
    account_name: String,
    state: Arc<Mutex<AccountState>>,
    max_message_size: usize,
}

impl InMemoryQueueService {
    /// Create an empty account
    pub fn new(account_name: impl Into<String>) -> Self {
        Self {
            account_name: account_name.into(),
            state: Arc::new(Mutex::new(AccountState::default())),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Override the size limit, mostly to exercise size fallbacks cheaply
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Create a queue directly
    pub fn create_queue(&self, queue: &QueueName) {
        lock(&self.state).queues.entry(queue.clone()).or_default();
    }

    /// Number of live messages, visible or not
    pub fn message_count(&self, queue: &QueueName) -> usize {
        let now = Instant::now();
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.messages.iter().filter(|m| !m.is_expired(now)).count())
            .unwrap_or(0)
    }

    /// Bodies of all live messages in enqueue order, without receiving them
    pub fn peek_bodies(&self, queue: &QueueName) -> Vec<Bytes> {
        let now = Instant::now();
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| {
                q.messages
                    .iter()
                    .filter(|m| !m.is_expired(now))
                    .map(|m| m.body.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn call_counts(&self, queue: &QueueName) -> QueueCallCounts {
        lock(&self.state)
            .counts
            .get(queue)
            .copied()
            .unwrap_or_default()
    }

    /// Make the next `count` receive calls on any queue fail
    pub fn fail_next_receives(&self, count: u32) {
        lock(&self.state).failing_receives = count;
    }

    /// Make the next `count` sends to `queue` fail
    pub fn fail_next_sends(&self, queue: &QueueName, count: u32) {
        lock(&self.state).failing_sends.insert(queue.clone(), count);
    }
}

impl QueueService for InMemoryQueueService {
    fn account_name(&self) -> &str {
        &self.account_name
    }

    fn queue_client(&self, queue: &QueueName) -> Arc<dyn QueueClient> {
        Arc::new(InMemoryQueueClient {
            name: queue.clone(),
            state: Arc::clone(&self.state),
            max_message_size: self.max_message_size,
        })
    }
}

/// Client for one queue of an [`InMemoryQueueService`]
pub struct InMemoryQueueClient {
    name: QueueName,
    state: Arc<Mutex<AccountState>>,
    max_message_size: usize,
}

impl InMemoryQueueClient {
    fn not_found(&self) -> ProviderError {
        ProviderError::NotFound {
            resource: format!("queue '{}'", self.name),
        }
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    fn name(&self) -> &QueueName {
        &self.name
    }

    async fn create_if_not_exists(&self) -> Result<(), ProviderError> {
        lock(&self.state).queues.entry(self.name.clone()).or_default();
        Ok(())
    }

    async fn exists(&self) -> Result<bool, ProviderError> {
        Ok(lock(&self.state).queues.contains_key(&self.name))
    }

    async fn receive_batch(
        &self,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<RawMessage>, ProviderError> {
        let mut state = lock(&self.state);
        state.counts.entry(self.name.clone()).or_default().receives += 1;

        if state.failing_receives > 0 {
            state.failing_receives -= 1;
            return Err(injected_failure("receive"));
        }

        let not_found = self.not_found();
        let queue = state.queues.get_mut(&self.name).ok_or(not_found)?;

        let now = Instant::now();
        queue.messages.retain(|m| !m.is_expired(now));

        let next_visible_on = Utc::now()
            + chrono::Duration::from_std(visibility_timeout).unwrap_or(chrono::Duration::zero());

        let received = queue
            .messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .take(max_messages as usize)
            .map(|m| {
                let pop_receipt = uuid::Uuid::new_v4().to_string();
                m.dequeue_count += 1;
                m.pop_receipt = Some(pop_receipt.clone());
                m.visible_at = now + visibility_timeout;

                RawMessage {
                    message_id: m.message_id.clone(),
                    pop_receipt,
                    dequeue_count: m.dequeue_count,
                    next_visible_on,
                    body: m.body.clone(),
                }
            })
            .collect();

        Ok(received)
    }

    async fn delete(&self, message_id: &str, pop_receipt: &str) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        state.counts.entry(self.name.clone()).or_default().deletes += 1;

        let not_found = self.not_found();
        let queue = state.queues.get_mut(&self.name).ok_or(not_found)?;

        let position = queue
            .messages
            .iter()
            .position(|m| m.message_id == message_id && m.pop_receipt.as_deref() == Some(pop_receipt))
            .ok_or_else(|| ProviderError::NotFound {
                resource: format!("message '{}' with current pop receipt", message_id),
            })?;
        queue.messages.remove(position);
        Ok(())
    }

    async fn update_visibility(
        &self,
        message_id: &str,
        pop_receipt: &str,
        visibility_timeout: Duration,
    ) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        state
            .counts
            .entry(self.name.clone())
            .or_default()
            .visibility_updates += 1;

        let not_found = self.not_found();
        let queue = state.queues.get_mut(&self.name).ok_or(not_found)?;

        let message = queue
            .messages
            .iter_mut()
            .find(|m| m.message_id == message_id && m.pop_receipt.as_deref() == Some(pop_receipt))
            .ok_or_else(|| ProviderError::NotFound {
                resource: format!("message '{}' with current pop receipt", message_id),
            })?;
        message.visible_at = Instant::now() + visibility_timeout;
        Ok(())
    }

    async fn send(
        &self,
        body: Bytes,
        time_to_live: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        state.counts.entry(self.name.clone()).or_default().sends += 1;

        if let Some(remaining) = state.failing_sends.get_mut(&self.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(injected_failure("send"));
            }
        }

        if body.len() > self.max_message_size {
            return Err(ProviderError::MessageTooLarge {
                size: body.len(),
                max_size: self.max_message_size,
            });
        }

        let not_found = self.not_found();
        let queue = state.queues.get_mut(&self.name).ok_or(not_found)?;

        let now = Instant::now();
        queue.messages.push_back(StoredMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            body,
            dequeue_count: 0,
            pop_receipt: None,
            visible_at: now,
            expires_at: time_to_live.map(|ttl| now + ttl),
        });
        Ok(())
    }
}

// ============================================================================
// Leases
// ============================================================================

struct HeldLease {
    lease_id: LeaseId,
    duration: Duration,
    expires_at: Instant,
}

#[derive(Default)]
struct LeaseState {
    resource_exists: bool,
    ensure_calls: u32,
    holder: Option<HeldLease>,
    failing_calls: u32,
}

/// In-memory lease over one shared resource. Clones share the resource, so
/// handing clones to several lock instances simulates competing processes.
#[derive(Clone, Default)]
pub struct InMemoryLeaseClient {
    state: Arc<Mutex<LeaseState>>,
}

impl InMemoryLeaseClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times the resource was ensured
    pub fn ensure_calls(&self) -> u32 {
        lock(&self.state).ensure_calls
    }

    /// Current unexpired holder, if any
    pub fn holder(&self) -> Option<LeaseId> {
        let now = Instant::now();
        lock(&self.state)
            .holder
            .as_ref()
            .filter(|held| held.expires_at > now)
            .map(|held| held.lease_id.clone())
    }

    /// Drop the current lease as if it had been broken by an operator
    pub fn break_lease(&self) {
        lock(&self.state).holder = None;
    }

    /// Make the next `count` lease calls fail with a transport error
    pub fn fail_next_calls(&self, count: u32) {
        lock(&self.state).failing_calls = count;
    }

    fn check_call(state: &mut LeaseState, operation: &str) -> Result<(), ProviderError> {
        if state.failing_calls > 0 {
            state.failing_calls -= 1;
            return Err(injected_failure(operation));
        }
        if !state.resource_exists {
            return Err(ProviderError::NotFound {
                resource: "lease blob".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseClient for InMemoryLeaseClient {
    async fn ensure_resource(&self) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        state.ensure_calls += 1;
        state.resource_exists = true;
        Ok(())
    }

    async fn acquire(&self, duration: Duration) -> Result<LeaseId, ProviderError> {
        let mut state = lock(&self.state);
        Self::check_call(&mut state, "acquire")?;

        let now = Instant::now();
        if let Some(held) = &state.holder {
            if held.expires_at > now {
                return Err(ProviderError::Conflict {
                    message: format!("lease '{}' is active", held.lease_id),
                });
            }
        }

        let lease_id = LeaseId(uuid::Uuid::new_v4().to_string());
        state.holder = Some(HeldLease {
            lease_id: lease_id.clone(),
            duration,
            expires_at: now + duration,
        });
        Ok(lease_id)
    }

    async fn renew(&self, lease_id: &LeaseId) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        Self::check_call(&mut state, "renew")?;

        match state.holder.as_mut() {
            // An expired lease can still be renewed by its holder until
            // someone else acquires it.
            Some(held) if &held.lease_id == lease_id => {
                held.expires_at = Instant::now() + held.duration;
                Ok(())
            }
            _ => Err(ProviderError::Conflict {
                message: format!("lease '{}' is not held", lease_id),
            }),
        }
    }

    async fn release(&self, lease_id: &LeaseId) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        Self::check_call(&mut state, "release")?;

        match &state.holder {
            Some(held) if &held.lease_id == lease_id => {
                state.holder = None;
                Ok(())
            }
            _ => Err(ProviderError::Conflict {
                message: format!("lease '{}' is not held", lease_id),
            }),
        }
    }
}

// ============================================================================
// Delayed store
// ============================================================================

#[derive(Default)]
struct DelayedState {
    table_exists: bool,
    entries: BTreeMap<(String, String), DelayedEntry>,
    failing_queries: u32,
    deletes: u64,
}

/// In-memory delayed-message table keyed by (partition key, row key)
#[derive(Clone, Default)]
pub struct InMemoryDelayedStore {
    state: Arc<Mutex<DelayedState>>,
}

impl InMemoryDelayedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<DelayedEntry> {
        lock(&self.state).entries.values().cloned().collect()
    }

    pub fn delete_calls(&self) -> u64 {
        lock(&self.state).deletes
    }

    /// Make the next `count` due queries fail
    pub fn fail_next_queries(&self, count: u32) {
        lock(&self.state).failing_queries = count;
    }

    fn check_table(state: &DelayedState) -> Result<(), ProviderError> {
        if state.table_exists {
            Ok(())
        } else {
            Err(ProviderError::NotFound {
                resource: "delayed delivery table".to_string(),
            })
        }
    }
}

#[async_trait]
impl DelayedStore for InMemoryDelayedStore {
    async fn ensure_exists(&self) -> Result<(), ProviderError> {
        lock(&self.state).table_exists = true;
        Ok(())
    }

    async fn insert(&self, entry: DelayedEntry) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        Self::check_table(&state)?;

        let key = (entry.partition_key.clone(), entry.row_key.clone());
        if state.entries.contains_key(&key) {
            return Err(ProviderError::Conflict {
                message: format!("entry {}/{} already exists", key.0, key.1),
            });
        }
        state.entries.insert(key, entry);
        Ok(())
    }

    async fn query_due_before(
        &self,
        now: DateTime<Utc>,
        take: usize,
    ) -> Result<Vec<DelayedEntry>, ProviderError> {
        let mut state = lock(&self.state);
        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(injected_failure("query"));
        }
        Self::check_table(&state)?;

        // Keys sort by due time, so the scan can stop at the first future entry.
        Ok(state
            .entries
            .values()
            .take_while(|entry| entry.due <= now)
            .take(take)
            .cloned()
            .collect())
    }

    async fn delete(&self, entry: &DelayedEntry) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        state.deletes += 1;
        Self::check_table(&state)?;

        let key = (entry.partition_key.clone(), entry.row_key.clone());
        state
            .entries
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound {
                resource: format!("entry {}/{}", key.0, key.1),
            })
    }
}
