//! Common test utilities for queue-transport integration tests
//!
//! This module provides:
//! - A scriptable message processor recording what the pipeline saw
//! - Settings tuned for fast polling
//! - Helpers for building transports over in-memory accounts

use async_trait::async_trait;
use bytes::Bytes;
use queue_transport::lease::fault_headers;
use queue_transport::{
    CircuitBreakerSettings, CriticalError, DelayedDeliverySettings, EnvelopeSerializer,
    ErrorContext, ErrorHandleResult, InMemoryDelayedStore, InMemoryLeaseClient,
    InMemoryQueueService, JsonEnvelopeSerializer, MessageContext, MessageEnvelope, MessageId,
    MessageProcessor, OutgoingMessage, QueueName, TransactionMode, TransportDependencies,
    TransportInfrastructure, TransportOperation, TransportSettings,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Scriptable Processor
// ============================================================================

/// What the processor does when its error callback runs
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
pub enum ErrorDecision {
    Retry,
    /// Copy the message to the error queue with fault headers, then handle it
    SendToErrorQueue,
}

/// Processor failing the first `failures` deliveries of every message
#[allow(dead_code)]
pub struct ScriptedProcessor {
    failures: u32,
    decision: ErrorDecision,
    attempts: AtomicU32,
    errors: AtomicU32,
    processed: Mutex<Vec<MessageEnvelope>>,
    delivery_counts: Mutex<Vec<u32>>,
}

#[allow(dead_code)]
impl ScriptedProcessor {
    pub fn succeeding() -> Self {
        Self::failing(0, ErrorDecision::Retry)
    }

    pub fn failing(failures: u32, decision: ErrorDecision) -> Self {
        Self {
            failures,
            decision,
            attempts: AtomicU32::new(0),
            errors: AtomicU32::new(0),
            processed: Mutex::new(Vec::new()),
            delivery_counts: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u32 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> Vec<MessageEnvelope> {
        self.processed.lock().unwrap().clone()
    }

    pub fn processed_bodies(&self) -> Vec<Bytes> {
        self.processed()
            .iter()
            .map(|envelope| envelope.body().clone())
            .collect()
    }

    pub fn delivery_counts(&self) -> Vec<u32> {
        self.delivery_counts.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageProcessor for ScriptedProcessor {
    async fn on_message(&self, context: MessageContext) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.delivery_counts
            .lock()
            .unwrap()
            .push(context.delivery_count);

        if context.delivery_count <= self.failures {
            anyhow::bail!("attempt {} rejected", context.delivery_count);
        }

        self.processed.lock().unwrap().push(context.envelope);
        Ok(())
    }

    async fn on_error(&self, context: ErrorContext<'_>) -> anyhow::Result<ErrorHandleResult> {
        self.errors.fetch_add(1, Ordering::SeqCst);
        match self.decision {
            ErrorDecision::Retry => Ok(ErrorHandleResult::RetryRequired),
            ErrorDecision::SendToErrorQueue => {
                let headers = fault_headers(&queue("sales"), context.error);
                context.send_to_error_queue(headers).await?;
                Ok(ErrorHandleResult::Handled)
            }
        }
    }
}

// ============================================================================
// Critical Error Recorder
// ============================================================================

/// Critical error callback that keeps every message it was raised with
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct CriticalErrors {
    raised: Arc<Mutex<Vec<String>>>,
}

#[allow(dead_code)]
impl CriticalErrors {
    pub fn callback(&self) -> CriticalError {
        let raised = Arc::clone(&self.raised);
        CriticalError::new(move |message, _| raised.lock().unwrap().push(message.to_string()))
    }

    pub fn raised(&self) -> Vec<String> {
        self.raised.lock().unwrap().clone()
    }
}

// ============================================================================
// Transport Builders
// ============================================================================

pub fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

/// Settings with short poll intervals and visibility timeouts
#[allow(dead_code)]
pub fn fast_settings(mode: TransactionMode) -> TransportSettings {
    TransportSettings {
        input_queue: "sales".to_string(),
        error_queue: "error".to_string(),
        transaction_mode: mode,
        message_invisible_time_seconds: 1,
        peek_interval_ms: 10,
        max_wait_time_when_idle_ms: 100,
        shutdown_timeout_seconds: 5,
        circuit_breaker: CircuitBreakerSettings {
            time_to_wait_before_triggering_seconds: 2,
            delay_after_failure_ms: 10,
        },
        delayed_delivery: DelayedDeliverySettings {
            enabled: false,
            ..DelayedDeliverySettings::default()
        },
        ..TransportSettings::default()
    }
}

/// Fast settings with delayed delivery switched on
#[allow(dead_code)]
pub fn delayed_settings(mode: TransactionMode) -> TransportSettings {
    let mut settings = fast_settings(mode);
    settings.delayed_delivery = DelayedDeliverySettings {
        enabled: true,
        table_name: "delays".to_string(),
        batch_size: 10,
        lease_duration_seconds: 2,
        ..DelayedDeliverySettings::default()
    };
    settings
}

/// Shared in-memory storage one or more transports run against
#[derive(Clone)]
#[allow(dead_code)]
pub struct Storage {
    pub account: InMemoryQueueService,
    pub leases: InMemoryLeaseClient,
    pub delays: InMemoryDelayedStore,
}

#[allow(dead_code)]
impl Storage {
    pub fn new() -> Self {
        Self {
            account: InMemoryQueueService::new("localaccount"),
            leases: InMemoryLeaseClient::new(),
            delays: InMemoryDelayedStore::new(),
        }
    }

    pub fn dependencies(&self) -> TransportDependencies {
        TransportDependencies::new(Arc::new(self.account.clone())).with_delayed_delivery(
            Arc::new(self.leases.clone()),
            Arc::new(self.delays.clone()),
        )
    }

    /// Build, create queues, initialize and start receiving
    pub async fn start(
        &self,
        settings: TransportSettings,
        processor: Arc<dyn MessageProcessor>,
        critical: CriticalError,
        max_concurrency: u32,
    ) -> TransportInfrastructure {
        let mut transport = TransportInfrastructure::build(settings, self.dependencies()).unwrap();
        transport.create_queues().await.unwrap();
        transport.initialize(processor, critical).unwrap();
        transport.start_receive(max_concurrency).unwrap();
        transport
    }

    pub fn envelopes_in(&self, name: &str) -> Vec<MessageEnvelope> {
        self.account
            .peek_bodies(&queue(name))
            .iter()
            .map(|body| JsonEnvelopeSerializer.deserialize(body).unwrap())
            .collect()
    }
}

#[allow(dead_code)]
pub fn send_to(destination: &str, body: &'static [u8]) -> TransportOperation {
    TransportOperation::new(
        OutgoingMessage::new(MessageId::new(), Bytes::from_static(body)),
        destination,
    )
}

/// Poll `condition` until it holds or `limit` passes
#[allow(dead_code)]
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
