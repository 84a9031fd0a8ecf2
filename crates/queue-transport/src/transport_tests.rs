//! Tests for transport assembly and lifecycle

use super::*;
use crate::client::DelayedStore;
use crate::config::DelayedDeliverySettings;
use crate::dispatch::DelayConstraint;
use crate::message::{MessageId, OutgoingMessage, QueueName};
use crate::pipeline::{ErrorContext, ErrorHandleResult, MessageContext};
use crate::providers::memory::{InMemoryDelayedStore, InMemoryLeaseClient, InMemoryQueueService};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct RecordingProcessor {
    bodies: Mutex<Vec<Bytes>>,
}

#[async_trait]
impl MessageProcessor for RecordingProcessor {
    async fn on_message(&self, context: MessageContext) -> anyhow::Result<()> {
        self.bodies
            .lock()
            .unwrap()
            .push(context.envelope.body().clone());
        Ok(())
    }

    async fn on_error(&self, _context: ErrorContext<'_>) -> anyhow::Result<ErrorHandleResult> {
        Ok(ErrorHandleResult::RetryRequired)
    }
}

fn settings() -> TransportSettings {
    TransportSettings {
        input_queue: "sales".to_string(),
        error_queue: "error".to_string(),
        ..TransportSettings::default()
    }
}

fn without_delays() -> TransportSettings {
    TransportSettings {
        delayed_delivery: DelayedDeliverySettings {
            enabled: false,
            ..DelayedDeliverySettings::default()
        },
        ..settings()
    }
}

fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

#[test]
fn test_build_rejects_invalid_settings() {
    let service = InMemoryQueueService::new("account");
    let invalid = TransportSettings {
        message_invisible_time_seconds: 0,
        ..without_delays()
    };

    let result = TransportInfrastructure::build(invalid, TransportDependencies::new(Arc::new(service)));

    assert!(matches!(result, Err(TransportError::Configuration(_))));
}

#[test]
fn test_build_requires_delayed_collaborators_when_enabled() {
    let service = InMemoryQueueService::new("account");

    let result = TransportInfrastructure::build(settings(), TransportDependencies::new(Arc::new(service)));

    assert!(matches!(
        result,
        Err(TransportError::Configuration(ConfigurationError::Missing { .. }))
    ));
}

#[test]
fn test_build_rejects_alias_to_unknown_account() {
    let service = InMemoryQueueService::new("account");
    let mut settings = without_delays();
    settings
        .account_aliases
        .insert("billing".to_string(), "billingaccount".to_string());

    let result = TransportInfrastructure::build(settings, TransportDependencies::new(Arc::new(service)));

    assert!(result.is_err());
}

#[tokio::test]
async fn test_create_queues_creates_input_and_error() {
    let service = InMemoryQueueService::new("account");
    let transport = TransportInfrastructure::build(
        without_delays(),
        TransportDependencies::new(Arc::new(service.clone())),
    )
    .unwrap();

    transport.create_queues().await.unwrap();

    let sales = service.queue_client(&queue("sales"));
    let error = service.queue_client(&queue("error"));
    assert!(sales.exists().await.unwrap());
    assert!(error.exists().await.unwrap());
}

#[tokio::test]
async fn test_delay_without_delayed_delivery_is_rejected() {
    let service = InMemoryQueueService::new("account");
    let transport = TransportInfrastructure::build(
        without_delays(),
        TransportDependencies::new(Arc::new(service)),
    )
    .unwrap();
    transport.create_queues().await.unwrap();

    let operation = TransportOperation::new(
        OutgoingMessage::new(MessageId::new(), Bytes::from_static(b"later")),
        "sales",
    )
    .with_delay(DelayConstraint::DelayDeliveryWith(Duration::from_secs(60)));

    let result = transport.dispatch(vec![operation]).await;

    assert!(matches!(
        result,
        Err(TransportError::Configuration(
            ConfigurationError::DelayedDeliveryDisabled { .. }
        ))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_sent_message_is_received_and_processed() {
    let service = InMemoryQueueService::new("account");
    let dependencies = TransportDependencies::new(Arc::new(service.clone())).with_delayed_delivery(
        Arc::new(InMemoryLeaseClient::new()),
        Arc::new(InMemoryDelayedStore::new()),
    );
    let mut transport = TransportInfrastructure::build(settings(), dependencies).unwrap();
    transport.create_queues().await.unwrap();

    let processor = Arc::new(RecordingProcessor::default());
    transport
        .initialize(processor.clone(), CriticalError::log_only())
        .unwrap();
    transport.start_receive(4).unwrap();

    transport
        .dispatch(vec![TransportOperation::new(
            OutgoingMessage::new(MessageId::new(), Bytes::from_static(b"hello")),
            "sales",
        )])
        .await
        .unwrap();

    for _ in 0..1_000 {
        if !processor.bodies.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    transport.stop_receive().await;

    assert_eq!(
        *processor.bodies.lock().unwrap(),
        vec![Bytes::from_static(b"hello")]
    );
    assert_eq!(service.message_count(&queue("sales")), 0);
}

#[tokio::test]
async fn test_create_queues_prepares_delayed_table_when_enabled() {
    let service = InMemoryQueueService::new("account");
    let store = InMemoryDelayedStore::new();
    let dependencies = TransportDependencies::new(Arc::new(service)).with_delayed_delivery(
        Arc::new(InMemoryLeaseClient::new()),
        Arc::new(store.clone()),
    );
    let transport = TransportInfrastructure::build(settings(), dependencies).unwrap();

    transport.create_queues().await.unwrap();

    assert!(store.query_due_before(chrono::Utc::now(), 1).await.is_ok());
}
