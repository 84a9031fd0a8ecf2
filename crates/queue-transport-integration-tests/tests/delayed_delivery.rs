//! Integration tests for native delayed delivery
//!
//! Delayed entries are due by wall-clock time, so these tests run on real
//! time with short delays. They verify:
//! - delayed messages are held back, then delivered through the input queue
//! - only the lock holder delivers when several endpoints share a table
//! - leadership moves when the holder stops
//! - undeliverable entries end up in the poison queue with their context

mod common;

use bytes::Bytes;
use common::*;
use queue_transport::{
    headers, CriticalError, DelayConstraint, TransactionMode, TransportOperation,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn delayed(destination: &str, body: &'static [u8], delay: Duration) -> TransportOperation {
    send_to(destination, body).with_delay(DelayConstraint::DelayDeliveryWith(delay))
}

#[tokio::test]
async fn test_delayed_message_is_delivered_when_due() {
    let storage = Storage::new();
    let processor = Arc::new(ScriptedProcessor::succeeding());
    let mut transport = storage
        .start(
            delayed_settings(TransactionMode::ReceiveOnly),
            processor.clone(),
            CriticalError::log_only(),
            4,
        )
        .await;

    transport
        .dispatch(vec![delayed("sales", b"later", Duration::from_millis(500))])
        .await
        .unwrap();

    assert_eq!(storage.delays.len(), 1);
    assert!(processor.processed().is_empty());

    assert!(wait_until(WAIT, || processor.processed().len() == 1).await);
    transport.stop_receive().await;

    assert_eq!(processor.processed_bodies(), vec![Bytes::from_static(b"later")]);
    assert!(storage.delays.is_empty());
}

#[tokio::test]
async fn test_shared_table_delivers_each_entry_once() {
    let storage = Storage::new();
    let first = Arc::new(ScriptedProcessor::succeeding());
    let second = Arc::new(ScriptedProcessor::succeeding());
    let mut a = storage
        .start(
            delayed_settings(TransactionMode::ReceiveOnly),
            first.clone(),
            CriticalError::log_only(),
            4,
        )
        .await;
    let mut b = storage
        .start(
            delayed_settings(TransactionMode::ReceiveOnly),
            second.clone(),
            CriticalError::log_only(),
            4,
        )
        .await;

    let operations = (0..5)
        .map(|_| delayed("sales", b"shared", Duration::from_millis(300)))
        .collect();
    a.dispatch(operations).await.unwrap();

    assert!(wait_until(WAIT, || first.processed().len() + second.processed().len() == 5).await);
    // Give a misbehaving second leader the chance to send duplicates.
    tokio::time::sleep(Duration::from_secs(1)).await;
    a.stop_receive().await;
    b.stop_receive().await;

    let mut ids: Vec<String> = first
        .processed()
        .iter()
        .chain(second.processed().iter())
        .map(|envelope| envelope.id().to_string())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);
    assert!(storage.delays.is_empty());
}

#[tokio::test]
async fn test_leadership_moves_when_holder_stops() {
    let storage = Storage::new();
    let leader_processor = Arc::new(ScriptedProcessor::succeeding());
    let mut leader = storage
        .start(
            delayed_settings(TransactionMode::ReceiveOnly),
            leader_processor.clone(),
            CriticalError::log_only(),
            4,
        )
        .await;
    assert!(wait_until(WAIT, || storage.leases.holder().is_some()).await);

    let follower_processor = Arc::new(ScriptedProcessor::succeeding());
    let mut follower = storage
        .start(
            delayed_settings(TransactionMode::ReceiveOnly),
            follower_processor.clone(),
            CriticalError::log_only(),
            4,
        )
        .await;

    follower
        .dispatch(vec![delayed("sales", b"handover", Duration::from_millis(1_500))])
        .await
        .unwrap();
    leader.stop_receive().await;

    assert!(wait_until(WAIT, || follower_processor.processed().len() == 1).await);
    follower.stop_receive().await;

    assert!(leader_processor.processed().is_empty());
    assert!(storage.delays.is_empty());
}

#[tokio::test]
async fn test_undeliverable_entry_goes_to_poison_queue() {
    let storage = Storage::new();
    let mut settings = delayed_settings(TransactionMode::ReceiveOnly);
    settings.delayed_delivery.poison_queue = Some("poison".to_string());
    let mut transport = storage
        .start(
            settings,
            Arc::new(ScriptedProcessor::succeeding()),
            CriticalError::log_only(),
            4,
        )
        .await;

    transport
        .dispatch(vec![delayed("shipping", b"lost", Duration::from_millis(200))])
        .await
        .unwrap();

    assert!(wait_until(WAIT, || storage.account.message_count(&queue("poison")) == 1).await);
    transport.stop_receive().await;

    let poisoned = storage.envelopes_in("poison");
    assert_eq!(poisoned[0].body(), &Bytes::from_static(b"lost"));
    assert_eq!(
        poisoned[0].header(headers::DELAYED_DELIVERY_DESTINATION),
        Some("shipping@default")
    );
    assert!(poisoned[0].header(headers::DELAYED_DELIVERY_DUE).is_some());
    assert!(poisoned[0].header(headers::FAULTS_EXCEPTION_MESSAGE).is_some());
    assert!(storage.delays.is_empty());
}

#[tokio::test]
async fn test_at_most_once_mode_delivers_delayed_messages() {
    let storage = Storage::new();
    let processor = Arc::new(ScriptedProcessor::succeeding());
    let mut transport = storage
        .start(
            delayed_settings(TransactionMode::None),
            processor.clone(),
            CriticalError::log_only(),
            4,
        )
        .await;

    transport
        .dispatch(vec![delayed("sales", b"quick", Duration::from_millis(200))])
        .await
        .unwrap();

    assert!(wait_until(WAIT, || processor.processed().len() == 1).await);
    transport.stop_receive().await;

    assert!(storage.delays.is_empty());
}
