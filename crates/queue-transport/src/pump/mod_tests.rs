//! Tests for the message pump

use super::*;
use crate::client::QueueService;
use crate::message::{MessageEnvelope, MessageId, QueueName};
use crate::pipeline::{ErrorContext, ErrorHandleResult, MessageContext};
use crate::providers::memory::InMemoryQueueService;
use crate::serialization::{EnvelopeSerializer, JsonEnvelopeSerializer, NativeMessageUnwrapper};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Processor that sleeps for a fixed time and tracks concurrency
struct SlowProcessor {
    work: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: AtomicUsize,
    completed: AtomicUsize,
}

impl SlowProcessor {
    fn new(work: Duration) -> Arc<Self> {
        Arc::new(Self {
            work,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MessageProcessor for SlowProcessor {
    async fn on_message(&self, _context: MessageContext) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.work).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_error(&self, _context: ErrorContext<'_>) -> anyhow::Result<ErrorHandleResult> {
        Ok(ErrorHandleResult::RetryRequired)
    }
}

struct Fixture {
    service: InMemoryQueueService,
    input: QueueName,
    pump: MessagePump,
}

fn fixture(settings: TransportSettings) -> Fixture {
    let service = InMemoryQueueService::new("account");
    let input = QueueName::new("input".to_string()).unwrap();
    let error = QueueName::new("error".to_string()).unwrap();
    service.create_queue(&input);
    service.create_queue(&error);

    let serializer: Arc<dyn EnvelopeSerializer> = Arc::new(JsonEnvelopeSerializer);
    let lease_context = LeaseContext {
        source: service.queue_client(&input),
        error_queue: service.queue_client(&error),
        unwrapper: Arc::new(NativeMessageUnwrapper::new(Arc::clone(&serializer))),
        serializer,
        visibility_timeout: settings.message_invisible_time(),
    };

    Fixture {
        service,
        input,
        pump: MessagePump::new(lease_context, settings),
    }
}

impl Fixture {
    async fn enqueue(&self, count: usize) {
        let client = self.service.queue_client(&self.input);
        for _ in 0..count {
            let envelope = MessageEnvelope::new(MessageId::new(), Bytes::from_static(b"{}"));
            let body = JsonEnvelopeSerializer.serialize(&envelope).unwrap();
            client.send(body, None).await.unwrap();
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_start_without_initialize_fails() {
    let mut f = fixture(TransportSettings::default());

    let result = f.pump.start_receive(4);

    assert!(matches!(result, Err(TransportError::Configuration(_))));
    assert!(!f.pump.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_fails() {
    let mut f = fixture(TransportSettings::default());
    f.pump
        .initialize(SlowProcessor::new(Duration::ZERO), CriticalError::log_only());

    f.pump.start_receive(4).unwrap();
    assert!(f.pump.start_receive(4).is_err());

    f.pump.stop_receive().await;
    assert!(!f.pump.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_pump_processes_and_acks_all_messages() {
    let mut f = fixture(TransportSettings::default());
    let processor = SlowProcessor::new(Duration::from_millis(5));
    f.pump
        .initialize(processor.clone(), CriticalError::log_only());
    f.enqueue(40).await;

    f.pump.start_receive(8).unwrap();
    wait_until(|| processor.completed.load(Ordering::SeqCst) == 40).await;
    f.pump.stop_receive().await;

    assert_eq!(f.service.message_count(&f.input), 0);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_never_exceeds_max_concurrency() {
    let settings = TransportSettings {
        degree_of_receive_parallelism: Some(3),
        ..TransportSettings::default()
    };
    let mut f = fixture(settings);
    let processor = SlowProcessor::new(Duration::from_millis(100));
    f.pump
        .initialize(processor.clone(), CriticalError::log_only());
    f.enqueue(30).await;

    f.pump.start_receive(4).unwrap();
    wait_until(|| processor.completed.load(Ordering::SeqCst) == 30).await;
    f.pump.stop_receive().await;

    let max = processor.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 4, "saw {} messages in flight", max);
    assert!(max >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_messages() {
    let mut f = fixture(TransportSettings::default());
    let processor = SlowProcessor::new(Duration::from_secs(2));
    f.pump
        .initialize(processor.clone(), CriticalError::log_only());
    f.enqueue(3).await;

    f.pump.start_receive(3).unwrap();
    wait_until(|| processor.started.load(Ordering::SeqCst) == 3).await;
    f.pump.stop_receive().await;

    assert_eq!(processor.completed.load(Ordering::SeqCst), 3);
    assert_eq!(f.service.message_count(&f.input), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_gives_up_after_shutdown_timeout() {
    let settings = TransportSettings {
        shutdown_timeout_seconds: 1,
        message_invisible_time_seconds: 3_600,
        ..TransportSettings::default()
    };
    let mut f = fixture(settings);
    let processor = SlowProcessor::new(Duration::from_secs(600));
    f.pump
        .initialize(processor.clone(), CriticalError::log_only());
    f.enqueue(1).await;

    f.pump.start_receive(2).unwrap();
    wait_until(|| processor.started.load(Ordering::SeqCst) == 1).await;

    let started = tokio::time::Instant::now();
    f.pump.stop_receive().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(processor.completed.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_bounded_while_a_loop_waits_for_a_permit() {
    let settings = TransportSettings {
        shutdown_timeout_seconds: 1,
        message_invisible_time_seconds: 3_600,
        ..TransportSettings::default()
    };
    let mut f = fixture(settings);
    let processor = SlowProcessor::new(Duration::from_secs(600));
    f.pump
        .initialize(processor.clone(), CriticalError::log_only());
    f.enqueue(2).await;

    f.pump.start_receive(1).unwrap();
    wait_until(|| processor.started.load(Ordering::SeqCst) == 1).await;
    // The single loop now holds the second message and waits for the permit.
    wait_until(|| f.service.call_counts(&f.input).receives >= 2).await;

    let started = tokio::time::Instant::now();
    f.pump.stop_receive().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(processor.started.load(Ordering::SeqCst), 1);
    assert_eq!(processor.completed.load(Ordering::SeqCst), 0);
    assert_eq!(f.service.call_counts(&f.input).visibility_updates, 1);
    assert_eq!(f.service.message_count(&f.input), 2);
}

#[tokio::test(start_paused = true)]
async fn test_receive_failures_do_not_stop_the_pump() {
    let mut f = fixture(TransportSettings::default());
    let processor = SlowProcessor::new(Duration::ZERO);
    f.pump
        .initialize(processor.clone(), CriticalError::log_only());
    f.enqueue(5).await;
    f.service.fail_next_receives(3);

    f.pump.start_receive(1).unwrap();
    wait_until(|| processor.completed.load(Ordering::SeqCst) == 5).await;
    f.pump.stop_receive().await;

    assert!(f.service.call_counts(&f.input).receives >= 4);
}

#[tokio::test(start_paused = true)]
async fn test_idle_pump_backs_off_between_polls() {
    let settings = TransportSettings {
        peek_interval_ms: 100,
        max_wait_time_when_idle_ms: 1_000,
        ..TransportSettings::default()
    };
    let mut f = fixture(settings);
    f.pump
        .initialize(SlowProcessor::new(Duration::ZERO), CriticalError::log_only());

    f.pump.start_receive(1).unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    f.pump.stop_receive().await;

    // 100+200+...+1000 covers 5.5 s in 10 polls, then one poll per second.
    let receives = f.service.call_counts(&f.input).receives;
    assert!((12..=17).contains(&receives), "polled {} times", receives);
}

#[tokio::test(start_paused = true)]
async fn test_at_most_once_mode_selects_strategy() {
    let settings = TransportSettings {
        transaction_mode: crate::config::TransactionMode::None,
        ..TransportSettings::default()
    };
    let f = fixture(settings);

    assert_eq!(f.pump.strategy(), ReceiveStrategy::AtMostOnce);
}
