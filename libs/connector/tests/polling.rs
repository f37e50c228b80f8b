//! Polling receiver tests
//!
//! - Fixed-delay polling never overlaps a slow poll
//! - Transacted receivers run one schedule per concurrent receiver
//! - Batches share a transaction; the worker path runs without one

mod common;

use async_trait::async_trait;
use common::*;
use connector::test_utils::{
    endpoint, CountingTransactionFactory, MockConnectorTransport, QueuePoller, StaticDescriptor,
    TestComponent,
};
use connector::{
    ConnectorConfig, ConnectorError, Endpoint, EndpointUri, ExhaustedAction, MessageReceiver,
    Poller, PollingConfig, PollingReceiver, Result, ThreadingProfile, TransactedPoller,
    TransactedPollingReceiver, Transaction, TransactionAction, TransactionConfig,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const FAST_POLLING: PollingConfig = PollingConfig {
    frequency_ms: 10,
    startup_delay_ms: 0,
};

/// Poller whose every poll takes `duration`
struct SlowPoller {
    duration: Duration,
    connect_delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    spans: Mutex<Vec<(Instant, Instant)>>,
}

impl SlowPoller {
    fn new(duration: Duration) -> Self {
        Self {
            duration,
            connect_delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            spans: Mutex::new(Vec::new()),
        }
    }

    fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }
}

#[async_trait]
impl Poller for SlowPoller {
    async fn connect(&self, _receiver: &Arc<MessageReceiver>) -> Result<()> {
        tokio::time::sleep(self.connect_delay).await;
        Ok(())
    }

    async fn poll(&self, _receiver: &Arc<MessageReceiver>) -> Result<()> {
        let started = Instant::now();
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.duration).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.spans.lock().push((started, Instant::now()));
        Ok(())
    }
}

struct FailingPoller;

#[async_trait]
impl Poller for FailingPoller {
    async fn poll(&self, _receiver: &Arc<MessageReceiver>) -> Result<()> {
        Err(ConnectorError::transport("mailbox locked"))
    }
}

/// Hands out one fixed batch; each item takes a while to process
#[derive(Default)]
struct BusyPoller {
    done: Mutex<Vec<String>>,
}

#[async_trait]
impl TransactedPoller for BusyPoller {
    type Item = String;

    async fn get_messages(&self, _receiver: &Arc<MessageReceiver>) -> Result<Vec<String>> {
        Ok(vec!["a".into(), "b".into(), "c".into()])
    }

    async fn process_message(
        &self,
        _receiver: &Arc<MessageReceiver>,
        item: String,
        _transaction: Option<Arc<dyn Transaction>>,
    ) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.done.lock().push(item);
        Ok(())
    }
}

async fn started(config: ConnectorConfig) -> Harness {
    let h = harness(
        StaticDescriptor::new("test"),
        MockConnectorTransport::new("test"),
        config,
    );
    h.connector.initialise().await.unwrap();
    h.connector.start().await.unwrap();
    h
}

fn transacted_endpoint(factory: &Arc<CountingTransactionFactory>) -> Arc<Endpoint> {
    Endpoint::builder(EndpointUri::new("test", "jobs"))
        .transaction(TransactionConfig::new(
            factory.clone(),
            TransactionAction::BeginOrJoin,
        ))
        .build()
}

type QueueReceiver = PollingReceiver<TransactedPollingReceiver<QueuePoller>>;

fn queue_receiver(
    h: &Harness,
    endpoint: Arc<Endpoint>,
    use_multiple_receivers: bool,
) -> (Arc<MessageReceiver>, Arc<QueueReceiver>) {
    let polling = Arc::new(PollingReceiver::new(
        TransactedPollingReceiver::new(QueuePoller::new(), &endpoint, use_multiple_receivers),
        &FAST_POLLING,
    ));
    let receiver = MessageReceiver::new(
        &h.connector,
        Arc::new(TestComponent::new("jobs")),
        endpoint,
        polling.clone(),
    );
    (receiver, polling)
}

fn three_receivers() -> ConnectorConfig {
    ConnectorConfig {
        number_of_concurrent_transacted_receivers: 3,
        ..ConnectorConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_polls_never_overlap() {
    let h = started(ConnectorConfig::default()).await;
    let polling = Arc::new(PollingReceiver::new(
        SlowPoller::new(Duration::from_millis(30)),
        &FAST_POLLING,
    ));
    let receiver = MessageReceiver::new(
        &h.connector,
        Arc::new(TestComponent::new("slow")),
        endpoint("slow.in"),
        polling.clone(),
    );

    receiver.start().await.unwrap();
    assert_eq!(polling.schedule_count(), 1);
    tokio::time::sleep(Duration::from_millis(250)).await;
    receiver.stop().await.unwrap();

    let poller = polling.poller();
    assert_eq!(poller.max_active.load(Ordering::SeqCst), 1);
    let spans = poller.spans.lock().clone();
    assert!(spans.len() >= 3, "only {} polls ran", spans.len());
    for pair in spans.windows(2) {
        let (_, previous_end) = pair[0];
        let (next_start, _) = pair[1];
        assert!(next_start >= previous_end + Duration::from_millis(10));
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_schedules() {
    let h = started(ConnectorConfig::default()).await;
    let polling = Arc::new(PollingReceiver::new(
        SlowPoller::new(Duration::from_millis(1)),
        &FAST_POLLING,
    ));
    let receiver = MessageReceiver::new(
        &h.connector,
        Arc::new(TestComponent::new("ticker")),
        endpoint("ticker.in"),
        polling.clone(),
    );

    receiver.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    receiver.stop().await.unwrap();
    assert_eq!(polling.schedule_count(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let polls = polling.poller().spans.lock().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(polling.poller().spans.lock().len(), polls);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_slow_start_leaves_receiver_stopped() {
    let h = started(ConnectorConfig::default()).await;
    let polling = Arc::new(PollingReceiver::new(
        SlowPoller::new(Duration::from_millis(30)).with_connect_delay(Duration::from_millis(50)),
        &FAST_POLLING,
    ));
    let receiver = MessageReceiver::new(
        &h.connector,
        Arc::new(TestComponent::new("race")),
        endpoint("race.in"),
        polling.clone(),
    );

    let starting = tokio::spawn({
        let receiver = receiver.clone();
        async move { receiver.start().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let stopping = tokio::spawn({
        let receiver = receiver.clone();
        async move { receiver.stop().await }
    });
    starting.await.unwrap().unwrap();
    stopping.await.unwrap().unwrap();

    assert!(receiver.is_stopped());
    assert!(!receiver.is_connected());
    assert_eq!(polling.schedule_count(), 0);

    receiver.start().await.unwrap();
    assert_eq!(polling.schedule_count(), 1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    receiver.stop().await.unwrap();
    assert_eq!(polling.poller().max_active.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn test_poll_failures_reach_exception_listener() {
    let h = started(ConnectorConfig::default()).await;
    let polling = Arc::new(PollingReceiver::new(FailingPoller, &FAST_POLLING));
    let receiver = MessageReceiver::new(
        &h.connector,
        Arc::new(TestComponent::new("mail")),
        endpoint("mail.in"),
        polling,
    );

    receiver.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || h.exceptions.count() >= 2).await);
    receiver.stop().await.unwrap();

    assert!(h.exceptions.errors()[0].contains("mailbox locked"));
    assert!(receiver.is_stopped());
}

#[tokio::test]
async fn test_transacted_receiver_runs_one_schedule_per_receiver() {
    let h = started(three_receivers()).await;
    let transactions = Arc::new(CountingTransactionFactory::new());
    let (receiver, polling) = queue_receiver(&h, transacted_endpoint(&transactions), true);

    receiver.start().await.unwrap();
    assert_eq!(polling.schedule_count(), 3);

    receiver.stop().await.unwrap();
    assert_eq!(polling.schedule_count(), 0);
}

#[tokio::test]
async fn test_single_schedule_without_multiple_receivers() {
    let transactions = Arc::new(CountingTransactionFactory::new());

    let h = started(three_receivers()).await;
    let (receiver, polling) = queue_receiver(&h, transacted_endpoint(&transactions), false);
    receiver.start().await.unwrap();
    assert_eq!(polling.schedule_count(), 1);
    receiver.stop().await.unwrap();

    // no transaction factory
    let (receiver, polling) = queue_receiver(&h, endpoint("plain"), true);
    receiver.start().await.unwrap();
    assert_eq!(polling.schedule_count(), 1);
    receiver.stop().await.unwrap();

    // multiple receivers switched off for the whole connector
    let h = started(ConnectorConfig {
        create_multiple_transacted_receivers: false,
        ..three_receivers()
    })
    .await;
    let (receiver, polling) = queue_receiver(&h, transacted_endpoint(&transactions), true);
    receiver.start().await.unwrap();
    assert_eq!(polling.schedule_count(), 1);
    receiver.stop().await.unwrap();

    // receiver threading off
    let h = started(ConnectorConfig {
        receiver_threading: ThreadingProfile {
            do_threading: false,
            ..ThreadingProfile::default()
        },
        ..three_receivers()
    })
    .await;
    let (receiver, polling) = queue_receiver(&h, transacted_endpoint(&transactions), true);
    receiver.start().await.unwrap();
    assert_eq!(polling.schedule_count(), 1);
    receiver.stop().await.unwrap();
}

#[tokio::test]
async fn test_transacted_batch_shares_one_transaction() {
    let h = started(three_receivers()).await;
    let transactions = Arc::new(CountingTransactionFactory::new());
    let (receiver, polling) = queue_receiver(&h, transacted_endpoint(&transactions), true);
    let queue = polling.poller().inner().clone();
    for item in ["a", "b", "c"] {
        queue.push(item);
    }

    receiver.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || queue.processed().len() == 3).await);
    receiver.stop().await.unwrap();

    let processed = queue.processed();
    let tx_id = processed[0].1.clone();
    assert!(tx_id.is_some());
    assert!(processed.iter().all(|(_, id)| *id == tx_id));
    assert_eq!(transactions.begun(), 1);
    assert_eq!(transactions.committed(), 1);
}

#[tokio::test]
async fn test_untransacted_poll_uses_workers() {
    let h = started(ConnectorConfig::default()).await;
    let (receiver, polling) = queue_receiver(&h, endpoint("plain"), true);
    let queue = polling.poller().inner().clone();
    assert!(!polling.poller().receive_messages_in_transaction());
    queue.push("x");
    queue.push("y");

    receiver.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || queue.processed().len() == 2).await);
    receiver.stop().await.unwrap();

    let mut items: Vec<String> = queue
        .processed()
        .into_iter()
        .map(|(item, tx)| {
            assert!(tx.is_none());
            item
        })
        .collect();
    items.sort();
    assert_eq!(items, vec!["x", "y"]);
    assert_eq!(h.exceptions.count(), 0);
}

#[tokio::test]
async fn test_rejected_worker_waits_for_scheduled_ones() {
    let h = started(ConnectorConfig {
        receiver_threading: ThreadingProfile {
            max_threads_active: 1,
            exhausted_action: ExhaustedAction::Abort,
            ..ThreadingProfile::default()
        },
        ..ConnectorConfig::default()
    })
    .await;
    let endpoint = endpoint("busy");
    let polling = Arc::new(PollingReceiver::new(
        TransactedPollingReceiver::new(BusyPoller::default(), &endpoint, true),
        &FAST_POLLING,
    ));
    let receiver = MessageReceiver::new(
        &h.connector,
        Arc::new(TestComponent::new("busy")),
        endpoint,
        polling.clone(),
    );
    let poller = polling.poller();

    let err = poller.poll(&receiver).await.unwrap_err();
    assert!(matches!(err, ConnectorError::WorkRejected { .. }));
    // the first worker finished before the poll returned, nothing else ran
    assert_eq!(*poller.inner().done.lock(), vec!["a".to_string()]);
}
