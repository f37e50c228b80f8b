//! Outbound path tests
//!
//! - Pool validation on return and eviction of broken dispatchers
//! - Rollback-only transactions short-circuit send
//! - Security rejection, failed sends, threaded dispatch
//! - Receive and request with timeouts

mod common;

use common::*;
use connector::message::REMOTE_SYNC_PROPERTY;
use connector::test_utils::{
    endpoint, CountingTransactionFactory, DenyAllSecurityFilter, MockConnectorTransport,
    MockDispatcherFactory, MockRequesterFactory, StaticDescriptor,
};
use connector::{
    ConnectorConfig, ConnectorError, Endpoint, EndpointUri, Event, Message, NotificationAction,
    ThreadingProfile, TransactionFactory,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn dispatch_harness(factory: &Arc<MockDispatcherFactory>, config: ConnectorConfig) -> Harness {
    harness(
        StaticDescriptor::new("test").with_dispatcher_factory(factory.clone()),
        MockConnectorTransport::new("test"),
        config,
    )
}

fn inline_dispatch_config() -> ConnectorConfig {
    ConnectorConfig {
        dispatcher_threading: ThreadingProfile {
            do_threading: false,
            ..ThreadingProfile::default()
        },
        ..ConnectorConfig::default()
    }
}

#[tokio::test]
async fn test_pool_validates_on_return_only() {
    let factory = Arc::new(MockDispatcherFactory::new());
    let stats = factory.stats();
    let h = dispatch_harness(&factory, ConnectorConfig::default());
    let connector = &h.connector;
    connector.initialise().await.unwrap();
    let ep = endpoint("orders.out");
    let pool = connector.dispatchers().unwrap();

    let dispatcher = connector.dispatcher(&ep).await.unwrap();
    assert_eq!(stats.validations.load(Ordering::SeqCst), 0);
    assert_eq!(pool.num_active(&ep), 1);

    connector.return_dispatcher(&ep, dispatcher).await;
    assert_eq!(stats.validations.load(Ordering::SeqCst), 1);
    assert_eq!(pool.num_idle(&ep), 1);
    assert_eq!(pool.num_active(&ep), 0);

    // the idle one is handed out again without a check
    stats.broken.store(true, Ordering::SeqCst);
    let dispatcher = connector.dispatcher(&ep).await.unwrap();
    assert_eq!(stats.validations.load(Ordering::SeqCst), 1);
    assert_eq!(stats.created.load(Ordering::SeqCst), 1);

    // and evicted on its way back
    connector.return_dispatcher(&ep, dispatcher).await;
    assert_eq!(stats.validations.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().evicted.load(Ordering::Relaxed), 1);
    assert_eq!(stats.disposed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.num_idle(&ep), 0);

    stats.broken.store(false, Ordering::SeqCst);
    let dispatcher = connector.dispatcher(&ep).await.unwrap();
    assert_eq!(stats.created.load(Ordering::SeqCst), 2);
    assert!(!dispatcher.is_disposed());
}

#[tokio::test]
async fn test_per_request_dispatchers_are_never_reused() {
    let factory = Arc::new(MockDispatcherFactory::new().per_request());
    let stats = factory.stats();
    let h = dispatch_harness(&factory, inline_dispatch_config());
    h.connector.initialise().await.unwrap();
    let ep = endpoint("once");

    for _ in 0..3 {
        let event = Event::new(Arc::new(Message::new("ping")), ep.clone());
        h.connector.send(event).await.unwrap();
    }

    assert_eq!(stats.created.load(Ordering::SeqCst), 3);
    assert_eq!(stats.disposed.load(Ordering::SeqCst), 3);
    assert_eq!(h.connector.dispatchers().unwrap().num_idle(&ep), 0);
}

#[tokio::test]
async fn test_rollback_only_send_returns_message_unsent() {
    let factory = Arc::new(MockDispatcherFactory::new());
    let stats = factory.stats();
    let h = dispatch_harness(&factory, ConnectorConfig::default());
    h.connector.initialise().await.unwrap();

    let transactions = CountingTransactionFactory::new();
    let tx = transactions.begin().await.unwrap();
    tx.set_rollback_only();

    let message = Arc::new(Message::new("order-17"));
    let event = Event::new(message.clone(), endpoint("orders.out")).with_transaction(Some(tx));
    let returned = h.connector.send(event).await.unwrap().unwrap();

    assert!(Arc::ptr_eq(&returned, &message));
    assert_eq!(stats.sent.load(Ordering::SeqCst), 0);
    assert_eq!(stats.connects.load(Ordering::SeqCst), 0);
    assert_eq!(h.connector.metrics().sent.load(Ordering::Relaxed), 0);
    assert!(!h.connector.is_connected());
}

#[tokio::test]
async fn test_send_connects_and_strips_remote_sync() {
    let factory = Arc::new(MockDispatcherFactory::new());
    let stats = factory.stats();
    let h = dispatch_harness(&factory, ConnectorConfig::default());
    h.connector.initialise().await.unwrap();

    let event = Event::new(Arc::new(Message::new("ping")), endpoint("echo"));
    let reply = h.connector.send(event).await.unwrap().unwrap();

    assert_eq!(reply.payload().as_text(), Some("ping"));
    assert!(reply.property(REMOTE_SYNC_PROPERTY).is_none());
    assert!(h.connector.is_connected());
    assert_eq!(stats.connects.load(Ordering::SeqCst), 1);
    assert_eq!(h.connector.metrics().sent.load(Ordering::Relaxed), 1);
    assert_eq!(h.notifications.count(NotificationAction::ConnectionConnected), 1);
}

#[tokio::test]
async fn test_security_rejection_drops_dispatch() {
    let factory = Arc::new(MockDispatcherFactory::new());
    let stats = factory.stats();
    let h = dispatch_harness(&factory, ConnectorConfig::default());
    h.connector.initialise().await.unwrap();

    let guarded = Endpoint::builder(EndpointUri::new("test", "guarded"))
        .security_filter(Arc::new(DenyAllSecurityFilter))
        .build();
    let event = Event::new(Arc::new(Message::new("secret")), guarded);
    let handle = h.connector.dispatch(event).await.unwrap();

    assert!(!handle.is_scheduled());
    assert_eq!(stats.dispatched.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.notifications
            .count(NotificationAction::SecurityAuthenticationFailed),
        1
    );
    assert_eq!(h.exceptions.count(), 1);
    assert!(h.exceptions.errors()[0].contains("no credentials"));
}

#[tokio::test]
async fn test_failed_send_disposes_dispatcher() {
    let factory = Arc::new(MockDispatcherFactory::new());
    let stats = factory.stats();
    let h = dispatch_harness(&factory, ConnectorConfig::default());
    h.connector.initialise().await.unwrap();
    let ep = endpoint("flaky.out");
    stats.fail_sends.store(true, Ordering::SeqCst);

    let event = Event::new(Arc::new(Message::new("ping")), ep.clone());
    let err = h.connector.send(event).await.unwrap_err();

    assert!(matches!(err, ConnectorError::Dispatch { .. }));
    assert_eq!(stats.disposed.load(Ordering::SeqCst), 1);
    let pool = h.connector.dispatchers().unwrap();
    assert_eq!(pool.num_idle(&ep), 0);
    assert_eq!(pool.stats().evicted.load(Ordering::Relaxed), 1);

    // a fresh dispatcher serves the next send
    stats.fail_sends.store(false, Ordering::SeqCst);
    let event = Event::new(Arc::new(Message::new("again")), ep.clone());
    assert!(h.connector.send(event).await.unwrap().is_some());
    assert_eq!(stats.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_async_dispatch_runs_on_work_manager() {
    let factory = Arc::new(MockDispatcherFactory::new());
    let stats = factory.stats();
    let h = dispatch_harness(&factory, ConnectorConfig::default());
    h.connector.initialise().await.unwrap();

    let message = Arc::new(Message::new("event"));
    let handle = h
        .connector
        .dispatch(Event::new(message.clone(), endpoint("events")))
        .await
        .unwrap();
    assert!(handle.is_scheduled());
    handle.join().await;

    assert_eq!(stats.dispatched.load(Ordering::SeqCst), 1);
    assert_eq!(h.connector.metrics().dispatched.load(Ordering::Relaxed), 1);
    assert_eq!(h.exceptions.count(), 0);
    // the worker handed the dispatcher back when it was done
    let pool = h.connector.dispatchers().unwrap();
    assert_eq!(pool.num_active(&endpoint("events")), 0);
    assert_eq!(pool.num_idle(&endpoint("events")), 1);
}

#[tokio::test]
async fn test_failed_threaded_dispatch_never_reaches_next_borrower() {
    let factory = Arc::new(MockDispatcherFactory::new());
    let stats = factory.stats();
    let h = dispatch_harness(&factory, ConnectorConfig::default());
    h.connector.initialise().await.unwrap();
    let ep = endpoint("refused.out");
    stats.fail_dispatches.store(true, Ordering::SeqCst);

    let handle = h
        .connector
        .dispatch(Event::new(Arc::new(Message::new("event")), ep.clone()))
        .await
        .unwrap();
    assert!(handle.is_scheduled());
    handle.join().await;

    assert_eq!(stats.disposed.load(Ordering::SeqCst), 1);
    assert_eq!(h.exceptions.count(), 1);
    assert!(h.exceptions.errors()[0].contains("Failed to dispatch message"));
    let pool = h.connector.dispatchers().unwrap();
    assert_eq!(pool.num_idle(&ep), 0);
    assert_eq!(pool.stats().evicted.load(Ordering::Relaxed), 1);

    let dispatcher = h.connector.dispatcher(&ep).await.unwrap();
    assert!(!dispatcher.is_disposed());
    h.connector.return_dispatcher(&ep, dispatcher).await;

    let event = Event::new(Arc::new(Message::new("ping")), ep.clone());
    assert!(h.connector.send(event).await.unwrap().is_some());
    assert_eq!(stats.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_transacted_dispatch_stays_inline() {
    let factory = Arc::new(MockDispatcherFactory::new());
    let stats = factory.stats();
    let h = dispatch_harness(&factory, ConnectorConfig::default());
    h.connector.initialise().await.unwrap();

    let transactions = CountingTransactionFactory::new();
    let tx = transactions.begin().await.unwrap();
    let event = Event::new(Arc::new(Message::new("event")), endpoint("events"))
        .with_transaction(Some(tx));
    let handle = h.connector.dispatch(event).await.unwrap();

    assert!(!handle.is_scheduled());
    assert_eq!(stats.dispatched.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_receive_times_out_with_none() {
    let factory = Arc::new(MockDispatcherFactory::new());
    let stats = factory.stats();
    let h = dispatch_harness(&factory, ConnectorConfig::default());
    h.connector.initialise().await.unwrap();
    let ep = endpoint("inbox");

    let nothing = h
        .connector
        .receive(&ep, Duration::from_millis(20))
        .await
        .unwrap();
    assert!(nothing.is_none());

    stats.push_inbound(Message::new("late"));
    let received = h
        .connector
        .receive(&ep, Duration::from_millis(20))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.payload().as_text(), Some("late"));
    assert_eq!(h.connector.metrics().received.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_request_pulls_from_requester() {
    let requesters = Arc::new(MockRequesterFactory::new());
    let h = harness(
        StaticDescriptor::new("test").with_requester_factory(requesters.clone()),
        MockConnectorTransport::new("test"),
        ConnectorConfig {
            enable_message_events: true,
            ..ConnectorConfig::default()
        },
    );
    h.connector.initialise().await.unwrap();
    let ep = endpoint("queue");

    requesters.push(Message::new("job-1"));
    let job = h
        .connector
        .request(&ep, Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.payload().as_text(), Some("job-1"));

    let empty = h
        .connector
        .request(&ep, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(empty.is_none());

    assert_eq!(requesters.requested(), 2);
    assert_eq!(h.connector.metrics().requested.load(Ordering::Relaxed), 1);
    assert_eq!(h.notifications.count(NotificationAction::MessageRequested), 1);
    let work = h.connector.requester_work_manager().unwrap();
    assert_eq!(work.stats().scheduled.load(Ordering::Relaxed), 2);
    // handed over to the caller, who may change it
    job.set_property("seen", true).unwrap();
}

#[tokio::test]
async fn test_inline_request_skips_requester_work_manager() {
    let requesters = Arc::new(MockRequesterFactory::new());
    let h = harness(
        StaticDescriptor::new("test").with_requester_factory(requesters.clone()),
        MockConnectorTransport::new("test"),
        ConnectorConfig {
            requester_threading: ThreadingProfile {
                do_threading: false,
                ..ThreadingProfile::default()
            },
            ..ConnectorConfig::default()
        },
    );
    h.connector.initialise().await.unwrap();

    requesters.push(Message::new("job-1"));
    let job = h
        .connector
        .request(&endpoint("queue"), Duration::from_millis(50))
        .await
        .unwrap();
    assert!(job.is_some());
    let work = h.connector.requester_work_manager().unwrap();
    assert_eq!(work.stats().scheduled.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_request_without_requester_factory_fails() {
    let h = default_harness();
    h.connector.initialise().await.unwrap();

    let err = h
        .connector
        .request(&endpoint("queue"), Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::Configuration { .. }));
}
