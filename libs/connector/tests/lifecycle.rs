//! Connector lifecycle tests
//!
//! - Idempotent disposal of connectors, receivers and dispatchers
//! - Retry exhaustion and counter reset
//! - Connection notifications on the terminal outcome only
//! - Stop/start and disconnect/connect round trips

mod common;

use common::*;
use connector::test_utils::{
    endpoint, MockConnectorTransport, MockDispatcherFactory, StaticDescriptor, TestComponent,
};
use connector::{
    Connector, ConnectorConfig, ConnectorError, NotificationAction, RetryPolicyConfig, SimpleRetry,
    SingleAttempt,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_dispose_is_idempotent() {
    let dispatchers = Arc::new(MockDispatcherFactory::new());
    let transport = MockConnectorTransport::new("test");
    let transport_stats = transport.stats();
    let h = harness(
        StaticDescriptor::new("test").with_dispatcher_factory(dispatchers.clone()),
        transport,
        ConnectorConfig::default(),
    );
    let connector = &h.connector;

    connector.initialise().await.unwrap();
    connector.start().await.unwrap();
    assert!(connector.is_connected());
    assert!(connector.is_started());

    let receiver = connector
        .register_listener(Arc::new(TestComponent::new("orders")), endpoint("orders.in"))
        .await
        .unwrap();
    assert!(!receiver.is_stopped());

    // a dispatcher disposed on its own, outside the pool
    let dispatcher = connector.dispatcher(&endpoint("orders.out")).await.unwrap();
    for _ in 0..3 {
        dispatcher.dispose().await;
    }
    assert!(dispatcher.is_disposed());
    assert_eq!(dispatchers.stats().disposed.load(Ordering::SeqCst), 1);

    for _ in 0..3 {
        receiver.dispose().await;
    }
    assert!(receiver.is_disposed());

    for _ in 0..3 {
        connector.dispose().await;
    }
    assert!(connector.is_disposed());
    assert!(!connector.is_started());
    assert!(!connector.is_connected());
    assert!(connector.receivers().is_empty());
    assert_eq!(transport_stats.disposes.load(Ordering::SeqCst), 1);
    assert_eq!(transport_stats.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(h.notifications.count(NotificationAction::ConnectionDisconnected), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_makes_three_attempts() {
    let transport = MockConnectorTransport::new("test").always_failing();
    let stats = transport.stats();
    let h = harness(StaticDescriptor::new("test"), transport, retry_config(2, 100));

    let err = h.connector.connect().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(stats.connect_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        h.connector.metrics().connection_attempts.load(Ordering::Relaxed),
        3
    );

    // the next connect counts from zero again
    let err = h.connector.connect().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(stats.connect_attempts.load(Ordering::SeqCst), 6);
    assert_eq!(h.connector.metrics().connect_failures.load(Ordering::Relaxed), 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fire_one_failure_notification() {
    // the third attempt would succeed, but only two are allowed
    let transport = MockConnectorTransport::new("test").failing_first(2);
    let stats = transport.stats();
    let h = harness(StaticDescriptor::new("test"), transport, retry_config(1, 10));

    let err = h.connector.connect().await.unwrap_err();
    assert!(matches!(err, ConnectorError::FatalConnect { .. }));
    assert!(!h.connector.is_connected());
    assert!(!h.connector.is_connecting());
    assert_eq!(stats.connect_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(h.notifications.count(NotificationAction::ConnectionFailed), 1);
    assert_eq!(h.notifications.count(NotificationAction::ConnectionConnected), 0);

    h.connector.connect().await.unwrap();
    assert!(h.connector.is_connected());
    assert_eq!(h.notifications.count(NotificationAction::ConnectionConnected), 1);
}

#[tokio::test]
async fn test_stop_then_start_reconnects() {
    let transport = MockConnectorTransport::new("test");
    let stats = transport.stats();
    let h = harness(StaticDescriptor::new("test"), transport, ConnectorConfig::default());
    let connector = &h.connector;

    connector.initialise().await.unwrap();
    connector.start().await.unwrap();
    let receiver = connector
        .register_listener(Arc::new(TestComponent::new("svc")), endpoint("in"))
        .await
        .unwrap();
    assert!(receiver.is_connected());

    connector.stop().await.unwrap();
    connector.stop().await.unwrap();
    assert!(!connector.is_started());
    assert!(!connector.is_connected());
    assert!(receiver.is_stopped());
    assert!(!receiver.is_connected());
    assert_eq!(stats.stops.load(Ordering::SeqCst), 1);

    connector.start().await.unwrap();
    assert!(connector.is_started());
    assert!(connector.is_connected());
    assert!(!receiver.is_stopped());
    assert_eq!(stats.connects.load(Ordering::SeqCst), 2);
    assert_eq!(stats.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_listeners_need_an_initialised_connector() {
    let h = default_harness();
    let connector = &h.connector;
    let component = Arc::new(TestComponent::new("svc"));

    let err = connector
        .register_listener(component.clone(), endpoint("early"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::NotInitialised { .. }));

    connector.initialise().await.unwrap();
    let receiver = connector
        .register_listener(component.clone(), endpoint("late"))
        .await
        .unwrap();
    assert!(connector.lookup_receiver(receiver.key()).is_some());
    // not started, so the receiver waits
    assert!(receiver.is_stopped());
    assert!(connector.dispatchers().is_some());
}

#[tokio::test]
async fn test_initialise_again_after_transport_failure() {
    let dispatchers = Arc::new(MockDispatcherFactory::new());
    let transport = MockConnectorTransport::new("test").failing_initialise(1);
    let transport_stats = transport.stats();
    let h = harness(
        StaticDescriptor::new("test").with_dispatcher_factory(dispatchers.clone()),
        transport,
        ConnectorConfig::default(),
    );
    let connector = &h.connector;

    assert!(connector.initialise().await.is_err());
    assert!(!connector.is_initialised());
    assert!(connector.dispatchers().is_none());
    assert!(connector.service_descriptor().is_none());
    assert!(matches!(
        connector.dispatcher(&endpoint("orders.out")).await,
        Err(ConnectorError::NotInitialised { .. })
    ));

    connector.initialise().await.unwrap();
    assert!(connector.is_initialised());
    assert_eq!(transport_stats.initialise_attempts.load(Ordering::SeqCst), 2);

    let ep = endpoint("orders.out");
    let dispatcher = connector.dispatcher(&ep).await.unwrap();
    assert!(!dispatcher.is_disposed());
    connector.return_dispatcher(&ep, dispatcher).await;
    assert_eq!(connector.dispatchers().unwrap().num_idle(&ep), 1);
}

#[test_log::test(tokio::test)]
async fn test_threaded_connect_failure_reaches_listener() {
    let transport = MockConnectorTransport::new("test").always_failing();
    let notifications = Arc::new(connector::test_utils::RecordingNotifications::new());
    let exceptions = Arc::new(connector::test_utils::RecordingExceptionListener::new());
    let connector = Connector::builder("threaded", Box::new(transport))
        .service_descriptor(Arc::new(StaticDescriptor::new("test")))
        .connection_strategy(Arc::new(SingleAttempt::new().with_threading(true)))
        .notification_manager(notifications.clone())
        .exception_listener(exceptions.clone())
        .build();

    // returns before the attempt has run
    connector.connect().await.unwrap();

    assert!(wait_until(Duration::from_secs(2), || exceptions.count() == 1).await);
    assert!(!connector.is_connected());
    assert!(!connector.is_connecting());
    assert_eq!(notifications.count(NotificationAction::ConnectionFailed), 1);
    assert!(exceptions.errors()[0].contains("Fatal connect failure"));
}

#[tokio::test(start_paused = true)]
async fn test_dispose_interrupts_retry_pause() {
    let transport = MockConnectorTransport::new("test").always_failing();
    let connector = Connector::builder("forever", Box::new(transport))
        .service_descriptor(Arc::new(StaticDescriptor::new("test")))
        .connection_strategy(Arc::new(SimpleRetry::forever(Duration::from_secs(60))))
        .build();

    let connecting = {
        let connector = connector.clone();
        tokio::spawn(async move { connector.connect().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(connector.is_connecting());

    connector.dispose().await;

    let err = connecting.await.unwrap().unwrap_err();
    assert!(err.is_fatal());
    assert!(!connector.is_connected());
}

#[tokio::test]
async fn test_config_file_drives_retry_policy() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(
        &mut file,
        br#"
            number_of_concurrent_transacted_receivers = 2

            [retry]
            policy = "simple_retry"
            retry_count = 0
            frequency_ms = 5
        "#,
    )
    .unwrap();

    let config = ConnectorConfig::from_file(file.path()).unwrap();
    assert!(matches!(
        config.retry,
        RetryPolicyConfig::SimpleRetry { retry_count: 0, .. }
    ));

    let transport = MockConnectorTransport::new("test").always_failing();
    let stats = transport.stats();
    let h = harness(StaticDescriptor::new("test"), transport, config);

    assert!(h.connector.connect().await.unwrap_err().is_fatal());
    assert_eq!(stats.connect_attempts.load(Ordering::SeqCst), 1);
}
