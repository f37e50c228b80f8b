//! Shared fixtures for the connector integration tests

#![allow(dead_code)]

use connector::test_utils::{
    MockConnectorTransport, RecordingExceptionListener, RecordingNotifications, StaticDescriptor,
};
use connector::{Connector, ConnectorConfig, RetryPolicyConfig};
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub connector: Arc<Connector>,
    pub notifications: Arc<RecordingNotifications>,
    pub exceptions: Arc<RecordingExceptionListener>,
}

pub fn harness(
    descriptor: StaticDescriptor,
    transport: MockConnectorTransport,
    config: ConnectorConfig,
) -> Harness {
    let notifications = Arc::new(RecordingNotifications::new());
    let exceptions = Arc::new(RecordingExceptionListener::new());
    let connector = Connector::builder("it-connector", Box::new(transport))
        .config(config)
        .service_descriptor(Arc::new(descriptor))
        .notification_manager(notifications.clone())
        .exception_listener(exceptions.clone())
        .build();
    Harness {
        connector,
        notifications,
        exceptions,
    }
}

/// Harness on the `test` protocol with default descriptor and transport
pub fn default_harness() -> Harness {
    harness(
        StaticDescriptor::new("test"),
        MockConnectorTransport::new("test"),
        ConnectorConfig::default(),
    )
}

pub fn retry_config(retry_count: u32, frequency_ms: u64) -> ConnectorConfig {
    ConnectorConfig {
        retry: RetryPolicyConfig::SimpleRetry {
            retry_count,
            frequency_ms,
            retry_forever: false,
            do_threading: false,
        },
        ..ConnectorConfig::default()
    }
}

/// Poll `condition` every few milliseconds until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
