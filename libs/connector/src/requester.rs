//! Message requesters: pooled objects that pull a message from an endpoint
//! on demand. They follow the dispatcher's connect and dispose rules.

use crate::connectable::{Connectable, ConnectionState};
use crate::connector::Connector;
use crate::endpoint::Endpoint;
use crate::message::Message;
use crate::notification::{Notification, NotificationAction};
use crate::pool::PoolableFactory;
use crate::retry::{ConnectionStrategy, RetryContext};
use crate::{ConnectorError, Result};
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

#[async_trait]
pub trait RequesterTransport: Send + Sync {
    async fn do_connect(&self) -> Result<()>;

    async fn do_disconnect(&self) -> Result<()>;

    /// Wait up to `timeout` for a message; `None` if nothing arrived
    async fn do_request(&self, timeout: Duration) -> Result<Option<Arc<Message>>>;

    async fn do_dispose(&self) {}

    fn validate(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait MessageRequesterFactory: Send + Sync {
    async fn create(&self, endpoint: &Arc<Endpoint>) -> Result<Box<dyn RequesterTransport>>;

    fn create_per_request(&self) -> bool {
        false
    }
}

pub struct MessageRequester {
    connector: Weak<Connector>,
    endpoint: Arc<Endpoint>,
    transport: Box<dyn RequesterTransport>,
    strategy: Arc<dyn ConnectionStrategy>,
    state: ConnectionState,
}

impl std::fmt::Debug for MessageRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRequester")
            .field("endpoint", &self.endpoint.key())
            .field("connected", &self.state.is_connected())
            .field("disposed", &self.state.is_disposed())
            .finish()
    }
}

impl MessageRequester {
    pub(crate) fn with_connector(
        connector: Weak<Connector>,
        endpoint: Arc<Endpoint>,
        transport: Box<dyn RequesterTransport>,
    ) -> Self {
        Self {
            connector,
            strategy: endpoint.connection_strategy().clone(),
            endpoint,
            transport,
            state: ConnectionState::new(),
        }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.is_disposed()
    }

    pub fn validate(&self) -> bool {
        !self.is_disposed() && self.transport.validate()
    }

    fn connector(&self) -> Result<Arc<Connector>> {
        self.connector
            .upgrade()
            .ok_or_else(|| {
                ConnectorError::disposed(format!("connector of {}", self.endpoint.key()))
            })
    }

    pub async fn connect(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(ConnectorError::disposed(self.connection_description()));
        }
        let mut ctx = self.connector()?.retry_context();
        if self
            .state
            .connect_with(self.strategy.as_ref(), self, &mut ctx)
            .await?
        {
            tracing::debug!("Connected: {}", self.connection_description());
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        if self
            .state
            .disconnect_with(|| self.transport.do_disconnect())
            .await?
        {
            tracing::debug!("Disconnected: {}", self.connection_description());
        }
        Ok(())
    }

    pub async fn dispose(&self) {
        if !self.state.mark_disposed() {
            return;
        }
        if let Err(e) = self.disconnect().await {
            tracing::warn!(
                "Failed to disconnect {} during dispose: {}",
                self.connection_description(),
                e
            );
        }
        self.transport.do_dispose().await;
    }

    /// Pull one message, `Ok(None)` when `timeout` expires first
    pub async fn request(&self, timeout: Duration) -> Result<Option<Arc<Message>>> {
        if self.is_disposed() {
            return Err(ConnectorError::disposed(self.connection_description()));
        }
        let connector = self.connector()?;

        let result = async {
            self.connect().await?;
            match tokio::time::timeout(timeout, self.transport.do_request(timeout)).await {
                Ok(received) => received,
                Err(_) => Ok(None),
            }
        }
        .await;

        match result {
            Ok(received) => {
                if let Some(message) = &received {
                    connector.metrics().requested.fetch_add(1, Ordering::Relaxed);
                    if connector.config().enable_message_events {
                        connector
                            .fire_notification(
                                Notification::new(
                                    NotificationAction::MessageRequested,
                                    self.endpoint.key(),
                                )
                                .with_detail(message.id()),
                            )
                            .await;
                    }
                }
                Ok(received)
            }
            Err(e) => {
                self.dispose().await;
                Err(ConnectorError::receive_with_source(
                    self.endpoint.key(),
                    "Failed to request message",
                    e,
                ))
            }
        }
    }
}

#[async_trait]
impl Connectable for MessageRequester {
    async fn attempt_connect(&self, ctx: &RetryContext) -> Result<()> {
        let connector = self.connector()?;
        if !connector.is_connected() {
            connector.connect_nested(ctx).await?;
        }
        self.transport.do_connect().await
    }

    fn connection_description(&self) -> String {
        format!("requester for {}", self.endpoint.key())
    }
}

pub(crate) struct RequesterPoolFactory {
    connector: Weak<Connector>,
    factory: Arc<dyn MessageRequesterFactory>,
}

impl RequesterPoolFactory {
    pub(crate) fn new(
        connector: Weak<Connector>,
        factory: Arc<dyn MessageRequesterFactory>,
    ) -> Self {
        Self { connector, factory }
    }
}

#[async_trait]
impl PoolableFactory<Arc<MessageRequester>> for RequesterPoolFactory {
    async fn make(&self, endpoint: &Arc<Endpoint>) -> Result<Arc<MessageRequester>> {
        let transport = self.factory.create(endpoint).await?;
        Ok(Arc::new(MessageRequester::with_connector(
            self.connector.clone(),
            endpoint.clone(),
            transport,
        )))
    }

    async fn validate(&self, _endpoint: &Arc<Endpoint>, requester: &Arc<MessageRequester>) -> bool {
        !self.factory.create_per_request() && requester.validate()
    }

    async fn destroy(&self, _endpoint: &Arc<Endpoint>, requester: Arc<MessageRequester>) {
        requester.dispose().await;
    }
}
