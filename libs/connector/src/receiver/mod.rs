//! Message receivers
//!
//! A receiver turns inbound transport data into routed messages for one
//! (component, endpoint) pair. It owns its own connection, separate from the
//! connector's, and its own start/stop state.
//!
//! ## Routing pipeline
//!
//! [`MessageReceiver::route_message_with`] runs, in order:
//! 1. "message received" notification (when message events are enabled)
//! 2. endpoint filter; a rejected message is dropped and `None` returned
//! 3. security filter; a failure is reported and the message returned as is
//! 4. session and event construction
//! 5. response endpoints go to the component's response router (`None`
//!    returned), everything else to its inbound router
//! 6. error-code stamping of failed results
//! 7. response transformers
//!
//! Transport behavior plugs in through [`ReceiverTransport`]. Polling and
//! batch helpers live in the submodules.

pub mod polling;
pub mod transacted;
pub mod worker;

use crate::connectable::{Connectable, ConnectionState, ExceptionListener, WaitableBool};
use crate::connector::Connector;
use crate::descriptor::ServiceDescriptor;
use crate::endpoint::{Endpoint, EndpointType};
use crate::event::Event;
use crate::filter::apply_transformers;
use crate::message::{Message, REMOTE_SYNC_PROPERTY};
use crate::notification::{Notification, NotificationAction};
use crate::retry::{ConnectionStrategy, RetryContext};
use crate::routing::Component;
use crate::transaction::Transaction;
use crate::{ConnectorError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub use polling::{Poller, PollingReceiver};
pub use transacted::{TransactedPoller, TransactedPollingReceiver};
pub use worker::{ReceiverWorker, WorkerHooks};

/// Transport-specific half of a receiver
#[async_trait]
pub trait ReceiverTransport: Send + Sync {
    async fn do_connect(&self, receiver: &Arc<MessageReceiver>) -> Result<()>;

    async fn do_disconnect(&self, receiver: &Arc<MessageReceiver>) -> Result<()>;

    async fn do_start(&self, _receiver: &Arc<MessageReceiver>) -> Result<()> {
        Ok(())
    }

    async fn do_stop(&self, _receiver: &Arc<MessageReceiver>) -> Result<()> {
        Ok(())
    }

    async fn do_dispose(&self, _receiver: &Arc<MessageReceiver>) {}
}

pub struct MessageReceiver {
    connector: Weak<Connector>,
    component: Arc<dyn Component>,
    endpoint: Arc<Endpoint>,
    key: String,
    strategy: Arc<dyn ConnectionStrategy>,
    transport: Arc<dyn ReceiverTransport>,
    state: ConnectionState,
    stopped: WaitableBool,
    lifecycle: tokio::sync::Mutex<()>,
    disposing: AtomicBool,
    self_ref: Weak<MessageReceiver>,
}

impl std::fmt::Debug for MessageReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("key", &self.key)
            .field("component", &self.component.name())
            .field("endpoint", &self.endpoint.key())
            .field("connected", &self.state.is_connected())
            .field("stopped", &self.stopped.get())
            .finish()
    }
}

impl MessageReceiver {
    pub fn new(
        connector: &Arc<Connector>,
        component: Arc<dyn Component>,
        endpoint: Arc<Endpoint>,
        transport: Arc<dyn ReceiverTransport>,
    ) -> Arc<Self> {
        let connector = Arc::downgrade(connector);
        Arc::new_cyclic(|self_ref| Self {
            connector,
            component,
            key: endpoint.receiver_key(),
            strategy: endpoint.connection_strategy().clone(),
            endpoint,
            transport,
            state: ConnectionState::new(),
            stopped: WaitableBool::new(true),
            lifecycle: tokio::sync::Mutex::new(()),
            disposing: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Key the connector stores this receiver under
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn component(&self) -> &Arc<dyn Component> {
        &self.component
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn connector(&self) -> Result<Arc<Connector>> {
        self.connector
            .upgrade()
            .ok_or_else(|| ConnectorError::disposed(format!("connector of receiver {}", self.key)))
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.state.is_connecting()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.is_disposed()
    }

    fn arc(&self) -> Result<Arc<Self>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| ConnectorError::disposed(self.connection_description()))
    }

    fn descriptor(&self, connector: &Connector) -> Result<Arc<dyn ServiceDescriptor>> {
        connector
            .service_descriptor()
            .ok_or_else(|| ConnectorError::not_initialised(connector.name()))
    }

    /// Connect using the endpoint's strategy. A threaded strategy returns at
    /// once; the outcome is reported through this receiver's exception path.
    pub async fn connect(&self) -> Result<()> {
        if self.is_disposed() || self.disposing.load(Ordering::Acquire) {
            return Err(ConnectorError::disposed(self.connection_description()));
        }
        if self.is_connected() {
            return Ok(());
        }

        if self.strategy.do_threading() {
            let receiver = self.arc()?;
            let connector = self.connector()?;
            connector
                .receiver_work_manager()?
                .schedule_work(async move {
                    if let Err(e) = receiver.run_connect().await {
                        receiver.exception_thrown(e).await;
                    }
                    Ok(())
                })
                .await?;
            return Ok(());
        }

        self.run_connect().await
    }

    async fn run_connect(&self) -> Result<()> {
        let connector = self.connector()?;
        let mut ctx = connector.retry_context();
        let description = self.connection_description();

        match self
            .state
            .connect_with(self.strategy.as_ref(), self, &mut ctx)
            .await
        {
            Ok(true) => {
                tracing::info!("Connected: {}", description);
                connector
                    .fire_notification(Notification::new(
                        NotificationAction::ConnectionConnected,
                        description,
                    ))
                    .await;
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                connector
                    .fire_notification(
                        Notification::new(NotificationAction::ConnectionFailed, description)
                            .with_detail(e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        let receiver = self.arc()?;
        let disconnected = self
            .state
            .disconnect_with(|| self.transport.do_disconnect(&receiver))
            .await?;

        if disconnected {
            let description = self.connection_description();
            tracing::info!("Disconnected: {}", description);
            if let Ok(connector) = self.connector() {
                connector
                    .fire_notification(Notification::new(
                        NotificationAction::ConnectionDisconnected,
                        description,
                    ))
                    .await;
            }
        }
        Ok(())
    }

    /// Start receiving. Connects first if needed. Start and stop are
    /// serialised, so a stop issued while a start is still connecting runs
    /// after the start has finished and undoes it.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_disposed() {
            return Err(ConnectorError::disposed(self.connection_description()));
        }
        if !self.stopped.compare_and_set(true, false) {
            return Ok(());
        }

        let receiver = self.arc()?;
        let result = async {
            if !self.is_connected() {
                self.connect().await?;
            }
            self.transport.do_start(&receiver).await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::debug!("Started receiver {}", self.key);
                Ok(())
            }
            Err(e) => {
                self.stopped.set(true);
                Err(e)
            }
        }
    }

    /// Stop receiving and disconnect. Errors are logged, never returned.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        // waits for a connect in flight, no-op when not connected
        if let Err(e) = self.disconnect().await {
            tracing::warn!("Failed to disconnect receiver {}: {}", self.key, e);
        }

        if self.stopped.compare_and_set(false, true) {
            if let Ok(receiver) = self.arc() {
                if let Err(e) = self.transport.do_stop(&receiver).await {
                    tracing::warn!("Failed to stop receiver {}: {}", self.key, e);
                }
            }
            tracing::debug!("Stopped receiver {}", self.key);
        }
        Ok(())
    }

    /// Stop and release the receiver. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.stop().await {
            tracing::warn!("Failed to stop receiver {} during dispose: {}", self.key, e);
        }
        if let Ok(receiver) = self.arc() {
            self.transport.do_dispose(&receiver).await;
        }
        self.state.mark_disposed();
        tracing::debug!("Disposed receiver {}", self.key);
    }

    /// Route with the endpoint's synchronous flag and no transaction
    pub async fn route_message(&self, message: Arc<Message>) -> Result<Option<Arc<Message>>> {
        self.route_message_with(message, None, self.endpoint.is_synchronous())
            .await
    }

    pub async fn route_message_with(
        &self,
        message: Arc<Message>,
        transaction: Option<Arc<dyn Transaction>>,
        synchronous: bool,
    ) -> Result<Option<Arc<Message>>> {
        let connector = self.connector()?;

        if connector.config().enable_message_events {
            connector
                .fire_notification(
                    Notification::new(NotificationAction::MessageReceived, self.endpoint.key())
                        .with_detail(message.id()),
                )
                .await;
        }

        if let Some(filter) = self.endpoint.filter() {
            if !filter.accept(&message) {
                tracing::debug!(
                    "Message {} rejected by filter on {}",
                    message.id(),
                    self.endpoint.key()
                );
                return Ok(None);
            }
        }

        if self.endpoint.is_remote_sync() {
            message.set_property(REMOTE_SYNC_PROPERTY, true)?;
        }

        let descriptor = self.descriptor(&connector)?;
        let session = descriptor
            .session_handler()
            .retrieve_session(&message, self.component.name())?;
        let event = Event::with_session(
            message.clone(),
            self.endpoint.clone(),
            Arc::new(session),
            synchronous,
        )
        .with_transaction(transaction);

        if let Some(security) = self.endpoint.security_filter() {
            if let Err(e) = security.authenticate(&event).await {
                connector
                    .fire_notification(
                        Notification::new(
                            NotificationAction::SecurityAuthenticationFailed,
                            self.endpoint.key(),
                        )
                        .with_detail(e.to_string()),
                    )
                    .await;
                self.exception_thrown(e).await;
                return Ok(Some(message));
            }
        }

        if self.endpoint.endpoint_type() == EndpointType::Response {
            match self.component.response_router() {
                Some(router) => router.route(event).await?,
                None => tracing::warn!(
                    "Component '{}' has no response router, dropping reply {}",
                    self.component.name(),
                    message.id()
                ),
            }
            return Ok(None);
        }

        let result = self.component.inbound_router().route(event).await?;

        if let Some(result) = &result {
            self.stamp_error_code(descriptor.as_ref(), result)?;
        }

        let transformers = if self.endpoint.response_transformers().is_empty() {
            descriptor.default_response_transformers()
        } else {
            self.endpoint.response_transformers().to_vec()
        };
        if transformers.is_empty() {
            return Ok(result);
        }

        let result = match result {
            Some(result) => Some(result),
            None if transformers.iter().any(|t| !t.accepts_null()) => {
                Some(Arc::new(Message::null()))
            }
            None => None,
        };
        if let Some(result) = &result {
            apply_transformers(result, &transformers)?;
        }
        Ok(result)
    }

    fn stamp_error_code(&self, descriptor: &dyn ServiceDescriptor, result: &Message) -> Result<()> {
        let Some(mut exception) = result.exception_payload() else {
            return Ok(());
        };
        let Some(property) = descriptor.error_code_property() else {
            return Ok(());
        };
        if let Some(code) = descriptor.error_code_for(&exception.kind) {
            result.set_property(property, code.clone())?;
            exception.code = Some(code);
            result.set_exception_payload(Some(exception))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Connectable for MessageReceiver {
    async fn attempt_connect(&self, ctx: &RetryContext) -> Result<()> {
        let connector = self.connector()?;
        if !connector.is_connected() {
            connector.connect_nested(ctx).await?;
        }
        let receiver = self.arc()?;
        self.transport.do_connect(&receiver).await
    }

    fn connection_description(&self) -> String {
        format!("receiver {} on {}", self.key, self.endpoint.key())
    }
}

#[async_trait]
impl ExceptionListener for MessageReceiver {
    /// A recoverable connect error makes the receiver disconnect and
    /// reconnect. Everything is forwarded to the connector.
    async fn exception_thrown(&self, error: ConnectorError) {
        let connector = match self.connector() {
            Ok(connector) => connector,
            Err(_) => {
                tracing::error!(
                    "Receiver {} failed after its connector went away: {}",
                    self.key,
                    error
                );
                return;
            }
        };

        let reconnect = error.is_connect_error()
            && !error.is_fatal()
            && !self.disposing.load(Ordering::Acquire);

        if reconnect {
            tracing::warn!("Receiver {} lost its connection: {}", self.key, error);
            if let Err(e) = self.disconnect().await {
                tracing::warn!("Failed to disconnect receiver {}: {}", self.key, e);
            }
        }

        connector.exception_thrown(error).await;

        if reconnect {
            if let Err(e) = self.connect().await {
                connector.exception_thrown(e).await;
            }
        }
    }
}
