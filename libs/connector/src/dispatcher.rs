//! Message dispatchers
//!
//! A dispatcher performs outbound traffic for one endpoint. Dispatchers are
//! pooled per endpoint by the connector and each one runs its own
//! connect/disconnect cycle independently of the connector: connecting a
//! dispatcher means "make sure the connector is connected, then open my own
//! transport resources".
//!
//! ## Operations
//!
//! - [`MessageDispatcher::dispatch`]: fire-and-forget. Runs on the
//!   connector's dispatcher work manager when threading is enabled, the event
//!   is asynchronous and no transaction is active; otherwise inline.
//! - [`MessageDispatcher::send`]: request/reply, always inline.
//! - [`MessageDispatcher::receive`]: blocking pull with a timeout. An expired
//!   timeout is `Ok(None)`, not an error.
//!
//! Any transport failure disposes the dispatcher so the pool evicts it on
//! return.

use crate::connectable::{Connectable, ConnectionState};
use crate::connector::Connector;
use crate::endpoint::Endpoint;
use crate::event::Event;
use crate::message::{Message, REMOTE_SYNC_PROPERTY};
use crate::notification::{Notification, NotificationAction};
use crate::pool::{KeyedPool, PoolableFactory};
use crate::retry::{ConnectionStrategy, RetryContext};
use crate::work::WorkHandle;
use crate::{ConnectorError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Transport-specific half of a dispatcher
#[async_trait]
pub trait DispatcherTransport: Send + Sync {
    async fn do_connect(&self) -> Result<()>;

    async fn do_disconnect(&self) -> Result<()>;

    async fn do_dispatch(&self, event: &Event) -> Result<()>;

    async fn do_send(&self, event: &Event) -> Result<Option<Arc<Message>>>;

    /// Wait up to `timeout` for a message; `None` if nothing arrived
    async fn do_receive(&self, _timeout: Duration) -> Result<Option<Arc<Message>>> {
        Ok(None)
    }

    async fn do_dispose(&self) {}

    /// Health check run when the dispatcher is returned to the pool
    fn validate(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait MessageDispatcherFactory: Send + Sync {
    async fn create(&self, endpoint: &Arc<Endpoint>) -> Result<Box<dyn DispatcherTransport>>;

    /// Destroy every dispatcher after a single use
    fn create_per_request(&self) -> bool {
        false
    }
}

/// Outcome of [`MessageDispatcher::dispatch`]
#[derive(Debug)]
pub enum DispatchHandle {
    /// Dispatched in the caller's task
    Completed,
    /// Handed to the dispatcher work manager
    Scheduled(WorkHandle),
}

impl DispatchHandle {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, DispatchHandle::Scheduled(_))
    }

    /// Wait for a scheduled dispatch. Its failure, if any, went to the
    /// connector's exception listener.
    pub async fn join(self) {
        if let DispatchHandle::Scheduled(handle) = self {
            handle.join().await;
        }
    }
}

/// Where a borrowed dispatcher goes once its work is done
pub(crate) struct PoolReturn {
    pool: Arc<KeyedPool<Arc<MessageDispatcher>>>,
    endpoint: Arc<Endpoint>,
}

impl PoolReturn {
    pub(crate) fn new(
        pool: Arc<KeyedPool<Arc<MessageDispatcher>>>,
        endpoint: Arc<Endpoint>,
    ) -> Self {
        Self { pool, endpoint }
    }

    async fn release(self, dispatcher: Arc<MessageDispatcher>) {
        self.pool.return_object(&self.endpoint, dispatcher).await;
    }
}

pub struct MessageDispatcher {
    connector: Weak<Connector>,
    endpoint: Arc<Endpoint>,
    transport: Box<dyn DispatcherTransport>,
    strategy: Arc<dyn ConnectionStrategy>,
    state: ConnectionState,
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("endpoint", &self.endpoint.key())
            .field("connected", &self.state.is_connected())
            .field("disposed", &self.state.is_disposed())
            .finish()
    }
}

impl MessageDispatcher {
    pub fn new(
        connector: &Arc<Connector>,
        endpoint: Arc<Endpoint>,
        transport: Box<dyn DispatcherTransport>,
    ) -> Self {
        Self::with_connector(Arc::downgrade(connector), endpoint, transport)
    }

    pub(crate) fn with_connector(
        connector: Weak<Connector>,
        endpoint: Arc<Endpoint>,
        transport: Box<dyn DispatcherTransport>,
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

    pub fn is_connecting(&self) -> bool {
        self.state.is_connecting()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.is_disposed()
    }

    /// Pool validation: healthy and not disposed
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

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(ConnectorError::disposed(self.connection_description()));
        }
        Ok(())
    }

    /// Connect in the caller's task. Dispatchers already run on a caller or a
    /// worker task, so the strategy's threading flag is ignored here.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_not_disposed()?;
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

    pub async fn reconnect(&self) -> Result<()> {
        self.disconnect().await?;
        self.connect().await
    }

    /// Release transport resources. Safe to call more than once.
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
        tracing::debug!("Disposed: {}", self.connection_description());
    }

    /// Returns true if the event was dropped by the security filter
    async fn rejected_by_security(&self, connector: &Connector, event: &Event) -> bool {
        let Some(filter) = self.endpoint.security_filter() else {
            return false;
        };
        match filter.authenticate(event).await {
            Ok(()) => false,
            Err(e) => {
                connector
                    .fire_notification(
                        Notification::new(
                            NotificationAction::SecurityAuthenticationFailed,
                            self.endpoint.key(),
                        )
                        .with_detail(e.to_string()),
                    )
                    .await;
                connector.handle_exception(e).await;
                true
            }
        }
    }

    /// Fire-and-forget dispatch of `event`
    pub async fn dispatch(self: &Arc<Self>, event: Event) -> Result<DispatchHandle> {
        self.dispatch_inner(event, None).await
    }

    /// Dispatch a pooled dispatcher and give it back to its pool when the
    /// dispatch is over. A scheduled dispatch keeps the borrow until its
    /// worker finishes.
    pub(crate) async fn dispatch_pooled(
        self: &Arc<Self>,
        event: Event,
        pool_return: PoolReturn,
    ) -> Result<DispatchHandle> {
        self.dispatch_inner(event, Some(pool_return)).await
    }

    async fn dispatch_inner(
        self: &Arc<Self>,
        mut event: Event,
        pool_return: Option<PoolReturn>,
    ) -> Result<DispatchHandle> {
        let release = move |pool_return: Option<PoolReturn>| async move {
            if let Some(pool_return) = pool_return {
                pool_return.release(self.clone()).await;
            }
        };

        if let Err(e) = self.ensure_not_disposed() {
            release(pool_return).await;
            return Err(e);
        }
        event.set_synchronous(false);

        if event.is_transaction_rollback() {
            tracing::debug!(
                "Transaction is rollback-only, not dispatching message {}",
                event.message().id()
            );
            release(pool_return).await;
            return Ok(DispatchHandle::Completed);
        }

        let connector = match self.connector() {
            Ok(connector) => connector,
            Err(e) => {
                release(pool_return).await;
                return Err(e);
            }
        };
        if self.rejected_by_security(&connector, &event).await {
            release(pool_return).await;
            return Ok(DispatchHandle::Completed);
        }

        let threaded = connector.config().dispatcher_threading.do_threading
            && !event.is_synchronous()
            && event.transaction().is_none();

        if !threaded {
            let result = self.run_dispatch(event).await;
            release(pool_return).await;
            return result.map(|_| DispatchHandle::Completed);
        }

        let work_manager = match connector.dispatcher_work_manager() {
            Ok(work_manager) => work_manager,
            Err(e) => {
                release(pool_return).await;
                return Err(e);
            }
        };

        // the worker task becomes the message's new owner
        event.message().reset_access_control();
        // taken back here if the work is never scheduled
        let slot = Arc::new(Mutex::new(pool_return));
        let dispatcher = self.clone();
        let worker_slot = slot.clone();
        let scheduled = work_manager
            .schedule_work(async move {
                let result = dispatcher.run_dispatch(event).await;
                let pool_return = worker_slot.lock().take();
                if let Some(pool_return) = pool_return {
                    pool_return.release(dispatcher).await;
                }
                result
            })
            .await;

        match scheduled {
            Ok(handle) => Ok(DispatchHandle::Scheduled(handle)),
            Err(e) => {
                let pool_return = slot.lock().take();
                release(pool_return).await;
                Err(e)
            }
        }
    }

    async fn run_dispatch(&self, event: Event) -> Result<()> {
        let result = async {
            self.connect().await?;
            self.transport.do_dispatch(&event).await
        }
        .await;

        match result {
            Ok(()) => {
                if let Ok(connector) = self.connector() {
                    connector.metrics().dispatched.fetch_add(1, Ordering::Relaxed);
                    self.message_event(&connector, NotificationAction::MessageDispatched, &event)
                        .await;
                }
                Ok(())
            }
            Err(e) => {
                self.dispose().await;
                Err(ConnectorError::dispatch_with_source(
                    self.endpoint.key(),
                    "Failed to dispatch message",
                    e,
                ))
            }
        }
    }

    /// Synchronous send. The reply, if any, has its remote-sync marker removed.
    pub async fn send(&self, mut event: Event) -> Result<Option<Arc<Message>>> {
        self.ensure_not_disposed()?;
        event.set_synchronous(true);

        if event.is_transaction_rollback() {
            tracing::debug!(
                "Transaction is rollback-only, returning message {} unsent",
                event.message().id()
            );
            return Ok(Some(event.message().clone()));
        }

        let connector = self.connector()?;
        if self.rejected_by_security(&connector, &event).await {
            return Ok(None);
        }

        let result = async {
            self.connect().await?;
            self.transport.do_send(&event).await
        }
        .await;

        match result {
            Ok(reply) => {
                if let Some(reply) = &reply {
                    if reply.property(REMOTE_SYNC_PROPERTY).is_some() {
                        reply.remove_property(REMOTE_SYNC_PROPERTY)?;
                    }
                }
                connector.metrics().sent.fetch_add(1, Ordering::Relaxed);
                self.message_event(&connector, NotificationAction::MessageSent, &event)
                    .await;
                Ok(reply)
            }
            Err(e) => {
                self.dispose().await;
                Err(ConnectorError::dispatch_with_source(
                    self.endpoint.key(),
                    "Failed to send message",
                    e,
                ))
            }
        }
    }

    /// Pull one message from the endpoint
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Arc<Message>>> {
        self.ensure_not_disposed()?;
        let connector = self.connector()?;

        let result = async {
            self.connect().await?;
            match tokio::time::timeout(timeout, self.transport.do_receive(timeout)).await {
                Ok(received) => received,
                Err(_) => Ok(None),
            }
        }
        .await;

        match result {
            Ok(received) => {
                if received.is_some() {
                    connector.metrics().received.fetch_add(1, Ordering::Relaxed);
                }
                Ok(received)
            }
            Err(e) => {
                self.dispose().await;
                Err(ConnectorError::receive_with_source(
                    self.endpoint.key(),
                    "Failed to receive message",
                    e,
                ))
            }
        }
    }

    async fn message_event(
        &self,
        connector: &Connector,
        action: NotificationAction,
        event: &Event,
    ) {
        if connector.config().enable_message_events {
            connector
                .fire_notification(
                    Notification::new(action, self.endpoint.key())
                        .with_detail(event.message().id()),
                )
                .await;
        }
    }
}

#[async_trait]
impl Connectable for MessageDispatcher {
    async fn attempt_connect(&self, ctx: &RetryContext) -> Result<()> {
        let connector = self.connector()?;
        if !connector.is_connected() {
            connector.connect_nested(ctx).await?;
        }
        self.transport.do_connect().await
    }

    fn connection_description(&self) -> String {
        format!("dispatcher for {}", self.endpoint.key())
    }
}

/// Adapts a [`MessageDispatcherFactory`] to the keyed pool
pub(crate) struct DispatcherPoolFactory {
    connector: Weak<Connector>,
    factory: Arc<dyn MessageDispatcherFactory>,
}

impl DispatcherPoolFactory {
    pub(crate) fn new(
        connector: Weak<Connector>,
        factory: Arc<dyn MessageDispatcherFactory>,
    ) -> Self {
        Self { connector, factory }
    }
}

#[async_trait]
impl PoolableFactory<Arc<MessageDispatcher>> for DispatcherPoolFactory {
    async fn make(&self, endpoint: &Arc<Endpoint>) -> Result<Arc<MessageDispatcher>> {
        let transport = self.factory.create(endpoint).await?;
        Ok(Arc::new(MessageDispatcher::with_connector(
            self.connector.clone(),
            endpoint.clone(),
            transport,
        )))
    }

    async fn validate(
        &self,
        _endpoint: &Arc<Endpoint>,
        dispatcher: &Arc<MessageDispatcher>,
    ) -> bool {
        !self.factory.create_per_request() && dispatcher.validate()
    }

    async fn destroy(&self, _endpoint: &Arc<Endpoint>, dispatcher: Arc<MessageDispatcher>) {
        dispatcher.dispose().await;
    }
}
