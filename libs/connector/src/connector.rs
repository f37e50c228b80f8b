//! Connector: the transport-wide lifecycle owner
//!
//! A connector binds one protocol. It owns the receivers registered on it,
//! keyed pools of dispatchers and requesters, lazily created work managers
//! for receivers, dispatchers and requesters, and the scheduler polling
//! receivers run on.
//!
//! ## Lifecycle
//!
//! ```text
//! created -> initialised -> started <-> stopped -> disposed
//!                 (connected <-> disconnected, orthogonal)
//! ```
//!
//! - `initialise` resolves the service descriptor and builds the pools
//! - `start` creates the scheduler and starts every receiver
//! - `stop` stops receivers, drops the scheduler and disconnects
//! - `dispose` stops, disposes receivers and pools, and is idempotent
//! - `connect`/`disconnect` run the transport hooks through the connection
//!   strategy and fire notifications on the terminal outcome
//!
//! A disposed connector rejects every lifecycle and outbound operation.

use crate::config::{ConnectorConfig, ThreadingProfile};
use crate::connectable::{Connectable, ExceptionListener, WaitableBool};
use crate::descriptor::{DescriptorLookup, Registry, ServiceDescriptor, StaticDescriptorLookup};
use crate::dispatcher::{DispatchHandle, DispatcherPoolFactory, MessageDispatcher, PoolReturn};
use crate::endpoint::Endpoint;
use crate::event::Event;
use crate::message::Message;
use crate::notification::{
    LoggingNotificationManager, Notification, NotificationAction, NotificationManager,
};
use crate::pool::KeyedPool;
use crate::receiver::MessageReceiver;
use crate::requester::{MessageRequester, RequesterPoolFactory};
use crate::retry::{ConnectionStrategy, RetryContext};
use crate::routing::Component;
use crate::scheduler::Scheduler;
use crate::work::WorkManager;
use crate::{ConnectorError, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Transport-specific half of a connector
#[async_trait]
pub trait ConnectorTransport: Send + Sync {
    /// Primary URI scheme, e.g. "jms"
    fn protocol(&self) -> &str;

    /// Further schemes this transport accepts
    fn supported_protocols(&self) -> Vec<String> {
        Vec::new()
    }

    async fn do_initialise(&self) -> Result<()> {
        Ok(())
    }

    async fn do_connect(&self) -> Result<()>;

    async fn do_disconnect(&self) -> Result<()>;

    async fn do_start(&self) -> Result<()> {
        Ok(())
    }

    async fn do_stop(&self) -> Result<()> {
        Ok(())
    }

    async fn do_dispose(&self) {}
}

/// Connector counters
#[derive(Debug, Default)]
pub struct ConnectorMetrics {
    /// Raw transport connect attempts, retries included
    pub connection_attempts: AtomicU64,
    /// Connect calls that ended connected
    pub connects: AtomicU64,
    /// Connect calls that gave up
    pub connect_failures: AtomicU64,
    /// Fire-and-forget dispatches that reached the transport
    pub dispatched: AtomicU64,
    /// Synchronous sends that reached the transport
    pub sent: AtomicU64,
    /// Messages pulled through `receive`
    pub received: AtomicU64,
    /// Messages pulled through `request`
    pub requested: AtomicU64,
    /// Errors handed to the exception listener
    pub exceptions: AtomicU64,
}

pub struct ConnectorBuilder {
    name: String,
    config: ConnectorConfig,
    transport: Box<dyn ConnectorTransport>,
    strategy: Option<Arc<dyn ConnectionStrategy>>,
    descriptors: Option<Arc<dyn DescriptorLookup>>,
    notifications: Option<Arc<dyn NotificationManager>>,
    registry: Option<Arc<dyn Registry>>,
    exception_listener: Option<Arc<dyn ExceptionListener>>,
}

impl ConnectorBuilder {
    pub fn config(mut self, config: ConnectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the strategy built from `config.retry`
    pub fn connection_strategy(mut self, strategy: Arc<dyn ConnectionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Use `descriptor` for this connector's protocol
    pub fn service_descriptor(mut self, descriptor: Arc<dyn ServiceDescriptor>) -> Self {
        self.descriptors = Some(Arc::new(StaticDescriptorLookup::new().with(descriptor)));
        self
    }

    /// Resolve the service descriptor through `lookup` at initialise
    pub fn descriptor_lookup(mut self, lookup: Arc<dyn DescriptorLookup>) -> Self {
        self.descriptors = Some(lookup);
        self
    }

    /// Defaults to [`LoggingNotificationManager`]
    pub fn notification_manager(mut self, manager: Arc<dyn NotificationManager>) -> Self {
        self.notifications = Some(manager);
        self
    }

    /// Registry the connector announces itself to on initialise
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Listener for failures that have no caller. Without one they are logged.
    pub fn exception_listener(mut self, listener: Arc<dyn ExceptionListener>) -> Self {
        self.exception_listener = Some(listener);
        self
    }

    pub fn build(self) -> Arc<Connector> {
        let strategy = self.strategy.unwrap_or_else(|| self.config.retry.build());
        let descriptors = self
            .descriptors
            .unwrap_or_else(|| Arc::new(StaticDescriptorLookup::new()));

        Arc::new_cyclic(|self_ref| Connector {
            name: self.name,
            config: self.config,
            transport: self.transport,
            strategy,
            descriptors,
            notifications: self
                .notifications
                .unwrap_or_else(|| Arc::new(LoggingNotificationManager)),
            registry: self.registry,
            exception_listener: RwLock::new(self.exception_listener),
            descriptor: RwLock::new(None),
            initialised: AtomicBool::new(false),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            disposing: WaitableBool::new(false),
            connected: WaitableBool::new(false),
            connecting: WaitableBool::new(false),
            start_on_connect: AtomicBool::new(false),
            receivers: DashMap::new(),
            dispatchers: RwLock::new(None),
            requesters: RwLock::new(None),
            receiver_work: RwLock::new(None),
            dispatcher_work: RwLock::new(None),
            requester_work: RwLock::new(None),
            scheduler: RwLock::new(None),
            metrics: ConnectorMetrics::default(),
            self_ref: self_ref.clone(),
        })
    }
}

type DispatcherPool = KeyedPool<Arc<MessageDispatcher>>;
type RequesterPool = KeyedPool<Arc<MessageRequester>>;

pub struct Connector {
    name: String,
    config: ConnectorConfig,
    transport: Box<dyn ConnectorTransport>,
    strategy: Arc<dyn ConnectionStrategy>,
    descriptors: Arc<dyn DescriptorLookup>,
    notifications: Arc<dyn NotificationManager>,
    registry: Option<Arc<dyn Registry>>,
    exception_listener: RwLock<Option<Arc<dyn ExceptionListener>>>,
    descriptor: RwLock<Option<Arc<dyn ServiceDescriptor>>>,

    initialised: AtomicBool,
    started: AtomicBool,
    disposed: AtomicBool,
    disposing: WaitableBool,
    connected: WaitableBool,
    connecting: WaitableBool,
    start_on_connect: AtomicBool,

    receivers: DashMap<String, Arc<MessageReceiver>>,
    dispatchers: RwLock<Option<Arc<DispatcherPool>>>,
    requesters: RwLock<Option<Arc<RequesterPool>>>,
    receiver_work: RwLock<Option<Arc<WorkManager>>>,
    dispatcher_work: RwLock<Option<Arc<WorkManager>>>,
    requester_work: RwLock<Option<Arc<WorkManager>>>,
    scheduler: RwLock<Option<Arc<Scheduler>>>,

    metrics: ConnectorMetrics,
    self_ref: Weak<Connector>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.name)
            .field("protocol", &self.protocol())
            .field("initialised", &self.is_initialised())
            .field("started", &self.is_started())
            .field("connected", &self.is_connected())
            .field("disposed", &self.is_disposed())
            .field("receivers", &self.receivers.len())
            .finish()
    }
}

impl Connector {
    /// Start building a connector named `name` on top of `transport`
    pub fn builder(
        name: impl Into<String>,
        transport: Box<dyn ConnectorTransport>,
    ) -> ConnectorBuilder {
        ConnectorBuilder {
            name: name.into(),
            config: ConnectorConfig::default(),
            transport,
            strategy: None,
            descriptors: None,
            notifications: None,
            registry: None,
            exception_listener: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ConnectorMetrics {
        &self.metrics
    }

    /// Strategy used when the connector itself connects
    pub fn connection_strategy(&self) -> &Arc<dyn ConnectionStrategy> {
        &self.strategy
    }

    /// Primary scheme, as reported by the transport
    pub fn protocol(&self) -> &str {
        self.transport.protocol()
    }

    /// The transport's own scheme plus any extra configured or declared ones
    pub fn supported_protocols(&self) -> Vec<String> {
        let mut protocols = vec![self.protocol().to_ascii_lowercase()];
        for protocol in self
            .transport
            .supported_protocols()
            .into_iter()
            .chain(self.config.supported_protocols.iter().cloned())
        {
            let protocol = protocol.to_ascii_lowercase();
            if !protocols.contains(&protocol) {
                protocols.push(protocol);
            }
        }
        protocols
    }

    /// Case-insensitive check against [`Connector::supported_protocols`]
    pub fn supports_protocol(&self, protocol: &str) -> bool {
        let protocol = protocol.to_ascii_lowercase();
        self.supported_protocols().iter().any(|p| *p == protocol)
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// True from the start of `dispose` on
    pub fn is_disposing(&self) -> bool {
        self.disposing.get()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.get()
    }

    /// Descriptor resolved by `initialise`, `None` before that
    pub fn service_descriptor(&self) -> Option<Arc<dyn ServiceDescriptor>> {
        self.descriptor.read().clone()
    }

    /// Replace the exception listener
    pub fn set_exception_listener(&self, listener: Arc<dyn ExceptionListener>) {
        *self.exception_listener.write() = Some(listener);
    }

    fn arc(&self) -> Result<Arc<Connector>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| ConnectorError::disposed(&self.name))
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(ConnectorError::disposed(format!("Connector '{}'", self.name)));
        }
        Ok(())
    }

    /// Retry context whose pauses end when the connector starts disposing
    pub fn retry_context(&self) -> RetryContext {
        RetryContext::new().with_shutdown(self.disposing.subscribe())
    }

    /// Fire-and-forget; a failing notification manager is only logged
    pub async fn fire_notification(&self, notification: Notification) {
        let action = notification.action;
        if let Err(e) = self.notifications.fire(notification).await {
            tracing::warn!(
                "Connector '{}' failed to fire {} notification: {}",
                self.name,
                action,
                e
            );
        }
    }

    /// Report a failure that has no caller to return to
    pub async fn handle_exception(&self, error: ConnectorError) {
        self.exception_thrown(error).await;
    }

    // ----- initialise / start / stop / dispose -----

    /// Resolve the service descriptor and build the dispatcher and requester
    /// pools. Pools or receivers left by an earlier failed attempt are
    /// disposed first. Fails with `AlreadyInitialised` the second time.
    pub async fn initialise(&self) -> Result<()> {
        self.ensure_not_disposed()?;
        if self.is_initialised() {
            return Err(ConnectorError::already_initialised(format!(
                "Connector '{}.{}'",
                self.protocol(),
                self.name
            )));
        }
        tracing::info!("Initialising connector '{}'", self.name);

        let descriptor = self.descriptors.lookup(self.protocol()).ok_or_else(|| {
            ConnectorError::configuration(
                format!("No service descriptor for protocol '{}'", self.protocol()),
                None,
            )
        })?;
        let dispatcher_factory = descriptor.dispatcher_factory()?;

        // left over from an earlier attempt that failed part-way
        self.close_pools().await;
        let stale: Vec<Arc<MessageReceiver>> = self.receivers();
        self.receivers.clear();
        for receiver in stale {
            receiver.dispose().await;
        }

        let dispatchers = Arc::new(KeyedPool::new(
            format!("{}.dispatchers", self.name),
            self.config.dispatcher_pool.clone(),
            Arc::new(DispatcherPoolFactory::new(self.self_ref.clone(), dispatcher_factory)),
        ));
        let requesters = descriptor.requester_factory().map(|factory| {
            Arc::new(KeyedPool::new(
                format!("{}.requesters", self.name),
                self.config.dispatcher_pool.clone(),
                Arc::new(RequesterPoolFactory::new(self.self_ref.clone(), factory)),
            ))
        });
        *self.dispatchers.write() = Some(dispatchers);
        *self.requesters.write() = requesters;
        *self.descriptor.write() = Some(descriptor);

        if let Err(e) = self.transport.do_initialise().await {
            tracing::error!("Failed to initialise connector '{}': {}", self.name, e);
            self.close_pools().await;
            *self.descriptor.write() = None;
            return Err(e);
        }
        self.initialised.store(true, Ordering::Release);

        if let Some(registry) = &self.registry {
            if let Err(e) = registry.register_connector(&self.name, self.protocol()).await {
                tracing::warn!("Failed to register connector '{}': {}", self.name, e);
            }
        }
        Ok(())
    }

    /// Start the transport and every registered receiver. A disconnected
    /// connector connects first and finishes starting once connected.
    pub async fn start(&self) -> Result<()> {
        self.ensure_not_disposed()?;
        if !self.is_initialised() {
            return Err(ConnectorError::not_initialised(format!("Connector '{}'", self.name)));
        }
        if self.is_started() {
            tracing::warn!("Connector '{}' is already started", self.name);
            return Ok(());
        }
        if !self.is_connected() {
            // finished by run_connect once the connection is up
            self.start_on_connect.store(true, Ordering::Release);
            return self.connect().await;
        }

        self.scheduler()?;
        self.transport.do_start().await?;
        self.started.store(true, Ordering::Release);

        for receiver in self.receivers() {
            receiver.start().await?;
        }
        tracing::info!("Started connector '{}'", self.name);
        Ok(())
    }

    /// Stop receivers and disconnect. Errors are logged.
    pub async fn stop(&self) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        self.stop_inner().await;
        if self.is_connected() {
            if let Err(e) = self.disconnect_inner().await {
                tracing::warn!("Failed to disconnect connector '{}': {}", self.name, e);
            }
        }
        Ok(())
    }

    async fn stop_inner(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.transport.do_stop().await {
            tracing::warn!("Transport stop failed for connector '{}': {}", self.name, e);
        }
        for receiver in self.receivers() {
            if let Err(e) = receiver.stop().await {
                tracing::warn!("Failed to stop receiver {}: {}", receiver.key(), e);
            }
        }
        let scheduler = self.scheduler.write().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
        }
        tracing::info!("Stopped connector '{}'", self.name);
    }

    /// Release everything. Calling this again has no effect.
    pub async fn dispose(&self) {
        if self.is_disposed() || !self.disposing.compare_and_set(false, true) {
            return;
        }
        tracing::info!("Disposing connector '{}'", self.name);

        if let Err(e) = self.stop().await {
            tracing::warn!("Failed to stop connector '{}' during dispose: {}", self.name, e);
        }

        let receivers = self.receivers();
        self.receivers.clear();
        for receiver in receivers {
            receiver.dispose().await;
        }
        self.close_pools().await;

        for slot in [&self.receiver_work, &self.dispatcher_work, &self.requester_work] {
            let work_manager = slot.write().take();
            if let Some(work_manager) = work_manager {
                work_manager.dispose();
            }
        }
        let scheduler = self.scheduler.write().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
        }

        self.transport.do_dispose().await;

        if let Some(registry) = &self.registry {
            if let Err(e) = registry.unregister_connector(&self.name).await {
                tracing::warn!("Failed to unregister connector '{}': {}", self.name, e);
            }
        }

        self.disposed.store(true, Ordering::Release);
        tracing::info!("Disposed connector '{}'", self.name);
    }

    async fn close_pools(&self) {
        let dispatchers = self.dispatchers.write().take();
        if let Some(pool) = dispatchers {
            pool.close().await;
        }
        let requesters = self.requesters.write().take();
        if let Some(pool) = requesters {
            pool.close().await;
        }
    }

    // ----- connect / disconnect -----

    /// Connect through the connector's strategy. With a threaded strategy
    /// this returns at once and a failure goes to the exception listener.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_not_disposed()?;
        if self.is_connected() {
            return Ok(());
        }
        if !self.connecting.compare_and_set(false, true) {
            self.connecting.wait_for(false).await;
            return if self.is_connected() {
                Ok(())
            } else {
                Err(ConnectorError::connect(
                    self.connection_description(),
                    "Concurrent connect attempt failed",
                ))
            };
        }

        if self.strategy.do_threading() {
            let connector = self.arc()?;
            let scheduled = self
                .receiver_work_manager()?
                .schedule_work(async move {
                    let ctx = connector.retry_context();
                    connector.run_connect(ctx, true).await
                })
                .await;
            if let Err(e) = scheduled {
                self.connecting.set(false);
                return Err(e);
            }
            return Ok(());
        }

        self.run_connect(self.retry_context(), true).await
    }

    /// Expects `connecting` to be set by the caller
    async fn run_connect(&self, mut ctx: RetryContext, resume_start: bool) -> Result<()> {
        let description = self.connection_description();
        let result = self.strategy.connect(self, &mut ctx).await;

        match result {
            Ok(()) => {
                self.connected.set(true);
                self.connecting.set(false);
                self.metrics.connects.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Connected: {}", description);
                self.fire_notification(Notification::new(
                    NotificationAction::ConnectionConnected,
                    description,
                ))
                .await;

                if resume_start && self.start_on_connect.swap(false, Ordering::AcqRel) {
                    self.resume_start().await?;
                }
                Ok(())
            }
            Err(e) => {
                self.connecting.set(false);
                self.metrics.connect_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Failed to connect {}: {}", description, e);
                self.fire_notification(
                    Notification::new(NotificationAction::ConnectionFailed, description)
                        .with_detail(e.to_string()),
                )
                .await;
                Err(e)
            }
        }
    }

    fn resume_start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.start())
    }

    /// Connect from inside another object's connect attempt. One uncounted
    /// attempt is made; the caller's strategy does the retrying.
    pub async fn connect_nested(&self, parent: &RetryContext) -> Result<()> {
        self.ensure_not_disposed()?;
        if self.is_connected() {
            return Ok(());
        }
        if !self.connecting.compare_and_set(false, true) {
            self.connecting.wait_for(false).await;
            if self.is_connected() {
                return Ok(());
            }
            return Err(ConnectorError::connect(
                self.connection_description(),
                "Connector is not connected",
            ));
        }
        self.run_connect(parent.reentrant(), false).await
    }

    /// Stop, then disconnect. A later connect resumes the started state.
    pub async fn disconnect(&self) -> Result<()> {
        self.start_on_connect
            .store(self.is_started(), Ordering::Release);
        self.stop_inner().await;
        self.disconnect_inner().await
    }

    async fn disconnect_inner(&self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let result = self.transport.do_disconnect().await;
        self.connected.set(false);

        let description = self.connection_description();
        tracing::info!("Disconnected: {}", description);
        self.fire_notification(Notification::new(
            NotificationAction::ConnectionDisconnected,
            description,
        ))
        .await;
        result
    }

    // ----- shared resources -----

    fn work_manager(
        &self,
        slot: &RwLock<Option<Arc<WorkManager>>>,
        kind: &str,
        profile: &ThreadingProfile,
    ) -> Result<Arc<WorkManager>> {
        if self.is_disposed() {
            return Err(ConnectorError::disposed(format!("Connector '{}'", self.name)));
        }
        if let Some(work_manager) = slot.read().as_ref() {
            return Ok(work_manager.clone());
        }
        let mut slot = slot.write();
        let listener: Weak<dyn ExceptionListener> = self.self_ref.clone();
        let work_manager = slot.get_or_insert_with(|| {
            Arc::new(
                WorkManager::new(format!("{}.{}", self.name, kind), profile.clone())
                    .with_exception_listener(listener),
            )
        });
        Ok(work_manager.clone())
    }

    /// Work manager for receiver connects and worker batches, created on
    /// first use
    pub fn receiver_work_manager(&self) -> Result<Arc<WorkManager>> {
        self.work_manager(&self.receiver_work, "receiver", &self.config.receiver_threading)
    }

    /// Work manager for threaded dispatches
    pub fn dispatcher_work_manager(&self) -> Result<Arc<WorkManager>> {
        self.work_manager(&self.dispatcher_work, "dispatcher", &self.config.dispatcher_threading)
    }

    /// Work manager pooled requests run on
    pub fn requester_work_manager(&self) -> Result<Arc<WorkManager>> {
        self.work_manager(&self.requester_work, "requester", &self.config.requester_threading)
    }

    /// The polling scheduler, created on first use after a stop
    pub fn scheduler(&self) -> Result<Arc<Scheduler>> {
        if self.is_disposed() || self.is_disposing() {
            return Err(ConnectorError::disposed(format!("Connector '{}'", self.name)));
        }
        if let Some(scheduler) = self.scheduler.read().as_ref() {
            return Ok(scheduler.clone());
        }
        let mut slot = self.scheduler.write();
        let scheduler = slot.get_or_insert_with(|| {
            Arc::new(Scheduler::new(format!("{}.scheduler", self.name)))
        });
        Ok(scheduler.clone())
    }

    // ----- receivers -----

    /// Create and store the receiver for `endpoint`. It is started at once
    /// when the connector is already started.
    pub async fn register_listener(
        &self,
        component: Arc<dyn Component>,
        endpoint: Arc<Endpoint>,
    ) -> Result<Arc<MessageReceiver>> {
        self.ensure_not_disposed()?;
        let connector = self.arc()?;
        let descriptor = self
            .service_descriptor()
            .ok_or_else(|| ConnectorError::not_initialised(format!("Connector '{}'", self.name)))?;

        let key = endpoint.receiver_key();
        let receiver = match self.receivers.entry(key.clone()) {
            Entry::Occupied(_) => return Err(ConnectorError::ListenerAlreadyRegistered { key }),
            Entry::Vacant(vacant) => {
                let receiver = descriptor.create_receiver(&connector, component, endpoint)?;
                vacant.insert(receiver.clone());
                receiver
            }
        };
        tracing::debug!("Registered receiver {} on connector '{}'", key, self.name);

        if self.is_started() {
            receiver.start().await?;
        }
        Ok(receiver)
    }

    /// Remove and dispose the receiver `component` has for `endpoint`
    pub async fn unregister_listener(
        &self,
        component: &dyn Component,
        endpoint: &Endpoint,
    ) -> Result<()> {
        let key = endpoint.receiver_key();
        let removed = self
            .receivers
            .remove_if(&key, |_, receiver| receiver.component().name() == component.name());
        match removed {
            Some((_, receiver)) => {
                receiver.dispose().await;
                tracing::debug!("Unregistered receiver {} from connector '{}'", key, self.name);
            }
            None => tracing::debug!(
                "No receiver {} for component '{}' on connector '{}'",
                key,
                component.name(),
                self.name
            ),
        }
        Ok(())
    }

    /// Snapshot of the registered receivers
    pub fn receivers(&self) -> Vec<Arc<MessageReceiver>> {
        self.receivers.iter().map(|r| r.value().clone()).collect()
    }

    /// Receiver registered under `key`, see [`Endpoint::receiver_key`]
    pub fn lookup_receiver(&self, key: &str) -> Option<Arc<MessageReceiver>> {
        self.receivers.get(key).map(|r| r.value().clone())
    }

    /// Receivers whose key matches `pattern`: case-insensitive, with a
    /// leading and/or trailing `*`, comma-separated alternatives
    pub fn receivers_matching(&self, pattern: &str) -> Vec<Arc<MessageReceiver>> {
        let patterns: Vec<String> = pattern
            .split(',')
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        self.receivers
            .iter()
            .filter(|r| {
                let key = r.key().to_ascii_lowercase();
                patterns.iter().any(|p| wildcard_match(p, &key))
            })
            .map(|r| r.value().clone())
            .collect()
    }

    // ----- outbound -----

    fn dispatcher_pool(&self) -> Result<Arc<DispatcherPool>> {
        self.dispatchers
            .read()
            .clone()
            .ok_or_else(|| ConnectorError::not_initialised(format!("Connector '{}'", self.name)))
    }

    fn requester_pool(&self) -> Result<Arc<RequesterPool>> {
        self.requesters.read().clone().ok_or_else(|| {
            ConnectorError::configuration(
                format!("Connector '{}' does not support requests", self.name),
                None,
            )
        })
    }

    fn check_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        self.ensure_not_disposed()?;
        if !self.is_initialised() {
            return Err(ConnectorError::not_initialised(format!("Connector '{}'", self.name)));
        }
        if !self.supports_protocol(endpoint.protocol()) {
            return Err(ConnectorError::UnsupportedProtocol {
                protocol: endpoint.protocol().to_string(),
                connector: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Borrow a dispatcher for `endpoint`
    pub async fn dispatcher(&self, endpoint: &Arc<Endpoint>) -> Result<Arc<MessageDispatcher>> {
        self.check_endpoint(endpoint)?;
        self.dispatcher_pool()?.borrow(endpoint).await
    }

    /// Give a dispatcher back; the pool discards it if it is broken
    pub async fn return_dispatcher(
        &self,
        endpoint: &Arc<Endpoint>,
        dispatcher: Arc<MessageDispatcher>,
    ) {
        match self.dispatcher_pool() {
            Ok(pool) => pool.return_object(endpoint, dispatcher).await,
            Err(_) => dispatcher.dispose().await,
        }
    }

    /// Borrow a requester for `endpoint`. Fails with `Configuration` when the
    /// descriptor has no requester factory.
    pub async fn requester(&self, endpoint: &Arc<Endpoint>) -> Result<Arc<MessageRequester>> {
        self.check_endpoint(endpoint)?;
        self.requester_pool()?.borrow(endpoint).await
    }

    /// Give a requester back; the pool discards it if it is broken
    pub async fn return_requester(
        &self,
        endpoint: &Arc<Endpoint>,
        requester: Arc<MessageRequester>,
    ) {
        match self.requester_pool() {
            Ok(pool) => pool.return_object(endpoint, requester).await,
            Err(_) => requester.dispose().await,
        }
    }

    /// Fire-and-forget dispatch through a pooled dispatcher. A scheduled
    /// dispatch returns the dispatcher to the pool when its worker is done.
    pub async fn dispatch(&self, event: Event) -> Result<DispatchHandle> {
        let endpoint = event.endpoint().clone();
        let dispatcher = self.dispatcher(&endpoint).await?;
        let pool = match self.dispatcher_pool() {
            Ok(pool) => pool,
            Err(e) => {
                dispatcher.dispose().await;
                return Err(e);
            }
        };
        dispatcher
            .dispatch_pooled(event, PoolReturn::new(pool, endpoint))
            .await
    }

    /// Synchronous send through a pooled dispatcher
    pub async fn send(&self, event: Event) -> Result<Option<Arc<Message>>> {
        let endpoint = event.endpoint().clone();
        let dispatcher = self.dispatcher(&endpoint).await?;
        let result = dispatcher.send(event).await;
        self.return_dispatcher(&endpoint, dispatcher).await;
        result
    }

    /// Pull one message through a pooled dispatcher, `Ok(None)` on timeout
    pub async fn receive(
        &self,
        endpoint: &Arc<Endpoint>,
        timeout: Duration,
    ) -> Result<Option<Arc<Message>>> {
        let dispatcher = self.dispatcher(endpoint).await?;
        let result = dispatcher.receive(timeout).await;
        self.return_dispatcher(endpoint, dispatcher).await;
        result
    }

    /// Pull one message through a pooled requester. With requester threading
    /// on, the pull runs on the requester work manager, which bounds how many
    /// requests are in flight at once.
    pub async fn request(
        &self,
        endpoint: &Arc<Endpoint>,
        timeout: Duration,
    ) -> Result<Option<Arc<Message>>> {
        let requester = self.requester(endpoint).await?;
        let result = if self.config.requester_threading.do_threading {
            self.request_on_worker(&requester, timeout).await
        } else {
            requester.request(timeout).await
        };
        self.return_requester(endpoint, requester).await;
        result
    }

    async fn request_on_worker(
        &self,
        requester: &Arc<MessageRequester>,
        timeout: Duration,
    ) -> Result<Option<Arc<Message>>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let worker = requester.clone();
        self.requester_work_manager()?
            .schedule_work(async move {
                let result = worker.request(timeout).await;
                if let Ok(Some(message)) = &result {
                    // the caller becomes the message's owner
                    message.reset_access_control();
                }
                tx.send(result).ok();
                Ok(())
            })
            .await?;

        rx.await.map_err(|_| {
            ConnectorError::receive(
                requester.endpoint().key(),
                "Request worker finished without a result",
            )
        })?
    }

    /// The dispatcher pool, `None` before `initialise` and after `dispose`
    pub fn dispatchers(&self) -> Option<Arc<DispatcherPool>> {
        self.dispatchers.read().clone()
    }
}

fn wildcard_match(pattern: &str, key: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let leading = pattern.starts_with('*');
    let trailing = pattern.len() > 1 && pattern.ends_with('*');
    let core = pattern.trim_start_matches('*').trim_end_matches('*');
    match (leading, trailing) {
        (true, true) => key.contains(core),
        (true, false) => key.ends_with(core),
        (false, true) => key.starts_with(core),
        (false, false) => key == core,
    }
}

#[async_trait]
impl Connectable for Connector {
    async fn attempt_connect(&self, _ctx: &RetryContext) -> Result<()> {
        self.metrics
            .connection_attempts
            .fetch_add(1, Ordering::Relaxed);
        self.transport.do_connect().await
    }

    fn connection_description(&self) -> String {
        format!("connector '{}' ({})", self.name, self.protocol())
    }
}

#[async_trait]
impl ExceptionListener for Connector {
    async fn exception_thrown(&self, error: ConnectorError) {
        self.metrics.exceptions.fetch_add(1, Ordering::Relaxed);
        let listener = self.exception_listener.read().clone();
        match listener {
            Some(listener) => listener.exception_thrown(error).await,
            None => tracing::error!("Connector '{}' caught exception: {}", self.name, error),
        }
    }
}
