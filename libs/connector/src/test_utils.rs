//! Test doubles for connectors, transports and routing
//!
//! Used by the unit tests of this crate and by the integration tests under
//! `tests/`. Every double records what happened to it so tests can assert on
//! counts instead of timing.

use crate::connectable::{Connectable, ExceptionListener};
use crate::connector::{Connector, ConnectorTransport};
use crate::descriptor::ServiceDescriptor;
use crate::dispatcher::{DispatcherTransport, MessageDispatcherFactory};
use crate::endpoint::{Endpoint, EndpointUri};
use crate::event::Event;
use crate::filter::{Filter, SecurityFilter, Transformer};
use crate::message::{ExceptionPayload, Message, REMOTE_SYNC_PROPERTY};
use crate::notification::{Notification, NotificationAction, NotificationManager};
use crate::receiver::{MessageReceiver, ReceiverTransport, TransactedPoller};
use crate::requester::{MessageRequesterFactory, RequesterTransport};
use crate::retry::RetryContext;
use crate::routing::{Component, InboundRouter, ResponseRouter};
use crate::transaction::{Transaction, TransactionFactory};
use crate::{ConnectorError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Endpoint on the `test` protocol
pub fn endpoint(address: &str) -> Arc<Endpoint> {
    Endpoint::builder(EndpointUri::new("test", address)).build()
}

// ----- connection targets -----

/// Connection target that refuses a configurable number of attempts
#[derive(Debug)]
pub struct FlakyConnectable {
    failures: u32,
    fatal: bool,
    attempts: AtomicU32,
}

impl FlakyConnectable {
    /// Fail the first `failures` attempts, then succeed
    pub fn failing_first(failures: u32) -> Self {
        Self {
            failures,
            fatal: false,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    /// Every attempt fails with a non-retryable error
    pub fn fatal() -> Self {
        Self {
            failures: u32::MAX,
            fatal: true,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connectable for FlakyConnectable {
    async fn attempt_connect(&self, _ctx: &RetryContext) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fatal {
            return Err(ConnectorError::fatal_connect(
                "flaky",
                format!("attempt {} refused for good", attempt),
            ));
        }
        if attempt <= self.failures {
            return Err(ConnectorError::connect(
                "flaky",
                format!("attempt {} refused", attempt),
            ));
        }
        Ok(())
    }

    fn connection_description(&self) -> String {
        "flaky".to_string()
    }
}

/// Exception listener that keeps every error it is handed
#[derive(Debug, Default)]
pub struct RecordingExceptionListener {
    errors: Mutex<Vec<String>>,
}

impl RecordingExceptionListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

#[async_trait]
impl ExceptionListener for RecordingExceptionListener {
    async fn exception_thrown(&self, error: ConnectorError) {
        self.errors.lock().push(error.to_string());
    }
}

// ----- transactions -----

#[derive(Debug, Default)]
struct TransactionCounts {
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
}

/// Transaction factory counting begins, commits and rollbacks
#[derive(Debug, Default)]
pub struct CountingTransactionFactory {
    counts: Arc<TransactionCounts>,
}

impl CountingTransactionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begun(&self) -> usize {
        self.counts.begun.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> usize {
        self.counts.committed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> usize {
        self.counts.rolled_back.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionFactory for CountingTransactionFactory {
    async fn begin(&self) -> Result<Arc<dyn Transaction>> {
        self.counts.begun.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(CountingTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            rollback_only: AtomicBool::new(false),
            counts: self.counts.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct CountingTransaction {
    id: String,
    rollback_only: AtomicBool,
    counts: Arc<TransactionCounts>,
}

#[async_trait]
impl Transaction for CountingTransaction {
    fn id(&self) -> &str {
        &self.id
    }

    async fn commit(&self) -> Result<()> {
        self.counts.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.counts.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }
}

// ----- connector transport -----

/// Counters shared between a mock transport and the test holding it
#[derive(Debug, Default)]
pub struct TransportStats {
    pub initialise_attempts: AtomicU32,
    pub connect_attempts: AtomicU32,
    pub connects: AtomicU32,
    pub disconnects: AtomicU32,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
    pub disposes: AtomicU32,
}

pub struct MockConnectorTransport {
    protocol: String,
    failures: u32,
    initialise_failures: u32,
    stats: Arc<TransportStats>,
}

impl MockConnectorTransport {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            failures: 0,
            initialise_failures: 0,
            stats: Arc::new(TransportStats::default()),
        }
    }

    /// Refuse the first `failures` connect attempts
    pub fn failing_first(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing_first(u32::MAX)
    }

    /// Fail the first `failures` calls to `do_initialise`
    pub fn failing_initialise(mut self, failures: u32) -> Self {
        self.initialise_failures = failures;
        self
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl ConnectorTransport for MockConnectorTransport {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn do_initialise(&self) -> Result<()> {
        let attempt = self.stats.initialise_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.initialise_failures {
            return Err(ConnectorError::transport("broker metadata unavailable"));
        }
        Ok(())
    }

    async fn do_connect(&self) -> Result<()> {
        let attempt = self.stats.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(ConnectorError::connect(
                &self.protocol,
                format!("broker refused attempt {}", attempt),
            ));
        }
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_disconnect(&self) -> Result<()> {
        self.stats.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_start(&self) -> Result<()> {
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_stop(&self) -> Result<()> {
        self.stats.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_dispose(&self) {
        self.stats.disposes.fetch_add(1, Ordering::SeqCst);
    }
}

// ----- outbound -----

/// Counters and switches shared by every dispatcher a factory creates
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub created: AtomicU32,
    pub connects: AtomicU32,
    pub dispatched: AtomicU32,
    pub sent: AtomicU32,
    pub validations: AtomicU32,
    pub disposed: AtomicU32,
    pub broken: AtomicBool,
    pub fail_sends: AtomicBool,
    pub fail_dispatches: AtomicBool,
    inbound: Mutex<VecDeque<Arc<Message>>>,
}

impl DispatcherStats {
    /// Queue a message for `receive`
    pub fn push_inbound(&self, message: Message) {
        self.inbound.lock().push_back(Arc::new(message));
    }
}

#[derive(Debug, Default)]
pub struct MockDispatcherFactory {
    stats: Arc<DispatcherStats>,
    per_request: bool,
}

impl MockDispatcherFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn per_request(mut self) -> Self {
        self.per_request = true;
        self
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl MessageDispatcherFactory for MockDispatcherFactory {
    async fn create(&self, _endpoint: &Arc<Endpoint>) -> Result<Box<dyn DispatcherTransport>> {
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockDispatcher {
            stats: self.stats.clone(),
        }))
    }

    fn create_per_request(&self) -> bool {
        self.per_request
    }
}

pub struct MockDispatcher {
    stats: Arc<DispatcherStats>,
}

#[async_trait]
impl DispatcherTransport for MockDispatcher {
    async fn do_connect(&self) -> Result<()> {
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn do_dispatch(&self, _event: &Event) -> Result<()> {
        if self.stats.fail_dispatches.load(Ordering::SeqCst) {
            return Err(ConnectorError::transport("broker refused the message"));
        }
        self.stats.dispatched.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Replies with a copy of the payload, marked remote-sync the way a
    /// request/reply transport would
    async fn do_send(&self, event: &Event) -> Result<Option<Arc<Message>>> {
        if self.stats.fail_sends.load(Ordering::SeqCst) {
            return Err(ConnectorError::transport("peer closed the channel"));
        }
        self.stats.sent.fetch_add(1, Ordering::SeqCst);
        let reply = Message::new(event.message().payload());
        reply.set_property(REMOTE_SYNC_PROPERTY, true)?;
        Ok(Some(Arc::new(reply)))
    }

    async fn do_receive(&self, _timeout: Duration) -> Result<Option<Arc<Message>>> {
        Ok(self.stats.inbound.lock().pop_front())
    }

    async fn do_dispose(&self) {
        self.stats.disposed.fetch_add(1, Ordering::SeqCst);
    }

    fn validate(&self) -> bool {
        self.stats.validations.fetch_add(1, Ordering::SeqCst);
        !self.stats.broken.load(Ordering::SeqCst)
    }
}

/// Requester factory serving messages from a shared queue
#[derive(Debug, Default)]
pub struct MockRequesterFactory {
    queue: Arc<Mutex<VecDeque<Arc<Message>>>>,
    requested: Arc<AtomicU32>,
}

impl MockRequesterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        self.queue.lock().push_back(Arc::new(message));
    }

    pub fn requested(&self) -> u32 {
        self.requested.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageRequesterFactory for MockRequesterFactory {
    async fn create(&self, _endpoint: &Arc<Endpoint>) -> Result<Box<dyn RequesterTransport>> {
        Ok(Box::new(MockRequester {
            queue: self.queue.clone(),
            requested: self.requested.clone(),
        }))
    }
}

struct MockRequester {
    queue: Arc<Mutex<VecDeque<Arc<Message>>>>,
    requested: Arc<AtomicU32>,
}

#[async_trait]
impl RequesterTransport for MockRequester {
    async fn do_connect(&self) -> Result<()> {
        Ok(())
    }

    async fn do_disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn do_request(&self, _timeout: Duration) -> Result<Option<Arc<Message>>> {
        self.requested.fetch_add(1, Ordering::SeqCst);
        Ok(self.queue.lock().pop_front())
    }
}

// ----- inbound -----

/// Receiver transport that only counts lifecycle calls
#[derive(Debug, Default)]
pub struct MockReceiverTransport {
    pub connects: AtomicU32,
    pub disconnects: AtomicU32,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
}

#[async_trait]
impl ReceiverTransport for MockReceiverTransport {
    async fn do_connect(&self, _receiver: &Arc<MessageReceiver>) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_disconnect(&self, _receiver: &Arc<MessageReceiver>) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_start(&self, _receiver: &Arc<MessageReceiver>) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_stop(&self, _receiver: &Arc<MessageReceiver>) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Transacted poller draining a shared queue of text items
#[derive(Debug, Default)]
pub struct QueuePoller {
    queue: Mutex<VecDeque<String>>,
    processed: Mutex<Vec<(String, Option<String>)>>,
}

impl QueuePoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: impl Into<String>) {
        self.queue.lock().push_back(item.into());
    }

    /// Items processed so far with the id of the transaction they ran in
    pub fn processed(&self) -> Vec<(String, Option<String>)> {
        self.processed.lock().clone()
    }
}

#[async_trait]
impl TransactedPoller for QueuePoller {
    type Item = String;

    async fn get_messages(&self, _receiver: &Arc<MessageReceiver>) -> Result<Vec<String>> {
        Ok(self.queue.lock().drain(..).collect())
    }

    async fn process_message(
        &self,
        receiver: &Arc<MessageReceiver>,
        item: String,
        transaction: Option<Arc<dyn Transaction>>,
    ) -> Result<()> {
        let tx_id = transaction.as_ref().map(|tx| tx.id().to_string());
        receiver
            .route_message_with(Arc::new(Message::new(item.as_str())), transaction, false)
            .await?;
        self.processed.lock().push((item, tx_id));
        Ok(())
    }
}

fn mock_receiver(
    connector: &Arc<Connector>,
    component: Arc<dyn Component>,
    endpoint: Arc<Endpoint>,
) -> Result<Arc<MessageReceiver>> {
    Ok(MessageReceiver::new(
        connector,
        component,
        endpoint,
        Arc::new(MockReceiverTransport::default()),
    ))
}

type ReceiverFactory = dyn Fn(
        &Arc<Connector>,
        Arc<dyn Component>,
        Arc<Endpoint>,
    ) -> Result<Arc<MessageReceiver>>
    + Send
    + Sync;

/// Descriptor wiring the mock transports together
pub struct StaticDescriptor {
    protocol: String,
    dispatchers: Arc<dyn MessageDispatcherFactory>,
    requesters: Option<Arc<dyn MessageRequesterFactory>>,
    receivers: Arc<ReceiverFactory>,
    transformers: Vec<Arc<dyn Transformer>>,
    error_codes: Option<(String, HashMap<String, String>)>,
}

impl StaticDescriptor {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            dispatchers: Arc::new(MockDispatcherFactory::new()),
            requesters: None,
            receivers: Arc::new(mock_receiver),
            transformers: Vec::new(),
            error_codes: None,
        }
    }

    pub fn with_dispatcher_factory(mut self, factory: Arc<dyn MessageDispatcherFactory>) -> Self {
        self.dispatchers = factory;
        self
    }

    pub fn with_requester_factory(mut self, factory: Arc<dyn MessageRequesterFactory>) -> Self {
        self.requesters = Some(factory);
        self
    }

    pub fn with_receiver_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Arc<Connector>, Arc<dyn Component>, Arc<Endpoint>) -> Result<Arc<MessageReceiver>>
            + Send
            + Sync
            + 'static,
    {
        self.receivers = Arc::new(factory);
        self
    }

    pub fn with_default_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// Map error kind `kind` to `code`, stamped under `property`
    pub fn with_error_code(mut self, property: &str, kind: &str, code: &str) -> Self {
        let (_, codes) = self
            .error_codes
            .get_or_insert_with(|| (property.to_string(), HashMap::new()));
        codes.insert(kind.to_string(), code.to_string());
        self
    }
}

impl ServiceDescriptor for StaticDescriptor {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn dispatcher_factory(&self) -> Result<Arc<dyn MessageDispatcherFactory>> {
        Ok(self.dispatchers.clone())
    }

    fn requester_factory(&self) -> Option<Arc<dyn MessageRequesterFactory>> {
        self.requesters.clone()
    }

    fn create_receiver(
        &self,
        connector: &Arc<Connector>,
        component: Arc<dyn Component>,
        endpoint: Arc<Endpoint>,
    ) -> Result<Arc<MessageReceiver>> {
        (self.receivers)(connector, component, endpoint)
    }

    fn default_response_transformers(&self) -> Vec<Arc<dyn Transformer>> {
        self.transformers.clone()
    }

    fn error_code_property(&self) -> Option<&str> {
        self.error_codes.as_ref().map(|(property, _)| property.as_str())
    }

    fn error_code_for(&self, kind: &str) -> Option<String> {
        self.error_codes
            .as_ref()
            .and_then(|(_, codes)| codes.get(kind).cloned())
    }
}

// ----- notifications and routing -----

#[derive(Debug, Default)]
pub struct RecordingNotifications {
    fired: Mutex<Vec<Notification>>,
}

impl RecordingNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<NotificationAction> {
        self.fired.lock().iter().map(|n| n.action).collect()
    }

    pub fn count(&self, action: NotificationAction) -> usize {
        self.fired.lock().iter().filter(|n| n.action == action).count()
    }

    pub fn all(&self) -> Vec<Notification> {
        self.fired.lock().clone()
    }
}

#[async_trait]
impl NotificationManager for RecordingNotifications {
    async fn fire(&self, notification: Notification) -> Result<()> {
        self.fired.lock().push(notification);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterReply {
    /// No result
    Nothing,
    /// The routed message itself
    Echo,
    /// A result carrying an exception payload of the given kind
    Failure(&'static str),
    /// Routing fails
    Error,
}

/// Inbound and response router keeping what it was given
#[derive(Debug)]
pub struct RecordingRouter {
    reply: RouterReply,
    routed: Mutex<Vec<Event>>,
}

impl RecordingRouter {
    pub fn new(reply: RouterReply) -> Self {
        Self {
            reply,
            routed: Mutex::new(Vec::new()),
        }
    }

    pub fn routed(&self) -> Vec<Event> {
        self.routed.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.routed.lock().len()
    }
}

#[async_trait]
impl InboundRouter for RecordingRouter {
    async fn route(&self, event: Event) -> Result<Option<Arc<Message>>> {
        let message = event.message().clone();
        self.routed.lock().push(event);
        match self.reply {
            RouterReply::Nothing => Ok(None),
            RouterReply::Echo => Ok(Some(message)),
            RouterReply::Failure(kind) => {
                let result = Message::builder("failed")
                    .exception_payload(ExceptionPayload {
                        kind: kind.to_string(),
                        message: "component failed".to_string(),
                        code: None,
                    })
                    .build();
                Ok(Some(Arc::new(result)))
            }
            RouterReply::Error => Err(ConnectorError::routing_with_source(
                "component rejected the event",
                ConnectorError::transport("downstream unavailable"),
            )),
        }
    }
}

#[async_trait]
impl ResponseRouter for RecordingRouter {
    async fn route(&self, event: Event) -> Result<()> {
        self.routed.lock().push(event);
        Ok(())
    }
}

#[derive(Debug)]
pub struct TestComponent {
    name: String,
    inbound: Arc<RecordingRouter>,
    response: Option<Arc<RecordingRouter>>,
}

impl TestComponent {
    /// Component whose router returns nothing
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_reply(name, RouterReply::Nothing)
    }

    pub fn with_reply(name: impl Into<String>, reply: RouterReply) -> Self {
        Self {
            name: name.into(),
            inbound: Arc::new(RecordingRouter::new(reply)),
            response: None,
        }
    }

    pub fn with_response_router(mut self) -> Self {
        self.response = Some(Arc::new(RecordingRouter::new(RouterReply::Nothing)));
        self
    }

    pub fn inbound(&self) -> &Arc<RecordingRouter> {
        &self.inbound
    }

    pub fn response(&self) -> Option<&Arc<RecordingRouter>> {
        self.response.as_ref()
    }
}

impl Component for TestComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn inbound_router(&self) -> Arc<dyn InboundRouter> {
        self.inbound.clone()
    }

    fn response_router(&self) -> Option<Arc<dyn ResponseRouter>> {
        self.response
            .clone()
            .map(|router| router as Arc<dyn ResponseRouter>)
    }
}

// ----- filters -----

/// Accepts messages carrying the named property
#[derive(Debug)]
pub struct PropertyFilter(pub &'static str);

impl Filter for PropertyFilter {
    fn accept(&self, message: &Message) -> bool {
        message.property(self.0).is_some()
    }
}

/// Security filter rejecting every event
#[derive(Debug, Default)]
pub struct DenyAllSecurityFilter;

#[async_trait]
impl SecurityFilter for DenyAllSecurityFilter {
    async fn authenticate(&self, event: &Event) -> Result<()> {
        Err(ConnectorError::unauthorised(
            event.endpoint().key(),
            "no credentials",
        ))
    }
}

/// Sets a boolean property named after the transformer
#[derive(Debug)]
pub struct MarkingTransformer {
    name: String,
    accepts_null: bool,
}

impl MarkingTransformer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            accepts_null: false,
        }
    }

    pub fn accepting_null(mut self) -> Self {
        self.accepts_null = true;
        self
    }
}

impl Transformer for MarkingTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts_null(&self) -> bool {
        self.accepts_null
    }

    fn transform(&self, message: &Message) -> Result<()> {
        message.set_property(self.name.clone(), true)
    }
}
