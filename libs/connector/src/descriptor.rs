//! Service descriptors: what a transport plugs into a connector
//!
//! A connector looks its descriptor up by protocol when it is initialised.
//! The descriptor supplies the dispatcher and requester factories, the
//! receiver constructor, the session handler, the message adapter and the
//! transport's error-code mapping.

use crate::connector::Connector;
use crate::dispatcher::MessageDispatcherFactory;
use crate::endpoint::Endpoint;
use crate::filter::Transformer;
use crate::message::{Message, Payload};
use crate::receiver::MessageReceiver;
use crate::requester::MessageRequesterFactory;
use crate::routing::{Component, Session};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

pub trait ServiceDescriptor: Send + Sync {
    fn protocol(&self) -> &str;

    fn dispatcher_factory(&self) -> Result<Arc<dyn MessageDispatcherFactory>>;

    /// `None` when the transport cannot be polled on request
    fn requester_factory(&self) -> Option<Arc<dyn MessageRequesterFactory>> {
        None
    }

    fn create_receiver(
        &self,
        connector: &Arc<Connector>,
        component: Arc<dyn Component>,
        endpoint: Arc<Endpoint>,
    ) -> Result<Arc<MessageReceiver>>;

    fn session_handler(&self) -> Arc<dyn SessionHandler> {
        Arc::new(NullSessionHandler)
    }

    fn message_adapter(&self) -> Arc<dyn MessageAdapter> {
        Arc::new(DefaultMessageAdapter)
    }

    /// Applied to results of endpoints that declare no response transformers
    fn default_response_transformers(&self) -> Vec<Arc<dyn Transformer>> {
        Vec::new()
    }

    /// Property that carries the transport error code on failed results
    fn error_code_property(&self) -> Option<&str> {
        None
    }

    /// Transport error code for a [`ConnectorError::kind`](crate::ConnectorError::kind)
    fn error_code_for(&self, _kind: &str) -> Option<String> {
        None
    }
}

pub trait DescriptorLookup: Send + Sync {
    fn lookup(&self, protocol: &str) -> Option<Arc<dyn ServiceDescriptor>>;
}

/// Fixed protocol to descriptor table
#[derive(Default, Clone)]
pub struct StaticDescriptorLookup {
    descriptors: HashMap<String, Arc<dyn ServiceDescriptor>>,
}

impl StaticDescriptorLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, descriptor: Arc<dyn ServiceDescriptor>) -> Self {
        self.descriptors
            .insert(descriptor.protocol().to_ascii_lowercase(), descriptor);
        self
    }
}

impl DescriptorLookup for StaticDescriptorLookup {
    fn lookup(&self, protocol: &str) -> Option<Arc<dyn ServiceDescriptor>> {
        self.descriptors.get(&protocol.to_ascii_lowercase()).cloned()
    }
}

/// Runtime registry connectors announce themselves to
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register_connector(&self, name: &str, protocol: &str) -> Result<()>;

    async fn unregister_connector(&self, name: &str) -> Result<()>;
}

/// Recovers conversation state carried by an inbound message
pub trait SessionHandler: Send + Sync {
    fn retrieve_session(&self, message: &Message, component: &str) -> Result<Session>;
}

/// Starts a fresh session for every message
#[derive(Debug, Default, Clone)]
pub struct NullSessionHandler;

impl SessionHandler for NullSessionHandler {
    fn retrieve_session(&self, _message: &Message, component: &str) -> Result<Session> {
        Ok(Session::new(Some(component)))
    }
}

/// Wraps transport-native payloads as messages
pub trait MessageAdapter: Send + Sync {
    fn adapt(&self, payload: Payload) -> Result<Message>;
}

#[derive(Debug, Default, Clone)]
pub struct DefaultMessageAdapter;

impl MessageAdapter for DefaultMessageAdapter {
    fn adapt(&self, payload: Payload) -> Result<Message> {
        Ok(Message::new(payload))
    }
}

/// Raw data a receiver worker can turn into a message
pub trait IntoMessage {
    fn into_message(self, adapter: &dyn MessageAdapter) -> Result<Message>;
}

impl IntoMessage for Message {
    fn into_message(self, _adapter: &dyn MessageAdapter) -> Result<Message> {
        Ok(self)
    }
}

impl IntoMessage for Payload {
    fn into_message(self, adapter: &dyn MessageAdapter) -> Result<Message> {
        adapter.adapt(self)
    }
}

impl IntoMessage for Bytes {
    fn into_message(self, adapter: &dyn MessageAdapter) -> Result<Message> {
        adapter.adapt(Payload::Bytes(self))
    }
}

impl IntoMessage for Vec<u8> {
    fn into_message(self, adapter: &dyn MessageAdapter) -> Result<Message> {
        adapter.adapt(Payload::from(self))
    }
}

impl IntoMessage for String {
    fn into_message(self, adapter: &dyn MessageAdapter) -> Result<Message> {
        adapter.adapt(Payload::Text(self))
    }
}

impl IntoMessage for serde_json::Value {
    fn into_message(self, adapter: &dyn MessageAdapter) -> Result<Message> {
        adapter.adapt(Payload::Json(self))
    }
}
