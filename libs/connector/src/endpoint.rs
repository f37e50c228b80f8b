//! Endpoint descriptions
//!
//! An endpoint is immutable once built and shared as `Arc<Endpoint>` between
//! the connector, its receivers and pooled dispatchers. Parsing endpoint
//! URIs from text belongs to the embedding runtime; this crate only carries
//! the already-resolved parts.

use crate::filter::{Filter, SecurityFilter, Transformer};
use crate::retry::{ConnectionStrategy, SingleAttempt};
use crate::transaction::TransactionConfig;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Resolved address of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointUri {
    scheme: String,
    address: String,
    filter_address: Option<String>,
}

impl EndpointUri {
    pub fn new(scheme: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            address: address.into(),
            filter_address: None,
        }
    }

    /// Narrower address receivers register under, e.g. a topic selector
    pub fn with_filter_address(mut self, filter_address: impl Into<String>) -> Self {
        self.filter_address = Some(filter_address.into());
        self
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn filter_address(&self) -> Option<&str> {
        self.filter_address.as_deref()
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointType {
    #[default]
    Receiver,
    Sender,
    SenderAndReceiver,
    /// Reply channel; inbound messages go to the component's response router
    Response,
}

pub struct Endpoint {
    name: String,
    uri: EndpointUri,
    endpoint_type: EndpointType,
    connection_strategy: Arc<dyn ConnectionStrategy>,
    filter: Option<Arc<dyn Filter>>,
    security_filter: Option<Arc<dyn SecurityFilter>>,
    transaction: TransactionConfig,
    synchronous: bool,
    remote_sync: bool,
    response_transformers: Vec<Arc<dyn Transformer>>,
    properties: HashMap<String, Value>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("uri", &self.uri.to_string())
            .field("type", &self.endpoint_type)
            .field("synchronous", &self.synchronous)
            .field("transacted", &self.transaction.is_transacted())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    pub fn builder(uri: EndpointUri) -> EndpointBuilder {
        EndpointBuilder::new(uri)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uri(&self) -> &EndpointUri {
        &self.uri
    }

    /// Pool key for dispatchers and requesters
    pub fn key(&self) -> String {
        self.uri.to_string()
    }

    /// Key the connector stores this endpoint's receiver under
    pub fn receiver_key(&self) -> String {
        match self.uri.filter_address() {
            Some(filter) if !filter.is_empty() => filter.to_string(),
            _ => self.uri.address().to_string(),
        }
    }

    pub fn protocol(&self) -> &str {
        self.uri.scheme()
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.endpoint_type
    }

    pub fn connection_strategy(&self) -> &Arc<dyn ConnectionStrategy> {
        &self.connection_strategy
    }

    pub fn filter(&self) -> Option<&Arc<dyn Filter>> {
        self.filter.as_ref()
    }

    pub fn security_filter(&self) -> Option<&Arc<dyn SecurityFilter>> {
        self.security_filter.as_ref()
    }

    pub fn transaction_config(&self) -> &TransactionConfig {
        &self.transaction
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    pub fn is_remote_sync(&self) -> bool {
        self.remote_sync
    }

    pub fn response_transformers(&self) -> &[Arc<dyn Transformer>] {
        &self.response_transformers
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

pub struct EndpointBuilder {
    endpoint: Endpoint,
}

impl EndpointBuilder {
    pub fn new(uri: EndpointUri) -> Self {
        Self {
            endpoint: Endpoint {
                name: uri.to_string(),
                uri,
                endpoint_type: EndpointType::default(),
                connection_strategy: Arc::new(SingleAttempt::new()),
                filter: None,
                security_filter: None,
                transaction: TransactionConfig::default(),
                synchronous: false,
                remote_sync: false,
                response_transformers: Vec::new(),
                properties: HashMap::new(),
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.endpoint.name = name.into();
        self
    }

    pub fn endpoint_type(mut self, endpoint_type: EndpointType) -> Self {
        self.endpoint.endpoint_type = endpoint_type;
        self
    }

    pub fn connection_strategy(mut self, strategy: Arc<dyn ConnectionStrategy>) -> Self {
        self.endpoint.connection_strategy = strategy;
        self
    }

    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.endpoint.filter = Some(filter);
        self
    }

    pub fn security_filter(mut self, filter: Arc<dyn SecurityFilter>) -> Self {
        self.endpoint.security_filter = Some(filter);
        self
    }

    pub fn transaction(mut self, config: TransactionConfig) -> Self {
        self.endpoint.transaction = config;
        self
    }

    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.endpoint.synchronous = synchronous;
        self
    }

    /// The caller waits for a reply that travels back over the transport
    pub fn remote_sync(mut self, remote_sync: bool) -> Self {
        self.endpoint.remote_sync = remote_sync;
        if remote_sync {
            self.endpoint.synchronous = true;
        }
        self
    }

    pub fn response_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.endpoint.response_transformers.push(transformer);
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.endpoint.properties.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Arc<Endpoint> {
        Arc::new(self.endpoint)
    }
}
