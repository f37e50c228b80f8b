//! Routing collaborators a receiver hands messages to

use crate::event::Event;
use crate::message::Message;
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

#[async_trait]
pub trait InboundRouter: Send + Sync + Debug {
    /// Route an inbound event; `None` when there is no reply
    async fn route(&self, event: Event) -> Result<Option<Arc<Message>>>;
}

#[async_trait]
pub trait ResponseRouter: Send + Sync + Debug {
    async fn route(&self, event: Event) -> Result<()>;
}

/// The service a receiver delivers into
pub trait Component: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn inbound_router(&self) -> Arc<dyn InboundRouter>;

    fn response_router(&self) -> Option<Arc<dyn ResponseRouter>> {
        None
    }
}

/// Per-event conversation state
#[derive(Debug)]
pub struct Session {
    id: String,
    component: Option<String>,
    properties: RwLock<HashMap<String, Value>>,
}

impl Session {
    pub fn new(component: Option<&str>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            component: component.map(str::to_string),
            properties: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn component(&self) -> Option<&str> {
        self.component.as_deref()
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        self.properties.read().get(name).cloned()
    }

    pub fn set_property(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.write().insert(name.into(), value.into());
    }
}
