//! Filters and transformers attached to endpoints

use crate::event::Event;
use crate::message::Message;
use crate::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Decides whether an inbound message is accepted
pub trait Filter: Send + Sync + Debug {
    fn accept(&self, message: &Message) -> bool;
}

/// Authenticates an event before it is routed or dispatched
#[async_trait]
pub trait SecurityFilter: Send + Sync + Debug {
    /// `Err(ConnectorError::Unauthorised)` when the event is rejected
    async fn authenticate(&self, event: &Event) -> Result<()>;
}

/// Rewrites a message in place
pub trait Transformer: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Whether the transformer can run when there is no message at all
    fn accepts_null(&self) -> bool {
        false
    }

    fn transform(&self, message: &Message) -> Result<()>;
}

/// Apply `transformers` in order, stopping at the first failure
pub fn apply_transformers(message: &Message, transformers: &[Arc<dyn Transformer>]) -> Result<()> {
    for transformer in transformers {
        tracing::trace!(
            "Applying transformer '{}' to message {}",
            transformer.name(),
            message.id()
        );
        transformer.transform(message)?;
    }
    Ok(())
}
