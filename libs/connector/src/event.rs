//! Event: a message in flight together with its routing context

use crate::endpoint::Endpoint;
use crate::message::Message;
use crate::routing::Session;
use crate::transaction::Transaction;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Event {
    id: String,
    message: Arc<Message>,
    endpoint: Arc<Endpoint>,
    session: Arc<Session>,
    synchronous: bool,
    transaction: Option<Arc<dyn Transaction>>,
}

impl Event {
    /// Event with a fresh session, synchronous mode taken from the endpoint
    pub fn new(message: Arc<Message>, endpoint: Arc<Endpoint>) -> Self {
        let synchronous = endpoint.is_synchronous();
        Self::with_session(message, endpoint, Arc::new(Session::new(None)), synchronous)
    }

    pub fn with_session(
        message: Arc<Message>,
        endpoint: Arc<Endpoint>,
        session: Arc<Session>,
        synchronous: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message,
            endpoint,
            session,
            synchronous,
            transaction: None,
        }
    }

    pub fn with_transaction(mut self, transaction: Option<Arc<dyn Transaction>>) -> Self {
        self.transaction = transaction;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    pub fn set_synchronous(&mut self, synchronous: bool) {
        self.synchronous = synchronous;
    }

    pub fn transaction(&self) -> Option<&Arc<dyn Transaction>> {
        self.transaction.as_ref()
    }

    /// True when the active transaction can only roll back
    pub fn is_transaction_rollback(&self) -> bool {
        self.transaction
            .as_ref()
            .map(|tx| tx.is_rollback_only())
            .unwrap_or(false)
    }
}
