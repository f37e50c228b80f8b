//! Transacted polling
//!
//! A [`TransactedPollingReceiver`] fetches a batch per poll. When the
//! endpoint has a transaction factory the whole batch is processed inside
//! one transaction. Otherwise every item gets its own worker and the poll
//! waits until all of them are done.
//!
//! With transactions enabled, multiple receivers allowed (by the receiver and
//! by the connector's `create_multiple_transacted_receivers`) and receiver
//! threading on, the receiver runs one polling schedule per configured
//! concurrent transacted receiver instead of one.

use super::polling::Poller;
use super::MessageReceiver;
use crate::transaction::{Transaction, TransactionTemplate};
use crate::work::WorkHandle;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Transport hooks of a transacted polling receiver. Several schedules may
/// call these at the same time.
#[async_trait]
pub trait TransactedPoller: Send + Sync + 'static {
    type Item: Send + 'static;

    async fn connect(&self, _receiver: &Arc<MessageReceiver>) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self, _receiver: &Arc<MessageReceiver>) -> Result<()> {
        Ok(())
    }

    async fn get_messages(&self, receiver: &Arc<MessageReceiver>) -> Result<Vec<Self::Item>>;

    async fn process_message(
        &self,
        receiver: &Arc<MessageReceiver>,
        item: Self::Item,
        transaction: Option<Arc<dyn Transaction>>,
    ) -> Result<()>;
}

pub struct TransactedPollingReceiver<T> {
    inner: Arc<T>,
    receive_in_transaction: bool,
    use_multiple_receivers: bool,
}

impl<T: TransactedPoller> TransactedPollingReceiver<T> {
    /// Transactions are used when the endpoint has a transaction factory
    pub fn new(
        inner: T,
        endpoint: &crate::endpoint::Endpoint,
        use_multiple_receivers: bool,
    ) -> Self {
        Self {
            inner: Arc::new(inner),
            receive_in_transaction: endpoint.transaction_config().factory.is_some(),
            use_multiple_receivers,
        }
    }

    pub fn inner(&self) -> &Arc<T> {
        &self.inner
    }

    pub fn receive_messages_in_transaction(&self) -> bool {
        self.receive_in_transaction
    }

    pub fn use_multiple_receivers(&self) -> bool {
        self.use_multiple_receivers
    }

    async fn poll_in_transaction(
        &self,
        receiver: &Arc<MessageReceiver>,
        items: Vec<T::Item>,
    ) -> Result<()> {
        let template = TransactionTemplate::new(receiver.endpoint().transaction_config().clone());
        let inner = &self.inner;
        template
            .execute(None, |tx| async move {
                for item in items {
                    inner.process_message(receiver, item, tx.clone()).await?;
                }
                Ok(())
            })
            .await
    }

    /// One worker per item. A scheduling failure stops further submissions;
    /// the workers already running are awaited before it is returned.
    async fn poll_with_workers(
        &self,
        receiver: &Arc<MessageReceiver>,
        items: Vec<T::Item>,
    ) -> Result<()> {
        let work_manager = receiver.connector()?.receiver_work_manager()?;
        let mut handles: Vec<WorkHandle> = Vec::with_capacity(items.len());
        let mut failure = None;

        for item in items {
            let inner = self.inner.clone();
            let worker_receiver = receiver.clone();
            let scheduled = work_manager
                .schedule_work(async move {
                    inner.process_message(&worker_receiver, item, None).await
                })
                .await;
            match scheduled {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::warn!(
                        "Receiver {} could not schedule a worker: {}",
                        receiver.key(),
                        e
                    );
                    failure = Some(e);
                    break;
                }
            }
        }

        futures::future::join_all(handles.into_iter().map(WorkHandle::join)).await;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<T: TransactedPoller> Poller for TransactedPollingReceiver<T> {
    async fn connect(&self, receiver: &Arc<MessageReceiver>) -> Result<()> {
        self.inner.connect(receiver).await
    }

    async fn disconnect(&self, receiver: &Arc<MessageReceiver>) -> Result<()> {
        self.inner.disconnect(receiver).await
    }

    async fn poll(&self, receiver: &Arc<MessageReceiver>) -> Result<()> {
        let items = self.inner.get_messages(receiver).await?;
        if items.is_empty() {
            return Ok(());
        }
        tracing::trace!("Receiver {} polled {} item(s)", receiver.key(), items.len());

        if self.receive_in_transaction {
            self.poll_in_transaction(receiver, items).await
        } else {
            self.poll_with_workers(receiver, items).await
        }
    }

    fn concurrent_schedules(&self, receiver: &MessageReceiver) -> usize {
        if !(self.receive_in_transaction && self.use_multiple_receivers) {
            return 1;
        }
        match receiver.connector() {
            Ok(connector)
                if connector.config().create_multiple_transacted_receivers
                    && connector.config().receiver_threading.do_threading =>
            {
                connector.config().number_of_concurrent_transacted_receivers
            }
            _ => 1,
        }
    }
}
