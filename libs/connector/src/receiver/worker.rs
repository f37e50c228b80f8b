//! Receiver workers: route a batch of raw transport items in one transaction

use super::MessageReceiver;
use crate::connectable::ExceptionListener;
use crate::descriptor::IntoMessage;
use crate::message::Message;
use crate::transaction::{Transaction, TransactionTemplate};
use crate::work::WorkHandle;
use crate::{ConnectorError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Per-item hooks around routing. All have pass-through defaults.
#[async_trait]
pub trait WorkerHooks: Send + Sync + 'static {
    type Raw: IntoMessage + Send + 'static;

    /// Inspect or replace a raw item; `None` drops it
    async fn pre_process(&self, raw: Self::Raw) -> Result<Option<Self::Raw>> {
        Ok(Some(raw))
    }

    async fn pre_route(&self, _message: &Arc<Message>) -> Result<()> {
        Ok(())
    }

    async fn post_process(&self, _result: &Arc<Message>) -> Result<()> {
        Ok(())
    }

    /// Called once per batch with the active transaction
    async fn bind_transaction(&self, _transaction: Option<&Arc<dyn Transaction>>) -> Result<()> {
        Ok(())
    }

    /// Called once per batch with every routed result
    async fn handle_results(&self, _results: &[Arc<Message>]) -> Result<()> {
        Ok(())
    }
}

pub struct ReceiverWorker<H: WorkerHooks> {
    receiver: Arc<MessageReceiver>,
    hooks: Arc<H>,
    batch: Vec<H::Raw>,
}

impl<H: WorkerHooks> ReceiverWorker<H> {
    pub fn new(receiver: Arc<MessageReceiver>, hooks: Arc<H>, batch: Vec<H::Raw>) -> Self {
        Self {
            receiver,
            hooks,
            batch,
        }
    }

    pub fn single(receiver: Arc<MessageReceiver>, hooks: Arc<H>, raw: H::Raw) -> Self {
        Self::new(receiver, hooks, vec![raw])
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Route the batch and return the results. Any failure aborts the whole
    /// batch; the batch is consumed either way and never retried from here.
    pub async fn run(mut self) -> Result<Vec<Arc<Message>>> {
        let batch = std::mem::take(&mut self.batch);
        let receiver = &self.receiver;
        let hooks = &self.hooks;

        let connector = receiver.connector()?;
        let adapter = connector
            .service_descriptor()
            .ok_or_else(|| ConnectorError::not_initialised(connector.name()))?
            .message_adapter();
        let synchronous = receiver.endpoint().is_synchronous();
        let template = TransactionTemplate::new(receiver.endpoint().transaction_config().clone());

        template
            .execute(None, |tx| async move {
                hooks.bind_transaction(tx.as_ref()).await?;

                let mut results = Vec::new();
                for raw in batch {
                    let Some(raw) = hooks.pre_process(raw).await? else {
                        continue;
                    };
                    let message = Arc::new(raw.into_message(adapter.as_ref())?);
                    hooks.pre_route(&message).await?;

                    if let Some(result) = receiver
                        .route_message_with(message, tx.clone(), synchronous)
                        .await?
                    {
                        hooks.post_process(&result).await?;
                        results.push(result);
                    }
                }

                hooks.handle_results(&results).await?;
                Ok(results)
            })
            .await
    }

    /// Run in the caller's task, handing any failure to the connector
    pub async fn execute(self) {
        let receiver = self.receiver.clone();
        if let Err(e) = self.run().await {
            match receiver.connector() {
                Ok(connector) => connector.exception_thrown(e).await,
                Err(_) => tracing::error!("Worker for {} failed: {}", receiver.key(), e),
            }
        }
    }

    /// Run on the connector's receiver work manager. Failures reach the
    /// connector's exception listener.
    pub async fn schedule(self) -> Result<WorkHandle> {
        let work_manager = self.receiver.connector()?.receiver_work_manager()?;
        work_manager
            .schedule_work(async move { self.run().await.map(|_| ()) })
            .await
    }
}
