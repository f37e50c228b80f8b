//! Transaction collaborators and the template that wraps work in them
//!
//! Transactions are supplied by the embedding runtime. This layer only
//! decides whether work runs inside one, and passes the active transaction
//! along explicitly (there is no ambient transaction context).

use crate::connectable::ExceptionListener;
use crate::{ConnectorError, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Transaction: Send + Sync + Debug {
    fn id(&self) -> &str;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    fn set_rollback_only(&self);

    fn is_rollback_only(&self) -> bool;
}

#[async_trait]
pub trait TransactionFactory: Send + Sync + Debug {
    async fn begin(&self) -> Result<Arc<dyn Transaction>>;
}

/// How work relates to a transaction that may already be active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionAction {
    /// Never run in a transaction; an active one is an error
    #[default]
    None,
    /// Always begin a new transaction; an active one is an error
    AlwaysBegin,
    /// Join the active transaction or begin one
    BeginOrJoin,
    /// Join the active transaction; none active is an error
    AlwaysJoin,
    /// Join the active transaction if there is one
    JoinIfPossible,
}

/// Transaction settings of an endpoint
#[derive(Debug, Clone, Default)]
pub struct TransactionConfig {
    pub factory: Option<Arc<dyn TransactionFactory>>,
    pub action: TransactionAction,
    pub timeout: Option<Duration>,
}

impl TransactionConfig {
    pub fn new(factory: Arc<dyn TransactionFactory>, action: TransactionAction) -> Self {
        Self {
            factory: Some(factory),
            action,
            timeout: None,
        }
    }

    /// True when work on this endpoint can run inside a transaction
    pub fn is_transacted(&self) -> bool {
        self.factory.is_some() && self.action != TransactionAction::None
    }
}

/// Runs work inside the transaction an endpoint's configuration asks for
#[derive(Clone)]
pub struct TransactionTemplate {
    config: TransactionConfig,
    listener: Option<Arc<dyn ExceptionListener>>,
}

impl Debug for TransactionTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTemplate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TransactionTemplate {
    pub fn new(config: TransactionConfig) -> Self {
        Self {
            config,
            listener: None,
        }
    }

    pub fn with_exception_listener(mut self, listener: Arc<dyn ExceptionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Run `work` with the effective transaction.
    ///
    /// A transaction begun here is committed on success (rolled back if it
    /// was marked rollback-only) and rolled back on failure. A joined
    /// transaction is only marked rollback-only on failure.
    pub async fn execute<T, F, Fut>(
        &self,
        current: Option<Arc<dyn Transaction>>,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(Option<Arc<dyn Transaction>>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let action = if self.config.factory.is_some() {
            self.config.action
        } else {
            TransactionAction::None
        };

        match (action, &current) {
            (TransactionAction::AlwaysBegin, Some(tx)) => {
                return Err(ConnectorError::transaction(format!(
                    "Transaction {} already active but action is AlwaysBegin",
                    tx.id()
                )));
            }
            (TransactionAction::AlwaysJoin, None) => {
                return Err(ConnectorError::transaction(
                    "No transaction active but action is AlwaysJoin",
                ));
            }
            (TransactionAction::None, Some(tx)) if self.config.factory.is_some() => {
                return Err(ConnectorError::transaction(format!(
                    "Transaction {} active but action is None",
                    tx.id()
                )));
            }
            _ => {}
        }

        let begin = matches!(action, TransactionAction::AlwaysBegin)
            || (action == TransactionAction::BeginOrJoin && current.is_none());

        let (tx, owned) = match (&self.config.factory, begin) {
            (Some(factory), true) => {
                let tx = factory.begin().await?;
                tracing::debug!("Began transaction {}", tx.id());
                (Some(tx), true)
            }
            _ => (current, false),
        };

        match work(tx.clone()).await {
            Ok(value) => {
                if let (Some(tx), true) = (&tx, owned) {
                    if tx.is_rollback_only() {
                        tracing::debug!("Rolling back rollback-only transaction {}", tx.id());
                        tx.rollback().await?;
                    } else {
                        tx.commit().await?;
                    }
                }
                Ok(value)
            }
            Err(e) => {
                if let Some(tx) = &tx {
                    tx.set_rollback_only();
                    if owned {
                        if let Err(rollback_error) = tx.rollback().await {
                            tracing::error!(
                                "Rollback of transaction {} failed: {}",
                                tx.id(),
                                rollback_error
                            );
                        }
                    }
                }
                if let Some(listener) = &self.listener {
                    listener
                        .exception_thrown(ConnectorError::transaction(format!(
                            "Transactional work failed: {}",
                            e
                        )))
                        .await;
                }
                Err(e)
            }
        }
    }
}
