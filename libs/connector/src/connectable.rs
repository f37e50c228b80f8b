//! Shared building blocks for objects with a connect/disconnect lifecycle

use crate::retry::{ConnectionStrategy, RetryContext};
use crate::{ConnectorError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Boolean flag whose changes can be awaited
#[derive(Debug)]
pub struct WaitableBool {
    tx: watch::Sender<bool>,
}

impl WaitableBool {
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    /// Set the value, returning the previous one
    pub fn set(&self, value: bool) -> bool {
        self.tx.send_replace(value)
    }

    /// Atomically replace `expected` with `new`; false if the value differed
    pub fn compare_and_set(&self, expected: bool, new: bool) -> bool {
        let mut swapped = false;
        self.tx.send_if_modified(|current| {
            if *current == expected {
                *current = new;
                swapped = true;
                expected != new
            } else {
                false
            }
        });
        swapped
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Wait until the flag holds `value`
    pub async fn wait_for(&self, value: bool) {
        let mut rx = self.tx.subscribe();
        // the sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|current| *current == value).await;
    }
}

/// Something a [`ConnectionStrategy`](crate::retry::ConnectionStrategy) can connect
#[async_trait]
pub trait Connectable: Send + Sync {
    /// One raw connection attempt, no retries
    async fn attempt_connect(&self, ctx: &RetryContext) -> Result<()>;

    /// Human-readable name used in logs and errors
    fn connection_description(&self) -> String;
}

/// Receives failures that have no caller left to return them to
#[async_trait]
pub trait ExceptionListener: Send + Sync {
    async fn exception_thrown(&self, error: ConnectorError);
}

/// Listener that only logs
#[derive(Debug, Default, Clone)]
pub struct LoggingExceptionListener;

#[async_trait]
impl ExceptionListener for LoggingExceptionListener {
    async fn exception_thrown(&self, error: ConnectorError) {
        tracing::error!("Unhandled connector exception: {}", error);
    }
}

/// Connection flags of one dispatcher, requester or receiver.
///
/// Connect and disconnect are serialised by an async lock so that an object
/// is never connected twice or torn down while a connect is in progress.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    lock: tokio::sync::Mutex<()>,
    connected: WaitableBool,
    connecting: AtomicBool,
    disposed: AtomicBool,
}

impl ConnectionState {
    pub(crate) fn new() -> Self {
        Self {
            lock: tokio::sync::Mutex::new(()),
            connected: WaitableBool::new(false),
            connecting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.get()
    }

    pub(crate) fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Mark disposed; true only for the first caller
    pub(crate) fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    /// Run `strategy` against `target` unless already connected.
    /// Returns true if this call made the connection.
    pub(crate) async fn connect_with(
        &self,
        strategy: &dyn ConnectionStrategy,
        target: &dyn Connectable,
        ctx: &mut RetryContext,
    ) -> Result<bool> {
        let _guard = self.lock.lock().await;
        if self.connected.get() {
            return Ok(false);
        }

        self.connecting.store(true, Ordering::Release);
        let result = strategy.connect(target, ctx).await;
        if result.is_ok() {
            self.connected.set(true);
        }
        self.connecting.store(false, Ordering::Release);
        result.map(|_| true)
    }

    /// Run `disconnect` if connected. The flag is cleared whatever the
    /// outcome. Returns true if this call did the disconnect.
    pub(crate) async fn disconnect_with<F, Fut>(&self, disconnect: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _guard = self.lock.lock().await;
        if !self.connected.get() {
            return Ok(false);
        }
        let result = disconnect().await;
        self.connected.set(false);
        result.map(|_| true)
    }
}
