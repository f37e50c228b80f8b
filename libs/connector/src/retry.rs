//! Connection strategies
//!
//! A strategy wraps the raw [`Connectable::attempt_connect`] call of a
//! connector, receiver, dispatcher or requester and decides whether a failure
//! is retried. Two policies ship with the crate:
//!
//! - [`SingleAttempt`]: one try, any failure is fatal
//! - [`SimpleRetry`]: fixed-interval retries, `retry_count` times or forever
//!
//! Retry state lives in a [`RetryContext`] owned by the caller of
//! [`ConnectionStrategy::connect`]. A nested connect (a dispatcher verifying
//! its connector) passes [`RetryContext::reentrant`], which makes exactly one
//! uncounted attempt so the outer loop does the counting.

use crate::connectable::Connectable;
use crate::{ConnectorError, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::watch;

/// Per-call retry bookkeeping
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    retry_count: u32,
    reentrant: bool,
    shutdown: Option<watch::Receiver<bool>>,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt retry pauses once `shutdown` turns true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Context for a nested connect issued from inside an attempt
    pub fn reentrant(&self) -> Self {
        Self {
            retry_count: 0,
            reentrant: true,
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    /// Failed attempts recorded since the last reset
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn record_failure(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    pub fn reset(&mut self) {
        self.retry_count = 0;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }

    /// Sleep for `delay`; false if shutdown interrupted the pause
    async fn pause(&mut self, delay: Duration) -> bool {
        match self.shutdown.as_mut() {
            None => {
                tokio::time::sleep(delay).await;
                true
            }
            Some(rx) => {
                if *rx.borrow() {
                    return false;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => true,
                    _ = rx.wait_for(|shutdown| *shutdown) => false,
                }
            }
        }
    }
}

/// Policy governing how a failed connection attempt is retried
#[async_trait]
pub trait ConnectionStrategy: Send + Sync + Debug {
    /// Whether the connect should run on a worker instead of the caller
    fn do_threading(&self) -> bool;

    /// Run the policy against `target`. Retry state is reset afterwards
    /// whatever the outcome.
    async fn connect(&self, target: &dyn Connectable, ctx: &mut RetryContext) -> Result<()> {
        if ctx.is_reentrant() {
            return target.attempt_connect(ctx).await;
        }

        let result = self.do_connect(target, ctx).await;
        self.reset_state(ctx);
        result
    }

    /// The policy itself
    async fn do_connect(&self, target: &dyn Connectable, ctx: &mut RetryContext) -> Result<()>;

    fn reset_state(&self, ctx: &mut RetryContext) {
        ctx.reset();
    }
}

/// One attempt, failures are wrapped as fatal
#[derive(Debug, Clone, Default)]
pub struct SingleAttempt {
    do_threading: bool,
}

impl SingleAttempt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threading(mut self, do_threading: bool) -> Self {
        self.do_threading = do_threading;
        self
    }
}

#[async_trait]
impl ConnectionStrategy for SingleAttempt {
    fn do_threading(&self) -> bool {
        self.do_threading
    }

    async fn do_connect(&self, target: &dyn Connectable, ctx: &mut RetryContext) -> Result<()> {
        match target.attempt_connect(ctx).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Err(ConnectorError::fatal_connect_with_source(
                target.connection_description(),
                "Connection attempt failed",
                e,
            )),
        }
    }
}

/// Retries at a fixed frequency
#[derive(Debug, Clone)]
pub struct SimpleRetry {
    retry_count: u32,
    frequency: Duration,
    retry_forever: bool,
    do_threading: bool,
}

impl Default for SimpleRetry {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RETRY_COUNT, Self::DEFAULT_FREQUENCY)
    }
}

impl SimpleRetry {
    pub const DEFAULT_RETRY_COUNT: u32 = 2;
    pub const DEFAULT_FREQUENCY: Duration = Duration::from_millis(2000);

    pub fn new(retry_count: u32, frequency: Duration) -> Self {
        Self {
            retry_count,
            frequency,
            retry_forever: false,
            do_threading: false,
        }
    }

    /// Retry until success, fatal error or shutdown
    pub fn forever(frequency: Duration) -> Self {
        Self {
            retry_forever: true,
            ..Self::new(0, frequency)
        }
    }

    pub fn with_threading(mut self, do_threading: bool) -> Self {
        self.do_threading = do_threading;
        self
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn frequency(&self) -> Duration {
        self.frequency
    }
}

#[async_trait]
impl ConnectionStrategy for SimpleRetry {
    fn do_threading(&self) -> bool {
        self.do_threading
    }

    async fn do_connect(&self, target: &dyn Connectable, ctx: &mut RetryContext) -> Result<()> {
        loop {
            let error = match target.attempt_connect(ctx).await {
                Ok(()) => {
                    if ctx.retry_count() > 0 {
                        tracing::info!(
                            "Connected {} after {} retries",
                            target.connection_description(),
                            ctx.retry_count()
                        );
                    }
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => e,
            };

            let failures = ctx.record_failure();
            if !self.retry_forever && failures > self.retry_count {
                return Err(ConnectorError::fatal_connect_with_source(
                    target.connection_description(),
                    format!("Failed to connect after {} attempts", failures),
                    error,
                ));
            }

            tracing::warn!(
                "Failed to connect {} (attempt {}): {}. Retrying in {:?}",
                target.connection_description(),
                failures,
                error,
                self.frequency
            );

            if !ctx.pause(self.frequency).await {
                return Err(ConnectorError::fatal_connect_with_source(
                    target.connection_description(),
                    "Interrupted while waiting to retry",
                    error,
                ));
            }
        }
    }
}
