//! Polling receivers
//!
//! A [`PollingReceiver`] registers fixed-delay schedules on the connector's
//! scheduler when its receiver starts. Each run performs exactly one
//! [`Poller::poll`]; the next run is timed from the end of the previous one,
//! so slow polls never overlap. Stopping cancels the schedules and lets an
//! in-flight poll finish.

use super::{MessageReceiver, ReceiverTransport};
use crate::config::PollingConfig;
use crate::connectable::ExceptionListener;
use crate::scheduler::ScheduleHandle;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Transport-specific polling behavior
#[async_trait]
pub trait Poller: Send + Sync + 'static {
    async fn connect(&self, _receiver: &Arc<MessageReceiver>) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self, _receiver: &Arc<MessageReceiver>) -> Result<()> {
        Ok(())
    }

    /// One poll cycle
    async fn poll(&self, receiver: &Arc<MessageReceiver>) -> Result<()>;

    /// Number of independent schedules to run
    fn concurrent_schedules(&self, _receiver: &MessageReceiver) -> usize {
        1
    }
}

pub struct PollingReceiver<P> {
    poller: Arc<P>,
    frequency: Duration,
    startup_delay: Duration,
    schedules: Mutex<Vec<ScheduleHandle>>,
}

impl<P: Poller> PollingReceiver<P> {
    pub fn new(poller: P, config: &PollingConfig) -> Self {
        Self {
            poller: Arc::new(poller),
            frequency: config.frequency(),
            startup_delay: config.startup_delay(),
            schedules: Mutex::new(Vec::new()),
        }
    }

    pub fn with_frequency(mut self, frequency: Duration) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_startup_delay(mut self, startup_delay: Duration) -> Self {
        self.startup_delay = startup_delay;
        self
    }

    pub fn poller(&self) -> &Arc<P> {
        &self.poller
    }

    pub fn frequency(&self) -> Duration {
        self.frequency
    }

    /// Schedules currently registered
    pub fn schedule_count(&self) -> usize {
        self.schedules.lock().len()
    }
}

async fn run_poll<P: Poller>(poller: &P, receiver: &Arc<MessageReceiver>) {
    if !receiver.is_connected() || receiver.is_stopped() {
        tracing::trace!("Skipping poll of {}: not running", receiver.key());
        return;
    }
    if let Err(e) = poller.poll(receiver).await {
        receiver.exception_thrown(e).await;
    }
}

#[async_trait]
impl<P: Poller> ReceiverTransport for PollingReceiver<P> {
    async fn do_connect(&self, receiver: &Arc<MessageReceiver>) -> Result<()> {
        self.poller.connect(receiver).await
    }

    async fn do_disconnect(&self, receiver: &Arc<MessageReceiver>) -> Result<()> {
        self.poller.disconnect(receiver).await
    }

    async fn do_start(&self, receiver: &Arc<MessageReceiver>) -> Result<()> {
        let scheduler = receiver.connector()?.scheduler()?;
        let count = self.poller.concurrent_schedules(receiver).max(1);

        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let poller = self.poller.clone();
            let weak = Arc::downgrade(receiver);
            let handle = scheduler.schedule_with_fixed_delay(
                format!("{}.poll.{}", receiver.key(), index),
                self.startup_delay,
                self.frequency,
                move || {
                    let poller = poller.clone();
                    let weak = weak.clone();
                    async move {
                        if let Some(receiver) = weak.upgrade() {
                            run_poll(poller.as_ref(), &receiver).await;
                        }
                    }
                },
            );
            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in &handles {
                        handle.cancel();
                    }
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            "Receiver {} polling every {:?} on {} schedule(s)",
            receiver.key(),
            self.frequency,
            count
        );
        self.schedules.lock().extend(handles);
        Ok(())
    }

    async fn do_stop(&self, receiver: &Arc<MessageReceiver>) -> Result<()> {
        let handles: Vec<ScheduleHandle> = self.schedules.lock().drain(..).collect();
        for handle in &handles {
            handle.cancel();
        }
        tracing::debug!(
            "Receiver {} cancelled {} polling schedule(s)",
            receiver.key(),
            handles.len()
        );
        Ok(())
    }
}
