//! Fixed-delay task scheduler
//!
//! Every schedule is one tokio task that waits, runs the task to completion,
//! then waits again. The next run is timed from the end of the previous one,
//! so a slow run delays the schedule instead of stacking runs on top of each
//! other. Cancelling a schedule stops future runs but never interrupts a run
//! that is already in progress.

use crate::{ConnectorError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct Scheduler {
    name: String,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
    active: Arc<AtomicUsize>,
}

/// Handle to one fixed-delay schedule
#[derive(Debug)]
pub struct ScheduleHandle {
    id: u64,
    name: String,
    cancel: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl ScheduleHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop scheduling new runs
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the schedule task to exit (after cancel or shutdown)
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!("Schedule '{}' ended abnormally: {}", self.name, e);
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Sleep for `delay` unless cancelled or shut down first
async fn wait_delay(
    delay: Duration,
    cancel: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    if *cancel.borrow() || *shutdown.borrow() {
        return false;
    }
    let slept = tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.wait_for(|c| *c) => false,
        _ = shutdown.wait_for(|s| *s) => false,
    };
    slept && !(*cancel.borrow() || *shutdown.borrow())
}

impl Scheduler {
    pub fn new(name: impl Into<String>) -> Self {
        let (shutdown, _rx) = watch::channel(false);
        Self {
            name: name.into(),
            shutdown,
            next_id: AtomicU64::new(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedules whose task is still alive
    pub fn active_schedules(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Cancel every schedule. In-flight runs finish on their own.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            tracing::debug!("Scheduler '{}' shut down", self.name);
        }
    }

    /// Run `task` after `initial_delay`, then again `delay` after each run completes
    pub fn schedule_with_fixed_delay<F, Fut>(
        &self,
        name: impl Into<String>,
        initial_delay: Duration,
        delay: Duration,
        task: F,
    ) -> Result<ScheduleHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(ConnectorError::work_rejected(
                &self.name,
                "scheduler is shut down",
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        let (cancel_tx, _rx) = watch::channel(false);
        let cancel = Arc::new(cancel_tx);

        let mut cancel_rx = cancel.subscribe();
        let mut shutdown_rx = self.shutdown.subscribe();
        let task_cancel = cancel.clone();
        let task_name = name.clone();

        self.active.fetch_add(1, Ordering::Relaxed);
        let guard = ActiveGuard(self.active.clone());

        let handle = tokio::spawn(async move {
            let _guard = guard;
            // keeps the cancel channel open even if the handle is dropped
            let _cancel = task_cancel;
            let mut runs: u64 = 0;

            if wait_delay(initial_delay, &mut cancel_rx, &mut shutdown_rx).await {
                loop {
                    task().await;
                    runs += 1;
                    if !wait_delay(delay, &mut cancel_rx, &mut shutdown_rx).await {
                        break;
                    }
                }
            }
            tracing::debug!("Schedule '{}' stopped after {} runs", task_name, runs);
        });

        tracing::debug!(
            "Scheduler '{}' started schedule '{}' (initial {:?}, delay {:?})",
            self.name,
            name,
            initial_delay,
            delay
        );

        Ok(ScheduleHandle {
            id,
            name,
            cancel,
            task: handle,
        })
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
