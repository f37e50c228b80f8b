//! Work manager: bounded execution of connector work on tokio tasks
//!
//! Each connector owns up to three of these (receivers, dispatchers,
//! requesters). Work is a future returning `Result<()>`; failures are handed
//! to the manager's exception listener because the code that scheduled the
//! work has usually returned by then.

use crate::config::{ExhaustedAction, ThreadingProfile};
use crate::connectable::ExceptionListener;
use crate::{ConnectorError, Result};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;

/// Counters for one work manager
#[derive(Debug, Default)]
pub struct WorkStats {
    pub scheduled: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub rejected: AtomicU64,
}

/// Handle to scheduled work
#[derive(Debug)]
pub struct WorkHandle {
    task: Option<JoinHandle<()>>,
}

impl WorkHandle {
    fn spawned(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    fn completed() -> Self {
        Self { task: None }
    }

    /// True if the work ran in the caller's task
    pub fn ran_inline(&self) -> bool {
        self.task.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// Wait for the work to finish; failures were already reported
    pub async fn join(self) {
        if let Some(task) = self.task {
            if let Err(e) = task.await {
                tracing::error!("Work task ended abnormally: {}", e);
            }
        }
    }
}

pub struct WorkManager {
    name: String,
    profile: ThreadingProfile,
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    disposed: AtomicBool,
    stats: Arc<WorkStats>,
    listener: RwLock<Option<Weak<dyn ExceptionListener>>>,
}

impl std::fmt::Debug for WorkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkManager")
            .field("name", &self.name)
            .field("profile", &self.profile)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl WorkManager {
    pub fn new(name: impl Into<String>, profile: ThreadingProfile) -> Self {
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(profile.max_threads_active)),
            profile,
            active: Arc::new(AtomicUsize::new(0)),
            disposed: AtomicBool::new(false),
            stats: Arc::new(WorkStats::default()),
            listener: RwLock::new(None),
        }
    }

    /// Report failed work to `listener` (held weakly)
    pub fn with_exception_listener(self, listener: Weak<dyn ExceptionListener>) -> Self {
        *self.listener.write() = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profile(&self) -> &ThreadingProfile {
        &self.profile
    }

    pub fn stats(&self) -> &WorkStats {
        &self.stats
    }

    /// Work currently executing
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop accepting work. Work already running is left to finish.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.permits.close();
            tracing::debug!("Work manager '{}' disposed", self.name);
        }
    }

    fn reject(&self, reason: impl Into<String>) -> ConnectorError {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        ConnectorError::work_rejected(&self.name, reason)
    }

    async fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>> {
        if self.is_disposed() {
            return Err(self.reject("work manager is disposed"));
        }

        match self.profile.exhausted_action {
            ExhaustedAction::Wait => {
                let acquire = self.permits.clone().acquire_owned();
                match tokio::time::timeout(self.profile.thread_wait_timeout(), acquire).await {
                    Ok(Ok(permit)) => Ok(Some(permit)),
                    Ok(Err(_)) => Err(self.reject("work manager is disposed")),
                    Err(_) => Err(self.reject(format!(
                        "no worker free after {:?}",
                        self.profile.thread_wait_timeout()
                    ))),
                }
            }
            ExhaustedAction::Abort | ExhaustedAction::Run => {
                match self.permits.clone().try_acquire_owned() {
                    Ok(permit) => Ok(Some(permit)),
                    Err(TryAcquireError::Closed) => Err(self.reject("work manager is disposed")),
                    Err(TryAcquireError::NoPermits)
                        if self.profile.exhausted_action == ExhaustedAction::Run =>
                    {
                        Ok(None)
                    }
                    Err(TryAcquireError::NoPermits) => Err(self.reject(format!(
                        "all {} workers are busy",
                        self.profile.max_threads_active
                    ))),
                }
            }
        }
    }

    /// Schedule `work`. Depending on the exhausted action this may wait for a
    /// free worker, fail, or run the work in the caller's task.
    pub async fn schedule_work<F>(&self, work: F) -> Result<WorkHandle>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permit = self.acquire().await?;
        self.stats.scheduled.fetch_add(1, Ordering::Relaxed);

        let runner = WorkRunner {
            manager: self.name.clone(),
            active: self.active.clone(),
            stats: self.stats.clone(),
            listener: self.listener.read().clone(),
        };

        match permit {
            Some(permit) => {
                let task = tokio::spawn(async move {
                    let _permit = permit;
                    runner.run(work).await;
                });
                Ok(WorkHandle::spawned(task))
            }
            None => {
                tracing::debug!(
                    "Work manager '{}' exhausted, running work in caller",
                    self.name
                );
                runner.run(work).await;
                Ok(WorkHandle::completed())
            }
        }
    }
}

struct WorkRunner {
    manager: String,
    active: Arc<AtomicUsize>,
    stats: Arc<WorkStats>,
    listener: Option<Weak<dyn ExceptionListener>>,
}

impl WorkRunner {
    async fn run<F>(self, work: F)
    where
        F: Future<Output = Result<()>> + Send,
    {
        self.active.fetch_add(1, Ordering::Relaxed);
        let result = work.await;
        self.active.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(()) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                match self.listener.as_ref().and_then(|l| l.upgrade()) {
                    Some(listener) => listener.exception_thrown(e).await,
                    None => tracing::warn!("Work on '{}' failed: {}", self.manager, e),
                }
            }
        }
    }
}
