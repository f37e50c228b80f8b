//! Keyed object pool for dispatchers and requesters
//!
//! Objects are pooled per endpoint key. The factory's `validate` runs only
//! when an object comes back to the pool, never when one is handed out: it
//! doubles as the activation and passivation check and cannot tell the two
//! directions apart. A freshly created object is therefore used unvalidated,
//! and a broken one is evicted on its way back.

use crate::config::{PoolConfig, PoolExhaustedAction};
use crate::endpoint::Endpoint;
use crate::{ConnectorError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, TryAcquireError};

#[async_trait]
pub trait PoolableFactory<T>: Send + Sync {
    async fn make(&self, endpoint: &Arc<Endpoint>) -> Result<T>;

    /// Whether a returned object may be handed out again
    async fn validate(&self, endpoint: &Arc<Endpoint>, object: &T) -> bool;

    async fn destroy(&self, endpoint: &Arc<Endpoint>, object: T);
}

/// Pool counters
#[derive(Debug, Default)]
pub struct PoolStats {
    pub created: AtomicU64,
    pub destroyed: AtomicU64,
    pub borrowed: AtomicU64,
    pub returned: AtomicU64,
    /// Objects that failed validation on return
    pub evicted: AtomicU64,
}

struct KeyedEntry<T> {
    endpoint: Arc<Endpoint>,
    idle: Mutex<VecDeque<T>>,
    permits: Option<Arc<Semaphore>>,
    active: AtomicUsize,
}

impl<T> KeyedEntry<T> {
    fn release(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        if let Some(permits) = &self.permits {
            permits.add_permits(1);
        }
    }
}

pub struct KeyedPool<T> {
    name: String,
    config: PoolConfig,
    factory: Arc<dyn PoolableFactory<T>>,
    entries: DashMap<String, Arc<KeyedEntry<T>>>,
    closed: AtomicBool,
    stats: PoolStats,
}

impl<T> std::fmt::Debug for KeyedPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedPool")
            .field("name", &self.name)
            .field("keys", &self.entries.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> KeyedPool<T> {
    pub fn new(
        name: impl Into<String>,
        config: PoolConfig,
        factory: Arc<dyn PoolableFactory<T>>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            factory,
            entries: DashMap::new(),
            closed: AtomicBool::new(false),
            stats: PoolStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn entry(&self, endpoint: &Arc<Endpoint>) -> Arc<KeyedEntry<T>> {
        let bounded = self.config.max_active > 0
            && self.config.exhausted_action != PoolExhaustedAction::Grow;
        let max_active = self.config.max_active;
        self.entries
            .entry(endpoint.key())
            .or_insert_with(|| {
                Arc::new(KeyedEntry {
                    endpoint: endpoint.clone(),
                    idle: Mutex::new(VecDeque::new()),
                    permits: bounded.then(|| Arc::new(Semaphore::new(max_active))),
                    active: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    async fn acquire_slot(&self, entry: &KeyedEntry<T>) -> Result<()> {
        let Some(permits) = &entry.permits else {
            return Ok(());
        };
        let exhausted = || {
            ConnectorError::work_rejected(
                &self.name,
                format!(
                    "pool exhausted for {} ({} active)",
                    entry.endpoint.key(),
                    self.config.max_active
                ),
            )
        };

        match self.config.exhausted_action {
            PoolExhaustedAction::Fail | PoolExhaustedAction::Grow => match permits.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(TryAcquireError::Closed) => return Err(ConnectorError::disposed(&self.name)),
                Err(TryAcquireError::NoPermits) => return Err(exhausted()),
            },
            PoolExhaustedAction::Wait => {
                match tokio::time::timeout(self.config.max_wait(), permits.acquire()).await {
                    Ok(Ok(permit)) => permit.forget(),
                    Ok(Err(_)) => return Err(ConnectorError::disposed(&self.name)),
                    Err(_) => return Err(exhausted()),
                }
            }
        }
        Ok(())
    }

    /// Hand out an idle object for the endpoint, or make a new one
    pub async fn borrow(&self, endpoint: &Arc<Endpoint>) -> Result<T> {
        if self.is_closed() {
            return Err(ConnectorError::disposed(&self.name));
        }

        let entry = self.entry(endpoint);
        self.acquire_slot(&entry).await?;
        entry.active.fetch_add(1, Ordering::Relaxed);

        let idle = entry.idle.lock().pop_front();
        let object = match idle {
            Some(object) => object,
            None => match self.factory.make(endpoint).await {
                Ok(object) => {
                    self.stats.created.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Pool '{}' created object for {}", self.name, endpoint.key());
                    object
                }
                Err(e) => {
                    entry.release();
                    return Err(e);
                }
            },
        };

        self.stats.borrowed.fetch_add(1, Ordering::Relaxed);
        Ok(object)
    }

    /// Give an object back. It is validated here and destroyed if broken or
    /// surplus to `max_idle`.
    pub async fn return_object(&self, endpoint: &Arc<Endpoint>, object: T) {
        let entry = self.entry(endpoint);
        entry.release();
        self.stats.returned.fetch_add(1, Ordering::Relaxed);

        if self.is_closed() {
            self.destroy(endpoint, object).await;
            return;
        }

        if !self.factory.validate(endpoint, &object).await {
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Pool '{}' evicting object for {} that failed validation",
                self.name,
                endpoint.key()
            );
            self.destroy(endpoint, object).await;
            return;
        }

        let surplus = {
            let mut idle = entry.idle.lock();
            if idle.len() >= self.config.max_idle {
                Some(object)
            } else {
                idle.push_back(object);
                None
            }
        };
        if let Some(object) = surplus {
            self.destroy(endpoint, object).await;
        }
    }

    async fn destroy(&self, endpoint: &Arc<Endpoint>, object: T) {
        self.factory.destroy(endpoint, object).await;
        self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Destroy every idle object. Borrowed objects are untouched.
    pub async fn clear(&self) {
        let entries: Vec<Arc<KeyedEntry<T>>> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            let drained: Vec<T> = entry.idle.lock().drain(..).collect();
            for object in drained {
                self.destroy(&entry.endpoint, object).await;
            }
        }
    }

    /// Refuse further borrows and destroy idle objects. Objects returned
    /// after this are destroyed on return.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in self.entries.iter() {
            if let Some(permits) = &entry.permits {
                permits.close();
            }
        }
        self.clear().await;
        tracing::debug!("Pool '{}' closed", self.name);
    }

    pub fn num_idle(&self, endpoint: &Endpoint) -> usize {
        self.entries
            .get(&endpoint.key())
            .map(|e| e.idle.lock().len())
            .unwrap_or(0)
    }

    pub fn num_active(&self, endpoint: &Endpoint) -> usize {
        self.entries
            .get(&endpoint.key())
            .map(|e| e.active.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn total_idle(&self) -> usize {
        self.entries.iter().map(|e| e.idle.lock().len()).sum()
    }

    pub fn total_active(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.active.load(Ordering::Relaxed))
            .sum()
    }
}
