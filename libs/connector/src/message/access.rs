//! Single-writer access guard for in-flight messages
//!
//! The first task (or thread, outside the runtime) that touches a message
//! becomes its owner. The owner may read and write freely. A read from any
//! other task flips the message to immutable for everyone, and a write from a
//! non-owner is rejected outright.
//!
//! This is a race detector, not a lock. It does not make concurrent access
//! safe; it makes accidental sharing across tasks loud. Code that hands a
//! message to another task on purpose calls [`AccessGuard::reset`] first.

use crate::{ConnectorError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

static UNSAFE_ACCESS: AtomicBool = AtomicBool::new(false);

/// Downgrade access violations to warnings for the whole process
pub fn set_unsafe_access(enabled: bool) {
    UNSAFE_ACCESS.store(enabled, Ordering::SeqCst);
}

pub fn unsafe_access_enabled() -> bool {
    UNSAFE_ACCESS.load(Ordering::SeqCst)
}

/// Identity of the code currently touching a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessToken {
    Task(tokio::task::Id),
    Thread(std::thread::ThreadId),
}

impl AccessToken {
    /// Token for the caller: its tokio task if inside one, else its OS thread
    pub fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => AccessToken::Task(id),
            None => AccessToken::Thread(std::thread::current().id()),
        }
    }
}

#[derive(Debug)]
struct AccessState {
    owner: Option<AccessToken>,
    mutable: bool,
}

#[derive(Debug)]
pub struct AccessGuard {
    state: Mutex<AccessState>,
}

impl Default for AccessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessGuard {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AccessState {
                owner: None,
                mutable: true,
            }),
        }
    }

    /// Record a read. Never fails, but a foreign read freezes the message.
    pub fn check_read(&self) {
        let current = AccessToken::current();
        let mut state = self.state.lock();
        let owner = *state.owner.get_or_insert(current);
        if owner != current && state.mutable {
            tracing::trace!("Message read by non-owner {:?}, now immutable", current);
            state.mutable = false;
        }
    }

    /// Record a write, failing if the caller is not allowed to mutate
    pub fn check_write(&self, message_id: &str) -> Result<()> {
        let current = AccessToken::current();
        let violation = {
            let mut state = self.state.lock();
            let owner = *state.owner.get_or_insert(current);
            if owner != current {
                Some("Only the owner task can write to a message")
            } else if !state.mutable {
                Some("Cannot write to an immutable message")
            } else {
                None
            }
        };

        match violation {
            None => Ok(()),
            Some(reason) if unsafe_access_enabled() => {
                tracing::warn!("Message {} unsafe write allowed: {}", message_id, reason);
                Ok(())
            }
            Some(reason) => Err(ConnectorError::access_violation(message_id, reason)),
        }
    }

    /// Clear ownership and mutability so the next toucher becomes the owner
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.owner = None;
        state.mutable = true;
    }

    pub fn owner(&self) -> Option<AccessToken> {
        self.state.lock().owner
    }

    pub fn is_mutable(&self) -> bool {
        self.state.lock().mutable
    }
}
