//! Configuration support for connectors
//!
//! Provides TOML-based configuration for a connector instance:
//! - Connection retry policy
//! - Threading profiles for the receiver, dispatcher and requester work managers
//! - Dispatcher pool limits
//! - Polling defaults and transacted receiver concurrency

use crate::retry::{ConnectionStrategy, SimpleRetry, SingleAttempt};
use crate::{ConnectorError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Default number of concurrent polling schedules for transacted receivers
pub const DEFAULT_CONCURRENT_TRANSACTED_RECEIVERS: usize = 4;

/// Top-level connector configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Retry policy used when the connector itself connects
    pub retry: RetryPolicyConfig,

    /// Work manager profile for receivers
    pub receiver_threading: ThreadingProfile,

    /// Work manager profile for dispatchers
    pub dispatcher_threading: ThreadingProfile,

    /// Work manager profile for requesters
    pub requester_threading: ThreadingProfile,

    /// Dispatcher and requester pool limits
    pub dispatcher_pool: PoolConfig,

    /// Polling defaults for polling receivers
    pub polling: PollingConfig,

    /// Number of polling schedules a transacted receiver runs at once
    pub number_of_concurrent_transacted_receivers: usize,

    /// Whether transacted receivers may run several schedules
    pub create_multiple_transacted_receivers: bool,

    /// Fire message notifications on receive, dispatch, send and request
    pub enable_message_events: bool,

    /// Extra URI schemes accepted besides the transport's own protocol
    pub supported_protocols: Vec<String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicyConfig::default(),
            receiver_threading: ThreadingProfile::default(),
            dispatcher_threading: ThreadingProfile::default(),
            requester_threading: ThreadingProfile::default(),
            dispatcher_pool: PoolConfig::default(),
            polling: PollingConfig::default(),
            number_of_concurrent_transacted_receivers: DEFAULT_CONCURRENT_TRANSACTED_RECEIVERS,
            create_multiple_transacted_receivers: true,
            enable_message_events: false,
            supported_protocols: Vec::new(),
        }
    }
}

impl ConnectorConfig {
    /// Load configuration from TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ConnectorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Convert to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConnectorError::configuration(format!("Failed to serialize to TOML: {}", e), None)
        })
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.receiver_threading.validate("receiver_threading")?;
        self.dispatcher_threading.validate("dispatcher_threading")?;
        self.requester_threading.validate("requester_threading")?;
        self.polling.validate()?;

        if self.number_of_concurrent_transacted_receivers == 0 {
            return Err(ConnectorError::configuration(
                "At least one transacted receiver is required",
                Some("number_of_concurrent_transacted_receivers"),
            ));
        }

        if self.dispatcher_pool.max_idle == 0 {
            return Err(ConnectorError::configuration(
                "Pool max_idle must be greater than 0",
                Some("dispatcher_pool.max_idle"),
            ));
        }

        Ok(())
    }
}

/// Connection retry policy
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetryPolicyConfig {
    /// One attempt, any failure is fatal
    SingleAttempt {
        #[serde(default)]
        do_threading: bool,
    },
    /// Fixed-interval retries
    SimpleRetry {
        #[serde(default = "default_retry_count")]
        retry_count: u32,
        #[serde(default = "default_retry_frequency_ms")]
        frequency_ms: u64,
        #[serde(default)]
        retry_forever: bool,
        #[serde(default)]
        do_threading: bool,
    },
}

fn default_retry_count() -> u32 {
    SimpleRetry::DEFAULT_RETRY_COUNT
}

fn default_retry_frequency_ms() -> u64 {
    SimpleRetry::DEFAULT_FREQUENCY.as_millis() as u64
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        RetryPolicyConfig::SingleAttempt {
            do_threading: false,
        }
    }
}

impl RetryPolicyConfig {
    /// Build the strategy object described by this configuration
    pub fn build(&self) -> Arc<dyn ConnectionStrategy> {
        match self {
            RetryPolicyConfig::SingleAttempt { do_threading } => {
                Arc::new(SingleAttempt::new().with_threading(*do_threading))
            }
            RetryPolicyConfig::SimpleRetry {
                retry_count,
                frequency_ms,
                retry_forever,
                do_threading,
            } => {
                let strategy = if *retry_forever {
                    SimpleRetry::forever(Duration::from_millis(*frequency_ms))
                } else {
                    SimpleRetry::new(*retry_count, Duration::from_millis(*frequency_ms))
                };
                Arc::new(strategy.with_threading(*do_threading))
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let RetryPolicyConfig::SimpleRetry { frequency_ms, .. } = self {
            if *frequency_ms == 0 {
                return Err(ConnectorError::configuration(
                    "Retry frequency must be greater than 0",
                    Some("retry.frequency_ms"),
                ));
            }
        }
        Ok(())
    }
}

/// What a work manager does when every worker is busy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    /// Wait up to `thread_wait_timeout_ms` for a worker
    Wait,
    /// Reject the work immediately
    Abort,
    /// Run the work in the caller's task
    Run,
}

/// Sizing and behavior of one work manager
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ThreadingProfile {
    pub max_threads_active: usize,
    pub do_threading: bool,
    pub exhausted_action: ExhaustedAction,
    pub thread_wait_timeout_ms: u64,
}

impl Default for ThreadingProfile {
    fn default() -> Self {
        Self {
            max_threads_active: 16,
            do_threading: true,
            exhausted_action: ExhaustedAction::Wait,
            thread_wait_timeout_ms: 30_000,
        }
    }
}

impl ThreadingProfile {
    pub fn thread_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.thread_wait_timeout_ms)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.max_threads_active == 0 {
            return Err(ConnectorError::configuration(
                "max_threads_active must be greater than 0",
                Some(&format!("{}.max_threads_active", section)),
            ));
        }
        Ok(())
    }
}

/// What a keyed pool does when `max_active` objects are out for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolExhaustedAction {
    Wait,
    Fail,
    Grow,
}

/// Keyed pool limits, applied per endpoint
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum objects borrowed at once per key (0 = unbounded)
    pub max_active: usize,
    /// Maximum idle objects kept per key
    pub max_idle: usize,
    pub exhausted_action: PoolExhaustedAction,
    pub max_wait_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 16,
            max_idle: 16,
            exhausted_action: PoolExhaustedAction::Wait,
            max_wait_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Polling receiver timing
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Delay between the end of one poll and the start of the next
    pub frequency_ms: u64,
    /// Delay before the first poll
    pub startup_delay_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            frequency_ms: 1000,
            startup_delay_ms: 1000,
        }
    }
}

impl PollingConfig {
    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.frequency_ms == 0 {
            return Err(ConnectorError::configuration(
                "Polling frequency must be greater than 0",
                Some("polling.frequency_ms"),
            ));
        }
        Ok(())
    }
}
