//! Connector Error Types
//!
//! A single error enum covers connection management, outbound and inbound
//! operations, lifecycle misuse and message access violations. Variants that
//! wrap a lower-level failure keep it as `source` so callers can walk the chain.

use thiserror::Error;

/// Boxed error used as the `source` of wrapping variants
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main connector error type
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// A connection attempt failed but may be retried
    #[error("Connect failed for {resource}: {message}")]
    Connect {
        resource: String,
        message: String,
        source: Option<BoxError>,
    },

    /// Retries are exhausted or were interrupted
    #[error("Fatal connect failure for {resource}: {message}")]
    FatalConnect {
        resource: String,
        message: String,
        source: Option<BoxError>,
    },

    /// Outbound dispatch or send failed
    #[error("Dispatch failed on {endpoint}: {message}")]
    Dispatch {
        endpoint: String,
        message: String,
        source: Option<BoxError>,
    },

    /// Receive or request failed
    #[error("Receive failed on {endpoint}: {message}")]
    Receive {
        endpoint: String,
        message: String,
        source: Option<BoxError>,
    },

    /// Operation attempted on a disposed object
    #[error("{resource} has been disposed")]
    Disposed { resource: String },

    #[error("{resource} is already initialised")]
    AlreadyInitialised { resource: String },

    #[error("{resource} has not been initialised")]
    NotInitialised { resource: String },

    /// Cross-task or post-immutable message mutation
    #[error("Message {message_id} access violation: {message}")]
    AccessViolation { message_id: String, message: String },

    #[error("A listener is already registered under '{key}'")]
    ListenerAlreadyRegistered { key: String },

    /// Security filter rejected an event
    #[error("Not authenticated on {endpoint}: {message}")]
    Unauthorised { endpoint: String, message: String },

    #[error("Protocol '{protocol}' is not supported by connector {connector}")]
    UnsupportedProtocol { protocol: String, connector: String },

    /// Worker pool refused new work
    #[error("Work rejected by {manager}: {message}")]
    WorkRejected { manager: String, message: String },

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        source: Option<BoxError>,
    },

    #[error("Routing failed: {message}")]
    Routing {
        message: String,
        source: Option<BoxError>,
    },

    /// Failure reported by transport-specific code
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        source: Option<BoxError>,
    },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for connector operations
pub type Result<T> = std::result::Result<T, ConnectorError>;

impl ConnectorError {
    /// Check if this is a fatal connection error
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectorError::FatalConnect { .. })
    }

    /// Check if this is a connection-related error
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            ConnectorError::Connect { .. } | ConnectorError::FatalConnect { .. }
        )
    }

    /// Stable short name of the variant, used for error-code mapping
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectorError::Connect { .. } => "connect",
            ConnectorError::FatalConnect { .. } => "fatal_connect",
            ConnectorError::Dispatch { .. } => "dispatch",
            ConnectorError::Receive { .. } => "receive",
            ConnectorError::Disposed { .. } => "disposed",
            ConnectorError::AlreadyInitialised { .. } => "already_initialised",
            ConnectorError::NotInitialised { .. } => "not_initialised",
            ConnectorError::AccessViolation { .. } => "access_violation",
            ConnectorError::ListenerAlreadyRegistered { .. } => "listener_already_registered",
            ConnectorError::Unauthorised { .. } => "unauthorised",
            ConnectorError::UnsupportedProtocol { .. } => "unsupported_protocol",
            ConnectorError::WorkRejected { .. } => "work_rejected",
            ConnectorError::Transaction { .. } => "transaction",
            ConnectorError::Routing { .. } => "routing",
            ConnectorError::Transport { .. } => "transport",
            ConnectorError::Configuration { .. } => "configuration",
            ConnectorError::Io { .. } => "io",
        }
    }

    /// Create a connect error
    pub fn connect(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            resource: resource.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a connect error with source
    pub fn connect_with_source(
        resource: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Connect {
            resource: resource.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a fatal connect error
    pub fn fatal_connect(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FatalConnect {
            resource: resource.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a fatal connect error wrapping the last cause
    pub fn fatal_connect_with_source(
        resource: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::FatalConnect {
            resource: resource.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a dispatch error
    pub fn dispatch(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dispatch {
            endpoint: endpoint.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a dispatch error with source
    pub fn dispatch_with_source(
        endpoint: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Dispatch {
            endpoint: endpoint.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn receive(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Receive {
            endpoint: endpoint.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a receive error with source
    pub fn receive_with_source(
        endpoint: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Receive {
            endpoint: endpoint.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn disposed(resource: impl Into<String>) -> Self {
        Self::Disposed {
            resource: resource.into(),
        }
    }

    pub fn already_initialised(resource: impl Into<String>) -> Self {
        Self::AlreadyInitialised {
            resource: resource.into(),
        }
    }

    pub fn not_initialised(resource: impl Into<String>) -> Self {
        Self::NotInitialised {
            resource: resource.into(),
        }
    }

    /// Create a message access violation error
    pub fn access_violation(message_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AccessViolation {
            message_id: message_id.into(),
            message: message.into(),
        }
    }

    /// Create an authentication failure
    pub fn unauthorised(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unauthorised {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a work rejected error
    pub fn work_rejected(manager: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WorkRejected {
            manager: manager.into(),
            message: message.into(),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Create a routing error with source
    pub fn routing_with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Routing {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }
}

impl From<std::io::Error> for ConnectorError {
    fn from(err: std::io::Error) -> Self {
        ConnectorError::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<anyhow::Error> for ConnectorError {
    fn from(err: anyhow::Error) -> Self {
        ConnectorError::Transport {
            message: err.to_string(),
            source: Some(err.into()),
        }
    }
}

impl From<toml::de::Error> for ConnectorError {
    fn from(err: toml::de::Error) -> Self {
        ConnectorError::configuration(format!("Failed to parse TOML: {}", err), None)
    }
}
