//! Transport connector core
//!
//! A [`Connector`] binds one transport protocol to the bus. It supervises
//! connections through pluggable [`ConnectionStrategy`] policies, lends
//! pooled [`MessageDispatcher`]s and [`MessageRequester`]s for outbound
//! traffic, and owns the [`MessageReceiver`]s that turn inbound transport
//! data into routed [`Message`]s, optionally polling on a fixed delay and
//! inside transactions.
//!
//! Transports plug in through narrow traits: [`ConnectorTransport`],
//! [`DispatcherTransport`], [`RequesterTransport`], [`ReceiverTransport`],
//! [`Poller`] and [`TransactedPoller`], wired together by a
//! [`ServiceDescriptor`].

pub mod config;
pub mod connectable;
pub mod connector;
pub mod descriptor;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod filter;
pub mod logging;
pub mod message;
pub mod notification;
pub mod pool;
pub mod receiver;
pub mod requester;
pub mod retry;
pub mod routing;
pub mod scheduler;
pub mod transaction;
pub mod work;

pub mod test_utils;

pub use config::{
    ConnectorConfig, ExhaustedAction, PollingConfig, PoolConfig, PoolExhaustedAction,
    RetryPolicyConfig, ThreadingProfile,
};
pub use connectable::{Connectable, ExceptionListener, LoggingExceptionListener, WaitableBool};
pub use connector::{Connector, ConnectorBuilder, ConnectorMetrics, ConnectorTransport};
pub use descriptor::{
    DefaultMessageAdapter, DescriptorLookup, IntoMessage, MessageAdapter, NullSessionHandler,
    Registry, ServiceDescriptor, SessionHandler, StaticDescriptorLookup,
};
pub use dispatcher::{
    DispatchHandle, DispatcherTransport, MessageDispatcher, MessageDispatcherFactory,
};
pub use endpoint::{Endpoint, EndpointBuilder, EndpointType, EndpointUri};
pub use error::{BoxError, ConnectorError, Result};
pub use event::Event;
pub use filter::{Filter, SecurityFilter, Transformer};
pub use message::{Attachment, ExceptionPayload, Message, MessageBuilder, Payload, PropertyScope};
pub use notification::{
    LoggingNotificationManager, Notification, NotificationAction, NotificationManager,
};
pub use pool::{KeyedPool, PoolStats, PoolableFactory};
pub use receiver::{
    MessageReceiver, Poller, PollingReceiver, ReceiverTransport, ReceiverWorker,
    TransactedPoller, TransactedPollingReceiver, WorkerHooks,
};
pub use requester::{MessageRequester, MessageRequesterFactory, RequesterTransport};
pub use retry::{ConnectionStrategy, RetryContext, SimpleRetry, SingleAttempt};
pub use routing::{Component, InboundRouter, ResponseRouter, Session};
pub use scheduler::{ScheduleHandle, Scheduler};
pub use transaction::{
    Transaction, TransactionAction, TransactionConfig, TransactionFactory, TransactionTemplate,
};
pub use work::{WorkHandle, WorkManager, WorkStats};
