//! Connection, security and message notifications
//!
//! Notifications are fire-and-forget. A manager that fails to publish one
//! never breaks the operation that fired it.

use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationAction {
    ConnectionConnected,
    ConnectionFailed,
    ConnectionDisconnected,
    SecurityAuthenticationFailed,
    MessageReceived,
    MessageDispatched,
    MessageSent,
    MessageRequested,
}

impl fmt::Display for NotificationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationAction::ConnectionConnected => "connection.connected",
            NotificationAction::ConnectionFailed => "connection.failed",
            NotificationAction::ConnectionDisconnected => "connection.disconnected",
            NotificationAction::SecurityAuthenticationFailed => "security.authentication_failed",
            NotificationAction::MessageReceived => "message.received",
            NotificationAction::MessageDispatched => "message.dispatched",
            NotificationAction::MessageSent => "message.sent",
            NotificationAction::MessageRequested => "message.requested",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub action: NotificationAction,
    /// Connector, receiver or endpoint the notification is about
    pub resource: String,
    pub detail: Option<String>,
    pub timestamp: SystemTime,
}

impl Notification {
    pub fn new(action: NotificationAction, resource: impl Into<String>) -> Self {
        Self {
            action,
            resource: resource.into(),
            detail: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[async_trait]
pub trait NotificationManager: Send + Sync {
    async fn fire(&self, notification: Notification) -> Result<()>;
}

/// Manager that writes notifications to the log. Connectors built without a
/// manager use this one.
#[derive(Debug, Default, Clone)]
pub struct LoggingNotificationManager;

#[async_trait]
impl NotificationManager for LoggingNotificationManager {
    async fn fire(&self, notification: Notification) -> Result<()> {
        tracing::debug!(
            action = %notification.action,
            resource = %notification.resource,
            detail = notification.detail.as_deref().unwrap_or(""),
            "Notification"
        );
        Ok(())
    }
}
