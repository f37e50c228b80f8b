//! Bus message envelope
//!
//! A [`Message`] carries a payload, scoped properties, attachments and an
//! optional exception payload. It is shared between components as
//! `Arc<Message>` and every access goes through its [`AccessGuard`].

mod access;
mod properties;

pub use access::{set_unsafe_access, unsafe_access_enabled, AccessGuard, AccessToken};
pub use properties::{
    PropertyScope, CORRELATION_GROUP_SIZE_PROPERTY, CORRELATION_ID_PROPERTY,
    CORRELATION_SEQUENCE_PROPERTY, REMOTE_SYNC_PROPERTY, REPLY_TO_PROPERTY,
};

use crate::{ConnectorError, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use properties::ScopedProperties;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

pub const DEFAULT_ENCODING: &str = "UTF-8";

/// Message body
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Null,
    Bytes(Bytes),
    Text(String),
    Json(Value),
}

impl Payload {
    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }

    /// Raw bytes of the payload (JSON is serialized)
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Null => Bytes::new(),
            Payload::Bytes(bytes) => bytes.clone(),
            Payload::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            Payload::Json(value) => Bytes::from(value.to_string()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(value))
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Bytes(value)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// Named binary part carried next to the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub content_type: String,
    pub data: Bytes,
}

impl Attachment {
    pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }
}

/// Failure recorded on a result message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionPayload {
    /// Error kind, see [`ConnectorError::kind`]
    pub kind: String,
    pub message: String,
    /// Transport-specific error code, stamped by the receiver
    pub code: Option<String>,
}

impl ExceptionPayload {
    pub fn from_error(error: &ConnectorError) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            code: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MessageState {
    payload: Payload,
    encoding: String,
    properties: ScopedProperties,
    attachments: HashMap<String, Attachment>,
    exception: Option<ExceptionPayload>,
}

pub struct Message {
    id: String,
    guard: AccessGuard,
    state: RwLock<MessageState>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Message {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self::from_state(
            uuid::Uuid::new_v4().to_string(),
            MessageState {
                payload: payload.into(),
                encoding: DEFAULT_ENCODING.to_string(),
                ..Default::default()
            },
        )
    }

    /// Message with a null payload
    pub fn null() -> Self {
        Self::new(Payload::Null)
    }

    pub fn builder(payload: impl Into<Payload>) -> MessageBuilder {
        MessageBuilder::new(payload)
    }

    fn from_state(id: String, state: MessageState) -> Self {
        Self {
            id,
            guard: AccessGuard::new(),
            state: RwLock::new(state),
        }
    }

    /// Unique id, readable without touching the access guard
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn access_guard(&self) -> &AccessGuard {
        &self.guard
    }

    /// Clear ownership before handing the message to another task
    pub fn reset_access_control(&self) {
        self.guard.reset();
    }

    /// Copy with the same id and a fresh access guard
    pub fn detached_copy(&self) -> Message {
        self.guard.check_read();
        let state = self.state.read().clone();
        Self::from_state(self.id.clone(), state)
    }

    fn read<R>(&self, f: impl FnOnce(&MessageState) -> R) -> R {
        self.guard.check_read();
        let state = self.state.read();
        f(&*state)
    }

    fn write<R>(&self, f: impl FnOnce(&mut MessageState) -> R) -> Result<R> {
        self.guard.check_write(&self.id)?;
        let mut state = self.state.write();
        Ok(f(&mut *state))
    }

    pub fn payload(&self) -> Payload {
        self.read(|s| s.payload.clone())
    }

    pub fn set_payload(&self, payload: impl Into<Payload>) -> Result<()> {
        let payload = payload.into();
        self.write(|s| s.payload = payload)
    }

    pub fn encoding(&self) -> String {
        self.read(|s| s.encoding.clone())
    }

    pub fn set_encoding(&self, encoding: impl Into<String>) -> Result<()> {
        let encoding = encoding.into();
        self.write(|s| s.encoding = encoding)
    }

    /// Look a property up across scopes
    pub fn property(&self, name: &str) -> Option<Value> {
        self.read(|s| s.properties.get(name).cloned())
    }

    pub fn property_in(&self, scope: PropertyScope, name: &str) -> Option<Value> {
        self.read(|s| s.properties.get_in(scope, name).cloned())
    }

    /// Set an outbound property
    pub fn set_property(&self, name: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        self.set_property_in(PropertyScope::Outbound, name, value)
    }

    pub fn set_property_in(
        &self,
        scope: PropertyScope,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<()> {
        if scope == PropertyScope::Inbound {
            return Err(ConnectorError::access_violation(
                &self.id,
                "Inbound properties are read-only",
            ));
        }
        let name = name.into();
        let value = value.into();
        self.write(|s| {
            s.properties.insert(scope, name, value);
        })
    }

    pub fn remove_property(&self, name: &str) -> Result<Option<Value>> {
        self.write(|s| s.properties.remove(name))
    }

    pub fn property_names(&self, scope: PropertyScope) -> Vec<String> {
        self.read(|s| s.properties.names(scope))
    }

    pub fn bool_property(&self, name: &str, default: bool) -> bool {
        match self.property(name) {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn int_property(&self, name: &str, default: i64) -> i64 {
        match self.property(name) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn string_property(&self, name: &str) -> Option<String> {
        match self.property(name)? {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn correlation_id(&self) -> Option<String> {
        self.string_property(CORRELATION_ID_PROPERTY)
    }

    pub fn set_correlation_id(&self, id: impl Into<String>) -> Result<()> {
        self.set_property(CORRELATION_ID_PROPERTY, id.into())
    }

    pub fn correlation_sequence(&self) -> Option<i64> {
        self.property(CORRELATION_SEQUENCE_PROPERTY)
            .and_then(|v| v.as_i64())
    }

    pub fn set_correlation_sequence(&self, sequence: i64) -> Result<()> {
        self.set_property(CORRELATION_SEQUENCE_PROPERTY, sequence)
    }

    pub fn correlation_group_size(&self) -> Option<i64> {
        self.property(CORRELATION_GROUP_SIZE_PROPERTY)
            .and_then(|v| v.as_i64())
    }

    pub fn set_correlation_group_size(&self, size: i64) -> Result<()> {
        self.set_property(CORRELATION_GROUP_SIZE_PROPERTY, size)
    }

    pub fn reply_to(&self) -> Option<String> {
        self.string_property(REPLY_TO_PROPERTY)
    }

    pub fn set_reply_to(&self, reply_to: impl Into<String>) -> Result<()> {
        self.set_property(REPLY_TO_PROPERTY, reply_to.into())
    }

    pub fn attachment(&self, name: &str) -> Option<Attachment> {
        self.read(|s| s.attachments.get(name).cloned())
    }

    pub fn attachment_names(&self) -> Vec<String> {
        self.read(|s| {
            let mut names: Vec<String> = s.attachments.keys().cloned().collect();
            names.sort();
            names
        })
    }

    pub fn add_attachment(&self, name: impl Into<String>, attachment: Attachment) -> Result<()> {
        let name = name.into();
        self.write(|s| {
            s.attachments.insert(name, attachment);
        })
    }

    pub fn remove_attachment(&self, name: &str) -> Result<Option<Attachment>> {
        self.write(|s| s.attachments.remove(name))
    }

    pub fn exception_payload(&self) -> Option<ExceptionPayload> {
        self.read(|s| s.exception.clone())
    }

    pub fn set_exception_payload(&self, exception: Option<ExceptionPayload>) -> Result<()> {
        self.write(|s| s.exception = exception)
    }
}

/// Builds a message before it is shared, including its inbound properties
#[derive(Debug, Default)]
pub struct MessageBuilder {
    id: Option<String>,
    state: MessageState,
}

impl MessageBuilder {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            id: None,
            state: MessageState {
                payload: payload.into(),
                encoding: DEFAULT_ENCODING.to_string(),
                ..Default::default()
            },
        }
    }

    /// Reuse an id assigned by the transport
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.state.encoding = encoding.into();
        self
    }

    pub fn inbound_property(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.property(PropertyScope::Inbound, name, value)
    }

    pub fn property(
        mut self,
        scope: PropertyScope,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.state
            .properties
            .insert(scope, name.into(), value.into());
        self
    }

    pub fn attachment(mut self, name: impl Into<String>, attachment: Attachment) -> Self {
        self.state.attachments.insert(name.into(), attachment);
        self
    }

    pub fn exception_payload(mut self, exception: ExceptionPayload) -> Self {
        self.state.exception = Some(exception);
        self
    }

    pub fn build(self) -> Message {
        let id = self
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Message::from_state(id, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_new_message_defaults() {
        let message = Message::new("hello");
        assert_eq!(message.payload(), Payload::Text("hello".into()));
        assert_eq!(message.encoding(), DEFAULT_ENCODING);
        assert!(message.exception_payload().is_none());
        assert_eq!(message.id().len(), 36);
        assert_ne!(Message::null().id(), message.id());
    }

    #[test]
    fn test_scoped_properties() {
        let message = Message::builder(b"raw".to_vec())
            .inbound_property("content-type", "text/plain")
            .build();

        assert_eq!(
            message.property("content-type"),
            Some(json!("text/plain"))
        );

        let err = message
            .set_property_in(PropertyScope::Inbound, "content-type", "x")
            .unwrap_err();
        assert!(matches!(err, ConnectorError::AccessViolation { .. }));

        message.set_property("priority", 7).unwrap();
        assert_eq!(message.int_property("priority", 0), 7);
        assert_eq!(
            message.property_names(PropertyScope::Outbound),
            vec!["priority".to_string()]
        );

        assert_eq!(message.remove_property("priority").unwrap(), Some(json!(7)));
        assert_eq!(message.int_property("priority", -1), -1);
    }

    #[test]
    fn test_typed_getters_parse_strings() {
        let message = Message::null();
        message.set_property("flag", "true").unwrap();
        message.set_property("count", "42").unwrap();

        assert!(message.bool_property("flag", false));
        assert_eq!(message.int_property("count", 0), 42);
        assert!(!message.bool_property("missing", false));
        assert_eq!(message.string_property("count"), Some("42".to_string()));
    }

    #[test]
    fn test_correlation_fields() {
        let message = Message::new("order");
        message.set_correlation_id("batch-7").unwrap();
        message.set_correlation_sequence(2).unwrap();
        message.set_correlation_group_size(5).unwrap();
        message.set_reply_to("queue://replies").unwrap();

        assert_eq!(message.correlation_id().as_deref(), Some("batch-7"));
        assert_eq!(message.correlation_sequence(), Some(2));
        assert_eq!(message.correlation_group_size(), Some(5));
        assert_eq!(message.reply_to().as_deref(), Some("queue://replies"));
    }

    #[test]
    fn test_attachments() {
        let message = Message::new("body");
        message
            .add_attachment("logo", Attachment::new("image/png", vec![1u8, 2, 3]))
            .unwrap();

        assert_eq!(message.attachment_names(), vec!["logo".to_string()]);
        assert_eq!(
            message.attachment("logo").unwrap().data,
            Bytes::from_static(&[1, 2, 3])
        );
        assert!(message.remove_attachment("logo").unwrap().is_some());
        assert!(message.attachment("logo").is_none());
    }

    #[test]
    fn test_exception_payload_from_error() {
        let message = Message::null();
        let error = ConnectorError::dispatch("test://out", "boom");
        message
            .set_exception_payload(Some(ExceptionPayload::from_error(&error)))
            .unwrap();

        let payload = message.exception_payload().unwrap();
        assert_eq!(payload.kind, "dispatch");
        assert!(payload.message.contains("boom"));
        assert!(payload.code.is_none());
    }

    #[test]
    fn test_detached_copy_has_fresh_owner() {
        let message = Arc::new(Message::new("payload"));
        message.set_payload("owned").unwrap();

        let copy = message.detached_copy();
        assert_eq!(copy.id(), message.id());
        assert!(copy.access_guard().owner().is_none());

        let result = std::thread::spawn(move || copy.set_payload("moved"))
            .join()
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_payload_bytes() {
        assert!(Payload::Null.to_bytes().is_empty());
        assert_eq!(Payload::from("ab").to_bytes(), Bytes::from_static(b"ab"));
        assert_eq!(
            Payload::Json(json!({"a": 1})).to_bytes(),
            Bytes::from_static(br#"{"a":1}"#)
        );
        assert_eq!(Payload::from("ab").as_text(), Some("ab"));
    }
}
