//! Single-writer message access across tasks

use connector::message::AccessToken;
use connector::{ConnectorError, Message, PropertyScope};
use std::sync::Arc;

#[tokio::test]
async fn test_owner_reads_and_writes_freely() {
    let message = Arc::new(Message::new("order"));
    message.set_property("step", 1).unwrap();
    message.set_payload("order v2").unwrap();

    assert_eq!(message.access_guard().owner(), Some(AccessToken::current()));
    assert!(message.access_guard().is_mutable());
    assert_eq!(message.int_property("step", 0), 1);
    assert_eq!(message.payload().as_text(), Some("order v2"));
}

#[tokio::test]
async fn test_foreign_read_freezes_message() {
    let message = Arc::new(Message::new("order"));
    message.set_property("step", 1).unwrap();

    let reader = message.clone();
    let seen = tokio::spawn(async move { reader.int_property("step", 0) })
        .await
        .unwrap();
    assert_eq!(seen, 1);

    assert!(!message.access_guard().is_mutable());
    let err = message.set_property("step", 2).unwrap_err();
    assert!(matches!(err, ConnectorError::AccessViolation { .. }));
    assert!(err.to_string().contains("immutable"));
    // reads still work for everyone
    assert_eq!(message.int_property("step", 0), 1);
}

#[tokio::test]
async fn test_non_owner_write_is_rejected() {
    let message = Arc::new(Message::new("order"));
    message.set_property("owner", "main").unwrap();

    let writer = message.clone();
    let result = tokio::spawn(async move { writer.set_property("owner", "worker") })
        .await
        .unwrap();

    let err = result.unwrap_err();
    assert!(matches!(err, ConnectorError::AccessViolation { .. }));
    assert_eq!(message.string_property("owner").as_deref(), Some("main"));
}

#[tokio::test]
async fn test_reset_hands_message_to_another_task() {
    let message = Arc::new(Message::new("order"));
    message.set_property("stage", "received").unwrap();
    message.reset_access_control();

    let worker = message.clone();
    tokio::spawn(async move { worker.set_property("stage", "processed") })
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(message.access_guard().owner(), Some(AccessToken::Task(_))));
    assert!(message.set_property("stage", "late").is_err());
}

#[tokio::test]
async fn test_detached_copy_has_its_own_owner() {
    let message = Arc::new(Message::new("order"));
    message.set_property("k", "v").unwrap();

    let copy = message.detached_copy();
    let result = tokio::spawn(async move {
        copy.set_property("k", "changed")?;
        Ok::<_, ConnectorError>(copy)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(result.id(), message.id());
    assert_eq!(message.string_property("k").as_deref(), Some("v"));
}

#[test]
fn test_inbound_properties_are_read_only() {
    let message = Message::builder("x")
        .inbound_property("content-type", "text/plain")
        .build();

    assert_eq!(
        message.property_in(PropertyScope::Inbound, "content-type"),
        Some("text/plain".into())
    );
    let err = message
        .set_property_in(PropertyScope::Inbound, "content-type", "x")
        .unwrap_err();
    assert!(matches!(err, ConnectorError::AccessViolation { .. }));
}
