//! Listener behavior over a scripted transport
//!
//! Covers what an application relies on: persisted credentials are reused,
//! fresh credentials are saved before the token arrives, and shutdown is
//! honoured promptly.

use bytes::Bytes;
use chrono::Utc;
use fbns_mqtt::config::{FbnsConfig, ReconnectSection};
use fbns_mqtt::error::FbnsError;
use fbns_mqtt::listener::{Listener, ListenerEvent};
use fbns_mqtt::protocol::compression::{compress, decompress};
use fbns_mqtt::protocol::connect::ConnectHeader;
use fbns_mqtt::protocol::AuthContext;
use fbns_mqtt::session::{SessionState, SessionStore};
use fbns_mqtt::testing::MockTransport;
use fbns_mqtt::transport::TransportEvent;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

fn test_config(dir: &TempDir, max_attempts: u32) -> FbnsConfig {
    let mut config = FbnsConfig::default();
    config.session.state_file = dir.path().join("state/session.json");
    config.reconnect = ReconnectSection {
        max_attempts: Some(max_attempts),
        backoff_ms: vec![1, 2],
        sustained_delay_ms: 2,
    };
    config
}

fn connack(json: &str) -> TransportEvent {
    let mut body = vec![0x00, 0x00];
    body.extend_from_slice(json.as_bytes());
    TransportEvent::ConnAck {
        body: Bytes::from(body),
    }
}

fn publish(topic: &str, json: &str) -> TransportEvent {
    TransportEvent::Message {
        topic: topic.to_string(),
        payload: Bytes::from(compress(json.as_bytes()).unwrap()),
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[tokio::test]
async fn test_persisted_credentials_are_sent_in_connect() {
    // Arrange
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, 1);
    let mut state = SessionState::default();
    state.record_auth(
        AuthContext::new(99, "persisted-password", "device-secret", "dev-fedcba9876543210"),
        Utc::now(),
    );
    SessionStore::new(&config.session.state_file).save(&state).unwrap();

    let transport = MockTransport::new();
    let (_tx, rx) = watch::channel(false);
    let (sink, _events) = mpsc::unbounded_channel();

    // Act
    let result = Listener::with_transport(config, transport.clone()).run(rx, sink).await;

    // Assert
    assert!(matches!(result, Err(FbnsError::ReconnectExhausted { .. })));
    let frames = transport.sent_frames();
    assert!(!frames.is_empty());
    let (_, payload) = ConnectHeader::parse(&frames[0]).unwrap();
    let connect_struct = decompress(payload).unwrap();
    assert!(contains(&connect_struct, b"persisted-password"));
    assert!(contains(&connect_struct, b"fedcba9876543210"));
}

#[tokio::test]
async fn test_new_credentials_replace_persisted_ones() {
    // Arrange
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, 1);
    let store = SessionStore::new(&config.session.state_file);
    let mut state = SessionState::default();
    state.record_auth(AuthContext::new(1, "old", "", ""), Utc::now());
    store.save(&state).unwrap();

    let transport = MockTransport::new();
    transport.push_event(connack(r#"{"ck":2,"cs":"new","ds":"ds","di":"di"}"#));
    let (_tx, rx) = watch::channel(false);
    let (sink, _events) = mpsc::unbounded_channel();

    // Act
    let _ = Listener::with_transport(config, transport.clone()).run(rx, sink).await;

    // Assert: saved, and the reconnect used the new password
    let saved = store.load().unwrap();
    let auth = saved.auth.unwrap();
    assert_eq!(auth.user_id(), 2);
    assert_eq!(auth.password(), "new");
    assert!(saved.auth_received_at.is_some());

    let frames = transport.sent_frames();
    assert_eq!(frames.len(), 2);
    let (_, payload) = ConnectHeader::parse(&frames[1]).unwrap();
    assert!(contains(&decompress(payload).unwrap(), b"new"));
}

#[tokio::test]
async fn test_events_are_forwarded_in_order() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new().hold_open();
    transport.push_event(connack(r#"{"ck":3}"#));
    transport.push_event(publish("/fbns_reg_resp", r#"{"token":"abc"}"#));
    transport.push_event(publish("/fbns_msg", r#"{"nid":"1"}"#));
    transport.push_event(publish("76", r#"{"nid":"2"}"#));
    let (tx, rx) = watch::channel(false);
    let (sink, mut events) = mpsc::unbounded_channel();

    let handle = tokio::spawn(Listener::with_transport(test_config(&dir, 3), transport).run(rx, sink));

    assert_eq!(events.recv().await, Some(ListenerEvent::NewToken("abc".to_string())));
    for expected in ["1", "2"] {
        match events.recv().await {
            Some(ListenerEvent::Push(push)) => {
                assert_eq!(push.notification_id.as_deref(), Some(expected))
            }
            other => panic!("expected push {expected}, got {other:?}"),
        }
    }

    tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap();
    assert!(result.unwrap().is_ok());
}

#[tokio::test]
async fn test_shutdown_during_backoff() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, 10);
    config.reconnect.backoff_ms = vec![60_000];
    config.reconnect.sustained_delay_ms = 60_000;
    let transport = MockTransport::new();
    let (tx, rx) = watch::channel(false);
    let (sink, _events) = mpsc::unbounded_channel();

    let handle = tokio::spawn(Listener::with_transport(config, transport.clone()).run(rx, sink));
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap();
    assert!(result.unwrap().is_ok());
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn test_registration_rejection_is_fatal() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    transport.push_event(connack(r#"{"ck":3}"#));
    transport.push_event(publish("80", r#"{"error":"unknown package"}"#));
    let (_tx, rx) = watch::channel(false);
    let (sink, _events) = mpsc::unbounded_channel();

    let err = Listener::with_transport(test_config(&dir, 5), transport.clone())
        .run(rx, sink)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("unknown package"));
    assert_eq!(transport.connect_count(), 1);
}
