//! Mock implementations for testing
//!
//! [`MockTransport`] replays a scripted sequence of inbound events and
//! records everything written to it, so the client and listener can be
//! exercised without a broker.

use crate::transport::{QoS, Transport, TransportEvent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

pub type PublishedMessage = (String, Vec<u8>, QoS);

#[derive(Debug, Error)]
#[error("mock transport: {0}")]
pub struct MockTransportError(pub String);

#[derive(Debug, Default)]
struct MockState {
    events: VecDeque<TransportEvent>,
    sent_frames: Vec<Vec<u8>>,
    published: Vec<PublishedMessage>,
    connected: bool,
    connect_count: u32,
    fail_connect: bool,
    hold_open: bool,
}

/// Scripted transport. Clones share state, so a test can keep a handle
/// after moving one into a client.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `connect` call fails
    pub fn failing_connect() -> Self {
        let transport = Self::new();
        transport.lock().fail_connect = true;
        transport
    }

    /// Block in `next_event` once the script is exhausted instead of
    /// reporting a disconnect
    pub fn hold_open(self) -> Self {
        self.lock().hold_open = true;
        self
    }

    pub fn push_event(&self, event: TransportEvent) {
        self.lock().events.push_back(event);
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.lock().sent_frames.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connect_count
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        let mut state = self.lock();
        state.connect_count += 1;
        if state.fail_connect {
            return Err(MockTransportError("connection refused".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), Self::Error> {
        let mut state = self.lock();
        if !state.connected {
            return Err(MockTransportError("not connected".to_string()));
        }
        state.sent_frames.push(frame);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), Self::Error> {
        let mut state = self.lock();
        if !state.connected {
            return Err(MockTransportError("not connected".to_string()));
        }
        state.published.push((topic.to_string(), payload, qos));
        Ok(())
    }

    async fn next_event(&mut self) -> Result<TransportEvent, Self::Error> {
        let hold_open = {
            let mut state = self.lock();
            if let Some(event) = state.events.pop_front() {
                if matches!(event, TransportEvent::Disconnected { .. }) {
                    state.connected = false;
                }
                return Ok(event);
            }
            if !state.hold_open {
                state.connected = false;
            }
            state.hold_open
        };

        if hold_open {
            std::future::pending::<()>().await;
        }
        Ok(TransportEvent::Disconnected {
            reason: "script exhausted".to_string(),
        })
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.lock().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_mock_replays_script_then_disconnects() {
        let mut transport = MockTransport::new();
        transport.push_event(TransportEvent::ConnAck {
            body: Bytes::from_static(&[0, 0]),
        });

        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        assert!(matches!(
            transport.next_event().await.unwrap(),
            TransportEvent::ConnAck { .. }
        ));
        assert!(matches!(
            transport.next_event().await.unwrap(),
            TransportEvent::Disconnected { .. }
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_mock_records_writes_across_clones() {
        let handle = MockTransport::new();
        let mut transport = handle.clone();

        transport.connect().await.unwrap();
        transport.send_frame(vec![0x10]).await.unwrap();
        transport
            .publish("79", vec![1, 2], QoS::AtLeastOnce)
            .await
            .unwrap();

        assert_eq!(handle.sent_frames(), vec![vec![0x10]]);
        assert_eq!(handle.published()[0].0, "79");
        assert_eq!(handle.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_rejects_writes_when_disconnected() {
        let mut transport = MockTransport::new();
        assert!(transport.send_frame(vec![0x10]).await.is_err());
    }
}
