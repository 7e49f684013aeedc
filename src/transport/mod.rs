//! Transport layer for the push channel
//!
//! The [`Transport`] trait is the seam between the pure handshake logic and
//! the network, so the client driver can be exercised against
//! [`crate::testing::MockTransport`].

use bytes::Bytes;

pub mod mqtt;

pub use mqtt::codec::QoS;

/// Inbound events surfaced by a transport, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// CONNACK body after the fixed header
    ConnAck { body: Bytes },
    /// PUBLISH on some topic; payload still compressed
    Message { topic: String, payload: Bytes },
    /// Connection closed or lost
    Disconnected { reason: String },
}

/// Byte-level connection to the push server
#[async_trait::async_trait]
pub trait Transport: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open the socket (and TLS session when configured)
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Write a pre-built frame verbatim (used for CONNECT)
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), Self::Error>;

    /// Publish a payload on a topic
    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), Self::Error>;

    /// Wait for the next inbound event
    async fn next_event(&mut self) -> Result<TransportEvent, Self::Error>;

    /// Close the connection, sending DISCONNECT when possible
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    fn is_connected(&self) -> bool;
}
