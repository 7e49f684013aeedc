//! Pure connection configuration and state for the MQTT transport
//!
//! Nothing here touches the network: endpoint resolution from the broker
//! URL, connection state, reconnection backoff and the transport error type.

use super::codec::CodecError;
use crate::config::ServerSection;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state of the transport
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Socket established and CONNECT written
    Connected,
    /// Disconnected with reason
    Disconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for the given 1-based attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Connection to {address} timed out")]
    ConnectTimeout { address: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Framing error: {0}")]
    Codec(#[from] CodecError),
}

/// Where and how to reach the broker
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub connect_timeout: Duration,
    pub keepalive: Duration,
}

impl BrokerEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolve the endpoint from the `[server]` section
pub fn configure_endpoint(config: &ServerSection) -> Result<BrokerEndpoint, TransportError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| TransportError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let tls = match url.scheme() {
        "mqtts" | "ssl" => true,
        "mqtt" | "tcp" => false,
        _ => return Err(TransportError::InvalidBrokerUrl(config.broker_url.clone())),
    };
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        tls,
        connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        keepalive: Duration::from_secs(u64::from(config.keepalive_secs)),
    })
}
