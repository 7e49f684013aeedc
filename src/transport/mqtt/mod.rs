//! MQTT 3.1 transport for the MQTToT variant
//!
//! Split the same way as the rest of the crate: pure parts first, I/O last.
//!
//! - [`codec`] - packet framing over rumqttc's `mqttbytes`
//! - [`connection`] - endpoint resolution, state, backoff configuration
//! - [`health_monitor`] - reconnection decisions
//! - [`client`] - socket I/O over TCP or TLS
//!
//! # Usage
//!
//! ```rust,no_run
//! use fbns_mqtt::config::ServerSection;
//! use fbns_mqtt::transport::{mqtt::MqttClient, Transport};
//!
//! # tokio_test::block_on(async {
//! let mut client = MqttClient::new(&ServerSection::default())?;
//! client.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod health_monitor;

pub use client::MqttClient;
pub use connection::{BrokerEndpoint, ConnectionState, ReconnectConfig, TransportError};
pub use health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
