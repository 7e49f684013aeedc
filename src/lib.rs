//! Client for the MQTToT push-notification transport
//!
//! MQTToT is MQTT 3.1 with a non-standard CONNECT: the payload is a
//! zlib-compressed Thrift struct carrying device credentials, and the
//! server answers with fresh credentials inside CONNACK. After that the
//! client registers for a delivery token and receives pushes as
//! zlib-compressed JSON.
//!
//! # Layout
//!
//! - [`protocol`] - pure encoders and decoders (CONNECT payload, CONNACK,
//!   registration, notifications)
//! - [`transport`] - the [`transport::Transport`] seam and its TCP/TLS
//!   implementation
//! - [`client`] - handshake state machine and the driver that runs it
//! - [`session`] - persisted credentials and token policy
//! - [`listener`] - reconnecting long-running listener
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use fbns_mqtt::config::FbnsConfig;
//! use fbns_mqtt::listener::{Listener, ListenerEvent};
//! use tokio::sync::{mpsc, watch};
//!
//! # tokio_test::block_on(async {
//! let listener = Listener::new(FbnsConfig::default())?;
//! let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//! let (sink, mut events) = mpsc::unbounded_channel();
//! tokio::spawn(listener.run(shutdown_rx, sink));
//!
//! while let Some(ListenerEvent::Push(push)) = events.recv().await {
//!     println!("{:?}", push.payload.and_then(|p| p.message));
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod transport;

pub use client::{EventHandlers, FbnsClient};
pub use config::FbnsConfig;
pub use error::{FbnsError, FbnsResult};
pub use listener::{Listener, ListenerEvent};
pub use protocol::*;
pub use transport::mqtt::MqttClient;
