//! Wire formats of the MQTToT push channel
//!
//! Everything here is pure: frame building, auth payload serialization,
//! CONNACK interpretation and payload decoding. Sockets live in
//! [`crate::transport`].

pub mod auth;
pub mod compression;
pub mod connack;
pub mod connect;
pub mod notification;
pub mod profile;
pub mod registration;
pub mod strict;
pub mod thrift;
pub mod topics;

pub use auth::AuthContext;
pub use connack::{ConnAck, ConnectReturnCode};
pub use connect::{build_connect_frame, encode_auth_payload, ConnectOptions, EncodeError};
pub use notification::{BadgeCount, DeepLink, NotificationRecord, PushNotification, QueryValue};
pub use profile::ClientProfile;
pub use registration::{RegistrationRequest, RegistrationResponse};
pub use strict::DecodeError;
pub use topics::TopicId;
