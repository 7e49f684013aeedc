//! Pure routing of inbound PUBLISH payloads by topic
//!
//! Every payload on the known topics is zlib-compressed JSON. The topic is
//! checked first so traffic on unrelated topics is never decompressed.

use crate::protocol::compression;
use crate::protocol::notification::PushNotification;
use crate::protocol::registration::{RegistrationError, RegistrationResponse};
use crate::protocol::strict::DecodeError;
use crate::protocol::topics::TopicId;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Push(PushNotification),
    RegistrationResponse(RegistrationResponse),
    /// Topic this client does not consume
    Unknown { topic: String },
}

/// Per-message decode failures; never terminate the session on their own
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Payload decompression failed: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Push decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Registration response invalid: {0}")]
    Registration(#[from] RegistrationError),
}

pub struct MessageDispatcher;

impl MessageDispatcher {
    /// Topics whose payloads this client decodes
    pub fn route(topic: &str) -> Option<TopicId> {
        match TopicId::from_topic(topic) {
            Some(TopicId::RegistrationRequest) | None => None,
            consumed => consumed,
        }
    }

    pub fn dispatch(topic: &str, payload: &[u8]) -> Result<Dispatch, DispatchError> {
        let Some(route) = Self::route(topic) else {
            debug!(topic, bytes = payload.len(), "Ignoring message on unknown topic");
            return Ok(Dispatch::Unknown {
                topic: topic.to_string(),
            });
        };

        let json = Self::decode_payload(payload)?;
        match route {
            TopicId::MessageDelivery => Ok(Dispatch::Push(PushNotification::from_value(json)?)),
            TopicId::RegistrationResponse => Ok(Dispatch::RegistrationResponse(
                RegistrationResponse::from_value(&json)?,
            )),
            TopicId::RegistrationRequest => Ok(Dispatch::Unknown {
                topic: topic.to_string(),
            }),
        }
    }

    /// zlib-inflate then parse as JSON
    pub fn decode_payload(payload: &[u8]) -> Result<Value, DispatchError> {
        let raw = compression::decompress(payload).map_err(DispatchError::Decompress)?;
        serde_json::from_slice(&raw).map_err(DispatchError::InvalidJson)
    }
}
