//! CONNACK interpretation
//!
//! A standard CONNACK body is exactly two bytes (flags, return code). Here the
//! server appends the session credentials as UTF-8 JSON, normally behind a
//! big-endian u16 length prefix.

use super::auth::AuthContext;
use std::fmt;

/// CONNACK return codes (MQTT 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
    Unknown(u8),
}

impl ConnectReturnCode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::UnacceptableProtocolVersion => 1,
            Self::IdentifierRejected => 2,
            Self::ServerUnavailable => 3,
            Self::BadUserNameOrPassword => 4,
            Self::NotAuthorized => 5,
            Self::Unknown(code) => code,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Accepted => "Connection accepted",
            Self::UnacceptableProtocolVersion => "Unacceptable protocol version",
            Self::IdentifierRejected => "Identifier rejected",
            Self::ServerUnavailable => "Server unavailable",
            Self::BadUserNameOrPassword => "Bad user name or password",
            Self::NotAuthorized => "Not authorized",
            Self::Unknown(_) => "Unknown",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Accepted => "",
            Self::UnacceptableProtocolVersion => {
                "The Server does not support the level of the MQTT protocol requested by the client."
            }
            Self::IdentifierRejected => {
                "The client identifier is correct UTF-8 but not allowed by the server."
            }
            Self::ServerUnavailable => {
                "The network connection has been made but the MQTT service is unavailable"
            }
            Self::BadUserNameOrPassword => "The data in the user name or password is malformed.",
            Self::NotAuthorized => "The client is not authorized to connect.",
            Self::Unknown(_) => "The server returned an undefined return code.",
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.code(), self.reason())
    }
}

/// Decoded CONNACK body
#[derive(Debug, Clone, PartialEq)]
pub struct ConnAck {
    pub flags: u8,
    pub return_code: ConnectReturnCode,
    /// Raw session JSON, length prefix removed
    pub payload: Vec<u8>,
}

impl ConnAck {
    /// Split a CONNACK body into header and payload.
    ///
    /// Returns `None` when the body is shorter than the two mandatory bytes.
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 2 {
            return None;
        }
        Some(Self {
            flags: body[0],
            return_code: ConnectReturnCode::from_byte(body[1]),
            payload: strip_length_prefix(&body[2..]).to_vec(),
        })
    }

    /// Decode the session credentials carried in the payload
    pub fn auth(&self) -> Result<AuthContext, ConnAckPayloadError> {
        if self.payload.is_empty() {
            return Err(ConnAckPayloadError::Missing);
        }
        let text =
            std::str::from_utf8(&self.payload).map_err(|_| ConnAckPayloadError::NotUtf8)?;
        AuthContext::from_json(text.as_bytes()).map_err(ConnAckPayloadError::Json)
    }
}

/// Why a CONNACK payload could not be turned into credentials
#[derive(Debug, thiserror::Error)]
pub enum ConnAckPayloadError {
    #[error("CONNACK carries no session payload")]
    Missing,
    #[error("CONNACK payload is not UTF-8")]
    NotUtf8,
    #[error("CONNACK payload is not valid session JSON: {0}")]
    Json(#[source] serde_json::Error),
}

fn strip_length_prefix(rest: &[u8]) -> &[u8] {
    if rest.len() >= 2 {
        let declared = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        if declared == rest.len() - 2 {
            return &rest[2..];
        }
    }
    rest
}
