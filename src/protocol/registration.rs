//! Delivery token registration messages
//!
//! After authentication the client publishes a [`RegistrationRequest`] on
//! topic 79 and the server answers on topic 80 with either a token or an
//! error string.

use super::compression;
use super::profile::ClientProfile;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Body published on the registration request topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub pkg_name: String,
    pub appid: String,
}

impl RegistrationRequest {
    pub fn new(pkg_name: impl Into<String>, appid: impl Into<String>) -> Self {
        Self {
            pkg_name: pkg_name.into(),
            appid: appid.into(),
        }
    }

    pub fn from_profile(profile: &ClientProfile) -> Self {
        Self::new(&profile.package_name, &profile.analytics_app_id)
    }

    /// JSON then zlib, ready to publish
    pub fn encode(&self) -> Result<Vec<u8>, RegistrationError> {
        let json = serde_json::to_vec(self).map_err(RegistrationError::Json)?;
        compression::compress(&json).map_err(RegistrationError::Compression)
    }
}

/// Outcome reported on the registration response topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationResponse {
    Token(String),
    Error(String),
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Registration JSON error: {0}")]
    Json(#[source] serde_json::Error),

    #[error("Registration payload compression failed: {0}")]
    Compression(#[source] std::io::Error),

    #[error("Registration response carries neither token nor error")]
    Empty,
}

impl RegistrationResponse {
    /// Interpret an already-decompressed response body.
    ///
    /// A non-empty `error` wins over any token in the same message.
    pub fn from_json(data: &[u8]) -> Result<Self, RegistrationError> {
        let value: Value = serde_json::from_slice(data).map_err(RegistrationError::Json)?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, RegistrationError> {
        if let Some(error) = non_empty(value.get("error")) {
            return Ok(Self::Error(error));
        }
        non_empty(value.get("token"))
            .map(Self::Token)
            .ok_or(RegistrationError::Empty)
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encodes_to_compressed_json() {
        let request = RegistrationRequest::from_profile(&ClientProfile::default());
        let decoded = compression::decompress(&request.encode().unwrap()).unwrap();

        assert_eq!(decoded, serde_json::to_vec(&request).unwrap());
        assert_eq!(
            decoded,
            br#"{"pkg_name":"com.instagram.android","appid":"567067343352427"}"#.to_vec()
        );
    }

    #[test]
    fn test_response_token() {
        let response = RegistrationResponse::from_json(br#"{"token":"T"}"#).unwrap();
        assert_eq!(response, RegistrationResponse::Token("T".to_string()));
    }

    #[test]
    fn test_response_error_wins() {
        let response =
            RegistrationResponse::from_json(br#"{"token":"T","error":"bad package"}"#).unwrap();
        assert_eq!(response, RegistrationResponse::Error("bad package".to_string()));
    }

    #[test]
    fn test_response_blank_error_ignored() {
        let response = RegistrationResponse::from_json(br#"{"token":"T","error":""}"#).unwrap();
        assert_eq!(response, RegistrationResponse::Token("T".to_string()));
    }

    #[test]
    fn test_response_empty() {
        assert!(matches!(
            RegistrationResponse::from_json(b"{}"),
            Err(RegistrationError::Empty)
        ));
        assert!(matches!(
            RegistrationResponse::from_json(b"nope"),
            Err(RegistrationError::Json(_))
        ));
    }
}
