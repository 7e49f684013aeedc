//! Crate-level error type and log redaction
//!
//! Each layer keeps its own error enum; [`FbnsError`] gathers them for the
//! listener and the binary. Anything that may contain credentials goes
//! through [`sanitize_for_log`] before it reaches a log line.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

const MAX_LOGGED_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

#[derive(Debug, Error)]
pub enum FbnsError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::mqtt::TransportError),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] crate::client::HandshakeError),

    #[error("Client error: {0}")]
    Client(#[from] crate::client::ClientError),

    #[error("Session storage error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("Reconnection abandoned after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl FbnsError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Message safe to write to logs
    pub fn sanitized(&self) -> String {
        sanitize_for_log(&self.to_string())
    }
}

pub type FbnsResult<T> = Result<T, FbnsError>;

/// `key=value` / `key: value` secrets in free text
static PLAIN_SECRET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(password|token|secret|cs|ds)[=:]\s*[^\s,}]+").expect("static regex")
});

/// Credential fields inside embedded JSON
static JSON_SECRET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)"(password|token|cs|ds)"\s*:\s*"[^"]*""#).expect("static regex")
});

/// Redact credentials and bound the length of text headed for a log.
pub fn sanitize_for_log(message: &str) -> String {
    let sanitized = JSON_SECRET.replace_all(message, r#""${1}":"***""#);
    let mut sanitized = PLAIN_SECRET.replace_all(&sanitized, "${1}=***").into_owned();

    if sanitized.len() > MAX_LOGGED_LEN {
        let mut cut = MAX_LOGGED_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATE_SUFFIX);
    }
    sanitized
}
