//! TOML configuration for the push listener
//!
//! Every section is optional; a missing file section falls back to the
//! defaults the production endpoint expects.

use crate::protocol::profile::ClientProfile;
use crate::transport::mqtt::ReconnectConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Search order used when no `--config` path is given
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["fbns.toml", "config/fbns.toml"];

pub const DEFAULT_BROKER_URL: &str = "mqtts://mqtt-mini.facebook.com:443";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FbnsConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub client: ClientProfile,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Broker endpoint and connection timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// `mqtts://host:port` for TLS, `mqtt://host:port` for plain TCP
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Outbound idle time before a PINGREQ is sent
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    /// Start every connection with a clean session
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

fn default_broker_url() -> String {
    DEFAULT_BROKER_URL.to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive() -> u16 {
    900
}

fn default_clean_session() -> bool {
    true
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            connect_timeout_secs: default_connect_timeout(),
            keepalive_secs: default_keepalive(),
            clean_session: default_clean_session(),
        }
    }
}

/// Where credentials and the delivery token are persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Minimum hours between registrations of the same token
    #[serde(default = "default_token_refresh_hours")]
    pub token_refresh_hours: u64,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("fbns_session.json")
}

fn default_token_refresh_hours() -> u64 {
    24
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            token_refresh_hours: default_token_refresh_hours(),
        }
    }
}

/// Reconnection policy, mapped onto [`ReconnectConfig`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Unlimited when absent
    pub max_attempts: Option<u32>,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    #[serde(default = "default_sustained_delay_ms")]
    pub sustained_delay_ms: u64,
}

fn default_backoff_ms() -> Vec<u64> {
    vec![25, 50, 100, 250]
}

fn default_sustained_delay_ms() -> u64 {
    250
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_ms: default_backoff_ms(),
            sustained_delay_ms: default_sustained_delay_ms(),
        }
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        ReconnectConfig {
            max_attempts: section.max_attempts,
            backoff_pattern: section.backoff_ms.clone(),
            sustained_delay: section.sustained_delay_ms,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL '{url}': {reason}")]
    InvalidBrokerUrl { url: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FbnsConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: FbnsConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the explicit path, else the first default path that
    /// exists, else built-in defaults
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            return Ok((Self::load_from_file(path)?, Some(path.to_path_buf())));
        }
        for candidate in DEFAULT_CONFIG_PATHS {
            let path = Path::new(candidate);
            if path.is_file() {
                return Ok((Self::load_from_file(path)?, Some(path.to_path_buf())));
            }
        }
        Ok((Self::default(), None))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_broker_url(&self.server.broker_url)?;

        if self.server.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "server.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.server.keepalive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "server.keepalive_secs must be greater than 0".to_string(),
            ));
        }
        if self.session.state_file.as_os_str().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "session.state_file must not be empty".to_string(),
            ));
        }
        if self.client.package_name.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "client.package_name must not be empty".to_string(),
            ));
        }

        crate::transport::mqtt::HealthMonitor::validate_connection_config(&self.reconnect_config())
            .map_err(|reason| ConfigError::InvalidConfig(format!("reconnect: {reason}")))
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig::from(&self.reconnect)
    }
}

fn validate_broker_url(broker_url: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBrokerUrl {
        url: broker_url.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(broker_url).map_err(|e| invalid(&e.to_string()))?;
    match url.scheme() {
        "mqtt" | "mqtts" | "tcp" | "ssl" => {}
        other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(())
}
