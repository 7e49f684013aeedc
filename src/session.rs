//! Persisted session: credentials and delivery token
//!
//! The state file is plain JSON. Writes go to a sibling temp file which is
//! then renamed over the original, so a crash never leaves a torn file.

use crate::protocol::auth::AuthContext;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Session file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_received_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_received_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn record_auth(&mut self, auth: AuthContext, now: DateTime<Utc>) {
        self.auth = Some(auth);
        self.auth_received_at = Some(now);
    }

    pub fn record_token(&mut self, token: impl Into<String>, now: DateTime<Utc>) {
        self.token = Some(token.into());
        self.token_received_at = Some(now);
    }

    /// Credentials for the next CONNECT; empty on first run
    pub fn auth_or_default(&self) -> AuthContext {
        self.auth.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file yields the default (empty) state
    pub fn load(&self) -> Result<SessionState, SessionError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No session file yet");
                Ok(SessionState::default())
            }
            Err(source) => Err(self.io_error(source)),
        }
    }

    pub fn save(&self, state: &SessionState) -> Result<(), SessionError> {
        let json = serde_json::to_vec_pretty(state)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), "Session saved");
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> SessionError {
        SessionError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// When a freshly issued token is worth reporting again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    pub refresh_window: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            refresh_window: Duration::hours(24),
        }
    }
}

impl TokenPolicy {
    pub fn new(refresh_window: Duration) -> Self {
        Self { refresh_window }
    }

    /// False only when the same token was recorded within the window
    pub fn should_register(&self, state: &SessionState, token: &str, now: DateTime<Utc>) -> bool {
        match (&state.token, state.token_received_at) {
            (Some(known), Some(at)) if known == token => now - at >= self.refresh_window,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_missing_file_loads_default() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("absent.json"));
        assert_eq!(store.load().unwrap(), SessionState::default());
    }

    #[test]
    fn test_save_then_load() {
        // Arrange
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("nested/session.json"));
        let mut state = SessionState::default();
        state.record_auth(AuthContext::new(42, "pw", "secret", "device-0123456789abcdef"), at(1));
        state.record_token("TOKEN", at(2));

        // Act
        store.save(&state).unwrap();
        let loaded = store.load().unwrap();

        // Assert
        assert_eq!(loaded, state);
        assert_eq!(loaded.auth_or_default().client_id(), "0123456789abcdef");
        assert!(!dir.path().join("nested/session.json.tmp").exists());
    }

    #[test]
    fn test_persisted_auth_uses_wire_keys() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("s.json"));
        let mut state = SessionState::default();
        state.record_auth(AuthContext::new(7, "pw", "ds", "di"), at(0));
        store.save(&state).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["auth"]["ck"], 7);
        assert_eq!(raw["auth"]["cs"], "pw");
        assert!(raw.get("token").is_none());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            SessionStore::new(path).load(),
            Err(SessionError::Json(_))
        ));
    }

    #[test]
    fn test_empty_state_uses_default_auth() {
        let auth = SessionState::default().auth_or_default();
        assert_eq!(auth.user_id(), 0);
        assert_eq!(auth.password(), "");
    }

    #[test]
    fn test_token_policy_window() {
        let policy = TokenPolicy::default();
        let mut state = SessionState::default();
        assert!(policy.should_register(&state, "T", at(0)));

        state.record_token("T", at(0));
        assert!(!policy.should_register(&state, "T", at(23)));
        assert!(policy.should_register(&state, "OTHER", at(23)));
        assert!(policy.should_register(
            &state,
            "T",
            at(0) + Duration::hours(24)
        ));
    }
}
