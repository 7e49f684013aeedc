//! Session identity material handed out by the server in CONNACK

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of trailing characters of the device id used as MQTT client id
pub const CLIENT_ID_LEN: usize = 16;

/// Credentials for one connection attempt.
///
/// Serializes with the server's wire keys (`ck`, `cs`, `ds`, `di`) so a
/// persisted copy can be fed straight back into [`AuthContext::from_json`].
/// The client id is derived and never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireAuth", into = "WireAuth")]
pub struct AuthContext {
    user_id: i64,
    password: String,
    device_secret: String,
    device_id: String,
    client_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireAuth {
    #[serde(default, deserialize_with = "de_user_id")]
    ck: i64,
    #[serde(default)]
    cs: String,
    #[serde(default)]
    ds: String,
    #[serde(default)]
    di: String,
}

impl From<WireAuth> for AuthContext {
    fn from(wire: WireAuth) -> Self {
        AuthContext::new(wire.ck, wire.cs, wire.ds, wire.di)
    }
}

impl From<AuthContext> for WireAuth {
    fn from(auth: AuthContext) -> Self {
        WireAuth {
            ck: auth.user_id,
            cs: auth.password,
            ds: auth.device_secret,
            di: auth.device_id,
        }
    }
}

/// `ck` arrives as a JSON number on some servers and a numeric string on others
fn de_user_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        Text(String),
        Null(()),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Text(s) if s.trim().is_empty() => Ok(0),
        NumberOrString::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("user id '{s}' is not an integer"))),
        NumberOrString::Null(()) => Ok(0),
    }
}

impl AuthContext {
    pub fn new(
        user_id: i64,
        password: impl Into<String>,
        device_secret: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        let device_id = device_id.into();
        let client_id = if device_id.is_empty() {
            derive_client_id(&Uuid::new_v4().to_string())
        } else {
            derive_client_id(&device_id)
        };

        Self {
            user_id,
            password: password.into(),
            device_secret: device_secret.into(),
            device_id,
            client_id,
        }
    }

    /// Parse the JSON blob carried in CONNACK (or a persisted copy of it)
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn device_secret(&self) -> &str {
        &self.device_secret
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl Default for AuthContext {
    fn default() -> Self {
        AuthContext::new(0, "", "", "")
    }
}

fn derive_client_id(source: &str) -> String {
    let count = source.chars().count();
    source
        .chars()
        .skip(count.saturating_sub(CLIENT_ID_LEN))
        .collect()
}
