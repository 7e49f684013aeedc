//! Push notification payloads delivered on the message topic
//!
//! Decoding is fail-closed: a key that is not listed here aborts the decode
//! of that message (see [`StrictObject`]).

use super::strict::{DecodeError, StrictObject};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

/// Outer push envelope
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PushNotification {
    pub token: Option<String>,
    pub connection_key: Option<String>,
    pub package_name: Option<String>,
    pub collapse_key: Option<String>,
    /// Decoded `fbpushnotif` body
    pub payload: Option<NotificationRecord>,
    pub notification_id: Option<String>,
    pub is_buffered: Option<bool>,
    pub view_id: Option<String>,
    pub num_endpoints: Option<i64>,
}

impl PushNotification {
    const RECORD: &'static str = "PushNotification";
    const FIELDS: &'static [&'static str] = &[
        "token",
        "ck",
        "pn",
        "cp",
        "fbpushnotif",
        "nid",
        "bu",
        "view_id",
        "num_endpoints",
    ];

    pub fn from_json(data: &[u8]) -> Result<Self, DecodeError> {
        let value = serde_json::from_slice(data).map_err(|source| DecodeError::InvalidJson {
            record: Self::RECORD,
            source,
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut obj = StrictObject::new(Self::RECORD, value, Self::FIELDS)?;

        let push = Self {
            token: obj.take_text("token")?,
            connection_key: obj.take_text("ck")?,
            package_name: obj.take_text("pn")?,
            collapse_key: obj.take_text("cp")?,
            payload: obj
                .take_value("fbpushnotif")
                .map(NotificationRecord::from_value)
                .transpose()?,
            notification_id: obj.take_text("nid")?,
            is_buffered: obj.take_flag("bu")?,
            view_id: obj.take_text("view_id")?,
            num_endpoints: obj.take_count("num_endpoints")?,
        };
        obj.finish()?;
        Ok(push)
    }
}

/// Application-level notification carried in `fbpushnotif`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub title: Option<String>,
    pub message: Option<String>,
    pub ticker_text: Option<String>,
    /// Raw deep link as delivered
    pub action: Option<String>,
    pub action_path: Option<String>,
    pub action_params: Option<BTreeMap<String, QueryValue>>,
    pub collapse_key: Option<String>,
    pub optional_image: Option<String>,
    pub optional_avatar_url: Option<String>,
    pub sound: Option<String>,
    pub push_id: Option<String>,
    pub push_category: Option<String>,
    pub intended_recipient_user_id: Option<String>,
    pub source_user_id: Option<String>,
    pub action_override: Option<String>,
    pub badge_count: Option<BadgeCount>,
    pub in_app_actors: Option<Value>,
    pub suppress_badge: Option<Value>,
    pub it: Option<Value>,
    pub si: Option<Value>,
    pub badge: Option<Value>,
}

impl NotificationRecord {
    const RECORD: &'static str = "NotificationRecord";
    const FIELDS: &'static [&'static str] = &[
        "t",
        "m",
        "tt",
        "ig",
        "collapse_key",
        "i",
        "a",
        "sound",
        "pi",
        "PushNotifID",
        "c",
        "u",
        "s",
        "igo",
        "bc",
        "ia",
        "SuppressBadge",
        "it",
        "si",
        "badge",
    ];

    pub fn from_json(data: &[u8]) -> Result<Self, DecodeError> {
        let value = serde_json::from_slice(data).map_err(|source| DecodeError::InvalidJson {
            record: Self::RECORD,
            source,
        })?;
        Self::from_value(value)
    }

    /// Accepts the object itself or the JSON string the server usually sends
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut obj = StrictObject::new(Self::RECORD, value, Self::FIELDS)?;

        let action = obj.take_text("ig")?;
        let link = action.as_deref().map(DeepLink::parse).unwrap_or_default();

        let record = Self {
            title: obj.take_text("t")?,
            message: obj.take_text("m")?,
            ticker_text: obj.take_text("tt")?,
            action,
            action_path: link.path,
            action_params: link.params,
            collapse_key: obj.take_text("collapse_key")?,
            optional_image: obj.take_text("i")?,
            optional_avatar_url: obj.take_text("a")?,
            sound: obj.take_text("sound")?,
            push_id: obj.take_text("pi")?,
            push_category: obj.take_text("c")?,
            intended_recipient_user_id: obj.take_text("u")?,
            source_user_id: obj.take_text("s")?,
            action_override: obj.take_text("igo")?,
            badge_count: obj.take_present_value("bc").map(BadgeCount::from_value).transpose()?,
            in_app_actors: obj.take_value("ia"),
            suppress_badge: obj.take_value("SuppressBadge"),
            it: obj.take_value("it"),
            si: obj.take_value("si"),
            badge: obj.take_value("badge"),
        };
        obj.discard("PushNotifID");
        obj.finish()?;
        Ok(record)
    }
}

/// Unread counters attached to a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BadgeCount {
    pub direct: Option<i64>,
    pub direct_story: Option<i64>,
    pub total_direct: Option<i64>,
    pub activities: Option<i64>,
}

impl BadgeCount {
    const RECORD: &'static str = "BadgeCount";
    const FIELDS: &'static [&'static str] = &["di", "ds", "dt", "ac"];

    pub fn from_json(data: &[u8]) -> Result<Self, DecodeError> {
        let value = serde_json::from_slice(data).map_err(|source| DecodeError::InvalidJson {
            record: Self::RECORD,
            source,
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut obj = StrictObject::new(Self::RECORD, value, Self::FIELDS)?;
        let badge = Self {
            direct: obj.take_count("di")?,
            direct_story: obj.take_count("ds")?,
            total_direct: obj.take_count("dt")?,
            activities: obj.take_count("ac")?,
        };
        obj.finish()?;
        Ok(badge)
    }
}

/// A query parameter value: single occurrence or every repeated value in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    Single(String),
    Multiple(Vec<String>),
}

impl QueryValue {
    /// First value
    pub fn first(&self) -> &str {
        match self {
            QueryValue::Single(value) => value,
            QueryValue::Multiple(values) => values.first().map(String::as_str).unwrap_or(""),
        }
    }
}

/// In-app destination split out of a deep link such as `user?username=alice`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeepLink {
    pub path: Option<String>,
    pub params: Option<BTreeMap<String, QueryValue>>,
}

impl DeepLink {
    pub fn parse(raw: &str) -> Self {
        let (path, query) = match Url::parse(raw) {
            Ok(url) => (url.path().to_string(), url.query().unwrap_or_default().to_string()),
            // relative references like `media?id=1` have no scheme
            Err(_) => split_reference(raw),
        };

        Self {
            path: (!path.is_empty()).then_some(path),
            params: parse_query(&query),
        }
    }
}

fn split_reference(raw: &str) -> (String, String) {
    let without_fragment = raw.split_once('#').map_or(raw, |(head, _)| head);
    match without_fragment.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (without_fragment.to_string(), String::new()),
    }
}

fn parse_query(query: &str) -> Option<BTreeMap<String, QueryValue>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if value.is_empty() {
            continue;
        }
        grouped.entry(key.into_owned()).or_default().push(value.into_owned());
    }

    if grouped.is_empty() {
        return None;
    }

    Some(
        grouped
            .into_iter()
            .map(|(key, mut values)| {
                let value = if values.len() == 1 {
                    QueryValue::Single(values.remove(0))
                } else {
                    QueryValue::Multiple(values)
                };
                (key, value)
            })
            .collect(),
    )
}
