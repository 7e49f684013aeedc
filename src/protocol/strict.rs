//! Allow-list JSON object reader
//!
//! Every push record is decoded through [`StrictObject`]: known keys are
//! taken out one by one and anything left over is a hard error, so a server
//! side schema change is noticed instead of silently dropped.

use serde_json::{Map, Value};
use thiserror::Error;

/// Strict decoding failures
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{record} is not valid JSON: {source}")]
    InvalidJson {
        record: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{record} must be a JSON object")]
    NotAnObject { record: &'static str },

    #[error("{record} unexpected data: {}", fields.join(", "))]
    UnexpectedFields {
        record: &'static str,
        fields: Vec<String>,
    },

    #[error("{record}.{field}: {reason}")]
    InvalidField {
        record: &'static str,
        field: &'static str,
        reason: String,
    },
}

/// A JSON object whose keys must all be consumed from an allow-list
#[derive(Debug)]
pub struct StrictObject {
    record: &'static str,
    fields: Map<String, Value>,
}

impl StrictObject {
    /// Accepts an object, or a string holding a JSON object.
    ///
    /// Keys outside `allowed` are rejected up front.
    pub fn new(record: &'static str, value: Value, allowed: &[&str]) -> Result<Self, DecodeError> {
        let fields = match value {
            Value::Object(map) => map,
            Value::String(text) => match serde_json::from_str(&text) {
                Ok(Value::Object(map)) => map,
                Ok(_) => return Err(DecodeError::NotAnObject { record }),
                Err(source) => return Err(DecodeError::InvalidJson { record, source }),
            },
            _ => return Err(DecodeError::NotAnObject { record }),
        };

        let mut unexpected: Vec<String> = fields
            .keys()
            .filter(|key| !allowed.contains(&key.as_str()))
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            unexpected.sort();
            return Err(DecodeError::UnexpectedFields {
                record,
                fields: unexpected,
            });
        }

        Ok(Self { record, fields })
    }

    pub fn from_slice(record: &'static str, data: &[u8], allowed: &[&str]) -> Result<Self, DecodeError> {
        let value = serde_json::from_slice(data)
            .map_err(|source| DecodeError::InvalidJson { record, source })?;
        Self::new(record, value, allowed)
    }

    /// Raw value; `null` counts as absent
    pub fn take_value(&mut self, key: &str) -> Option<Value> {
        match self.fields.remove(key) {
            Some(Value::Null) | None => None,
            Some(value) => Some(value),
        }
    }

    /// Raw value for nested records; empty or zero-like scalars count as absent
    pub fn take_present_value(&mut self, key: &str) -> Option<Value> {
        self.take_value(key).filter(|value| !is_blank(value))
    }

    /// Scalar rendered as text. Numbers and booleans are accepted since the
    /// server is inconsistent about quoting ids.
    pub fn take_text(&mut self, key: &'static str) -> Result<Option<String>, DecodeError> {
        match self.take_value(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(self.invalid(key, format!("expected a scalar, got {}", kind(&other)))),
        }
    }

    /// Integer count, either a JSON number or a numeric string
    pub fn take_count(&mut self, key: &'static str) -> Result<Option<i64>, DecodeError> {
        match self.take_value(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| self.invalid(key, format!("{n} is not an integer"))),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(key, format!("'{s}' is not an integer"))),
            Some(other) => Err(self.invalid(key, format!("expected an integer, got {}", kind(&other)))),
        }
    }

    /// Flag given as a JSON bool, 0/1, or "true"/"false"/"0"/"1"
    pub fn take_flag(&mut self, key: &'static str) -> Result<Option<bool>, DecodeError> {
        match self.take_value(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(Value::Number(n)) => match n.as_i64() {
                Some(0) => Ok(Some(false)),
                Some(1) => Ok(Some(true)),
                _ => Err(self.invalid(key, format!("{n} is not a flag"))),
            },
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                _ => Err(self.invalid(key, format!("'{s}' is not a flag"))),
            },
            Some(other) => Err(self.invalid(key, format!("expected a flag, got {}", kind(&other)))),
        }
    }

    /// Drop a key whose value is not kept
    pub fn discard(&mut self, key: &str) {
        self.fields.remove(key);
    }

    /// Fails if any key was not taken
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let mut fields: Vec<String> = self.fields.into_iter().map(|(key, _)| key).collect();
        fields.sort();
        Err(DecodeError::UnexpectedFields {
            record: self.record,
            fields,
        })
    }

    pub fn record(&self) -> &'static str {
        self.record
    }

    fn invalid(&self, field: &'static str, reason: String) -> DecodeError {
        DecodeError::InvalidField {
            record: self.record,
            field,
            reason,
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
