//! CONNECT construction for the MQTToT variant
//!
//! The frame keeps the MQTT 3.1 fixed and variable header layout but replaces
//! the payload (client id, will, username, password strings) with a single
//! zlib-compressed compact-Thrift struct carrying all auth material.

use super::auth::AuthContext;
use super::compression;
use super::profile::ClientProfile;
use super::thrift::CompactWriter;
use super::topics::TopicId;
use crate::transport::mqtt::codec::{self, CodecError};
use chrono::{DateTime, Datelike, Duration, Local, NaiveTime, TimeZone};
use thiserror::Error;
use tracing::debug;

pub const CONNECT_COMMAND: u8 = 0x10;
pub const PROTOCOL_NAME: &str = "MQTToT";
pub const PROTOCOL_LEVEL: u8 = 3;
/// Keepalive the server mandates, whatever the caller asks for
pub const KEEPALIVE_SECS: u16 = 900;

pub const FLAG_CLEAN_SESSION: u8 = 0x02;
pub const FLAG_PASSWORD: u8 = 0x40;
pub const FLAG_USERNAME: u8 = 0x80;

/// Field ids of the connect schema
mod field {
    pub const CLIENT_IDENTIFIER: i16 = 1;
    pub const CLIENT_INFO: i16 = 4;
    pub const PASSWORD: i16 = 5;

    pub const USER_ID: i16 = 1;
    pub const USER_AGENT: i16 = 2;
    pub const CLIENT_CAPABILITIES: i16 = 3;
    pub const ENDPOINT_CAPABILITIES: i16 = 4;
    pub const PUBLISH_FORMAT: i16 = 5;
    pub const NO_AUTOMATIC_FOREGROUND: i16 = 6;
    pub const MAKE_USER_AVAILABLE_IN_FOREGROUND: i16 = 7;
    pub const DEVICE_ID: i16 = 8;
    pub const IS_INITIALLY_FOREGROUND: i16 = 9;
    pub const NETWORK_TYPE: i16 = 10;
    pub const NETWORK_SUBTYPE: i16 = 11;
    pub const CLIENT_MQTT_SESSION_ID: i16 = 12;
    pub const SUBSCRIBE_TOPICS: i16 = 14;
    pub const CLIENT_TYPE: i16 = 15;
    pub const APP_ID: i16 = 16;
    pub const DEVICE_SECRET: i16 = 20;
    pub const CLIENT_STACK: i16 = 21;
}

/// Errors producing an outbound CONNECT
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Failed to compress auth payload")]
    Compression(#[source] std::io::Error),
    #[error("Frame encoding failed: {0}")]
    Frame(#[from] CodecError),
}

/// Session flags supplied by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub clean_session: bool,
    /// Requested keepalive; the frame always carries [`KEEPALIVE_SECS`]
    pub keepalive_secs: u16,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            clean_session: true,
            keepalive_secs: KEEPALIVE_SECS,
        }
    }
}

/// Per-connection client description embedded in the auth payload
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSessionInfo {
    pub user_id: i64,
    pub user_agent: String,
    pub client_capabilities: i64,
    pub endpoint_capabilities: i64,
    pub publish_format: i32,
    pub no_automatic_foreground: bool,
    pub make_user_available_in_foreground: bool,
    pub device_id: String,
    pub is_initially_foreground: bool,
    pub network_type: i32,
    pub network_subtype: i32,
    pub client_mqtt_session_id: i64,
    pub subscribe_topics: Vec<i32>,
    pub client_type: String,
    pub app_id: i64,
    pub device_secret: String,
    pub client_stack: i8,
}

impl ClientSessionInfo {
    pub fn new(auth: &AuthContext, profile: &ClientProfile, session_id: i64) -> Self {
        Self {
            user_id: auth.user_id(),
            user_agent: profile.user_agent.clone(),
            client_capabilities: profile.client_capabilities,
            endpoint_capabilities: profile.endpoint_capabilities,
            publish_format: profile.publish_format,
            no_automatic_foreground: profile.no_automatic_foreground,
            make_user_available_in_foreground: profile.make_user_available_in_foreground,
            device_id: auth.device_id().to_string(),
            is_initially_foreground: profile.is_initially_foreground,
            network_type: profile.network_type,
            network_subtype: profile.network_subtype,
            client_mqtt_session_id: session_id,
            subscribe_topics: TopicId::SUBSCRIBED.iter().map(|t| t.id()).collect(),
            client_type: profile.client_type.clone(),
            app_id: profile.app_id,
            device_secret: auth.device_secret().to_string(),
            client_stack: profile.client_stack,
        }
    }

    fn write(&self, writer: &mut CompactWriter) {
        writer.write_i64_field(field::USER_ID, self.user_id);
        writer.write_string_field(field::USER_AGENT, &self.user_agent);
        writer.write_i64_field(field::CLIENT_CAPABILITIES, self.client_capabilities);
        writer.write_i64_field(field::ENDPOINT_CAPABILITIES, self.endpoint_capabilities);
        writer.write_i32_field(field::PUBLISH_FORMAT, self.publish_format);
        writer.write_bool_field(field::NO_AUTOMATIC_FOREGROUND, self.no_automatic_foreground);
        writer.write_bool_field(
            field::MAKE_USER_AVAILABLE_IN_FOREGROUND,
            self.make_user_available_in_foreground,
        );
        writer.write_string_field(field::DEVICE_ID, &self.device_id);
        writer.write_bool_field(field::IS_INITIALLY_FOREGROUND, self.is_initially_foreground);
        writer.write_i32_field(field::NETWORK_TYPE, self.network_type);
        writer.write_i32_field(field::NETWORK_SUBTYPE, self.network_subtype);
        writer.write_i64_field(field::CLIENT_MQTT_SESSION_ID, self.client_mqtt_session_id);
        writer.write_i32_list_field(field::SUBSCRIBE_TOPICS, &self.subscribe_topics);
        writer.write_string_field(field::CLIENT_TYPE, &self.client_type);
        writer.write_i64_field(field::APP_ID, self.app_id);
        writer.write_string_field(field::DEVICE_SECRET, &self.device_secret);
        writer.write_byte_field(field::CLIENT_STACK, self.client_stack);
    }
}

/// Serialize the connect struct (uncompressed)
pub fn serialize_connect_struct(auth: &AuthContext, info: &ClientSessionInfo) -> Vec<u8> {
    let mut writer = CompactWriter::new();
    writer.write_string_field(field::CLIENT_IDENTIFIER, auth.client_id());
    writer.write_struct_field_begin(field::CLIENT_INFO);
    info.write(&mut writer);
    writer.write_struct_end();
    writer.write_string_field(field::PASSWORD, auth.password());
    writer.write_struct_end();
    writer.into_bytes()
}

/// Build the compressed auth blob carried as the CONNECT payload
pub fn encode_auth_payload(
    auth: &AuthContext,
    profile: &ClientProfile,
    session_id: i64,
) -> Result<Vec<u8>, EncodeError> {
    let info = ClientSessionInfo::new(auth, profile, session_id);
    let raw = serialize_connect_struct(auth, &info);
    compression::compress(&raw).map_err(EncodeError::Compression)
}

/// Assemble the complete CONNECT frame around an already-compressed payload
pub fn build_connect_frame(payload: &[u8], options: &ConnectOptions) -> Result<Vec<u8>, EncodeError> {
    if options.keepalive_secs != KEEPALIVE_SECS {
        debug!(
            requested = options.keepalive_secs,
            pinned = KEEPALIVE_SECS,
            "Ignoring requested keepalive"
        );
    }

    let mut flags = FLAG_USERNAME | FLAG_PASSWORD;
    if options.clean_session {
        flags |= FLAG_CLEAN_SESSION;
    }

    let name = PROTOCOL_NAME.as_bytes();
    let remaining = 2 + name.len() + 1 + 1 + 2 + payload.len();

    let mut frame = Vec::with_capacity(remaining + 5);
    frame.push(CONNECT_COMMAND);
    codec::encode_remaining_length(remaining, &mut frame)?;
    frame.extend_from_slice(&(name.len() as u16).to_be_bytes());
    frame.extend_from_slice(name);
    frame.push(PROTOCOL_LEVEL);
    frame.push(flags);
    frame.extend_from_slice(&KEEPALIVE_SECS.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Header fields of a CONNECT frame, as read back from the wire
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectHeader {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub flags: u8,
    pub keepalive_secs: u16,
}

impl ConnectHeader {
    /// Parse a complete CONNECT frame, returning its header and payload
    pub fn parse(frame: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let malformed = |reason: &str| CodecError::Malformed {
            packet: "CONNECT",
            reason: reason.to_string(),
        };

        if frame.first() != Some(&CONNECT_COMMAND) {
            return Err(malformed("not a CONNECT command byte"));
        }
        let (remaining, len_bytes) =
            codec::decode_remaining_length(&frame[1..])?.ok_or_else(|| malformed("truncated length"))?;
        let body = &frame[1 + len_bytes..];
        if body.len() != remaining {
            return Err(malformed("remaining length does not match frame size"));
        }
        if body.len() < 2 {
            return Err(malformed("missing protocol name"));
        }
        let name_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let fixed = 2 + name_len + 4;
        if body.len() < fixed {
            return Err(malformed("variable header truncated"));
        }
        let protocol_name = std::str::from_utf8(&body[2..2 + name_len])
            .map_err(|_| malformed("protocol name is not UTF-8"))?
            .to_string();
        let rest = &body[2 + name_len..];

        Ok((
            Self {
                protocol_name,
                protocol_level: rest[0],
                flags: rest[1],
                keepalive_secs: u16::from_be_bytes([rest[2], rest[3]]),
            },
            &body[fixed..],
        ))
    }
}

/// Milliseconds elapsed since the most recent Monday 00:00:00 in `now`'s zone.
///
/// Used as a coarse per-week session nonce.
pub fn session_id_at<Tz: TimeZone>(now: &DateTime<Tz>) -> i64 {
    let days_since_monday = i64::from(now.weekday().num_days_from_monday());
    let monday = now.date_naive() - Duration::days(days_since_monday);
    let midnight = monday.and_time(NaiveTime::MIN);

    let start = match now.timezone().from_local_datetime(&midnight).earliest() {
        Some(start) => start,
        // midnight skipped by a DST jump: measure from the naive instant
        None => return (now.naive_local() - midnight).num_milliseconds(),
    };
    now.clone().signed_duration_since(start).num_milliseconds()
}

pub fn current_session_id() -> i64 {
    session_id_at(&Local::now())
}
