//! MQTT 3.1.1 packet framing on top of rumqttc's `mqttbytes`
//!
//! PUBLISH, the QoS acknowledgements, PINGREQ and DISCONNECT are standard
//! packets and go through rumqttc's v4 types. CONNECT and CONNACK are the
//! two packets the MQTToT variant changes: CONNECT is assembled by
//! [`crate::protocol::connect`] with the remaining-length helpers below, and
//! the raw CONNACK body is handed to [`crate::protocol::connack`] untouched.

use bytes::{Bytes, BytesMut};
use rumqttc::mqttbytes::v4::{Disconnect, PingReq, PubAck, PubComp, PubRec, PubRel};
use rumqttc::mqttbytes::{self, check};
use thiserror::Error;

pub use rumqttc::mqttbytes::v4::Publish;
pub use rumqttc::mqttbytes::{FixedHeader, PacketType, QoS};

/// Largest value a four-byte variable byte integer can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Framing errors
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("Remaining length exceeds four bytes")]
    InvalidRemainingLength,
    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Malformed {packet}: {reason}")]
    Malformed {
        packet: &'static str,
        reason: String,
    },
    #[error("Packet error: {0}")]
    Packet(#[from] mqttbytes::Error),
}

/// One decoded inbound control packet
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// CONNACK body after the fixed header, left for the protocol layer
    ConnAck { body: Bytes },
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    PingResp,
    Disconnect,
    /// Valid packet type a client never expects from the server
    Unexpected(PacketType),
}

/// Append a variable byte integer
pub fn encode_remaining_length(mut value: usize, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if value > MAX_REMAINING_LENGTH {
        return Err(CodecError::FrameTooLarge {
            size: value,
            max: MAX_REMAINING_LENGTH,
        });
    }
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

/// Decode a variable byte integer.
///
/// Returns `Ok(Some((value, bytes_consumed)))`, or `Ok(None)` when the buffer
/// ends before the final length byte.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(CodecError::InvalidRemainingLength);
        }
        value += ((byte & 0x7F) as usize) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(CodecError::InvalidRemainingLength);
    }
    Ok(None)
}

/// Split one complete frame (fixed header included) off the front of `buf`
pub fn split_frame(
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Option<(FixedHeader, Bytes)>, CodecError> {
    let checked = check(buf.iter(), max_size);
    match checked {
        Ok(header) => Ok(Some((header, buf.split_to(header.frame_length()).freeze()))),
        Err(mqttbytes::Error::InsufficientBytes(_)) => Ok(None),
        Err(mqttbytes::Error::PayloadSizeLimitExceeded(size)) => Err(CodecError::FrameTooLarge {
            size,
            max: max_size,
        }),
        Err(mqttbytes::Error::MalformedRemainingLength) => Err(CodecError::InvalidRemainingLength),
        Err(e) => Err(e.into()),
    }
}

/// Decode the next buffered packet, if a complete one is available
pub fn read_packet(buf: &mut BytesMut, max_size: usize) -> Result<Option<Inbound>, CodecError> {
    let Some((header, frame)) = split_frame(buf, max_size)? else {
        return Ok(None);
    };

    let packet = match header.packet_type()? {
        PacketType::ConnAck => Inbound::ConnAck {
            body: frame_body(&frame)?,
        },
        PacketType::Publish => Inbound::Publish(Publish::read(header, frame)?),
        PacketType::PubAck => Inbound::PubAck(PubAck::read(header, frame)?),
        PacketType::PubRec => Inbound::PubRec(PubRec::read(header, frame)?),
        PacketType::PubRel => Inbound::PubRel(PubRel::read(header, frame)?),
        PacketType::PubComp => Inbound::PubComp(PubComp::read(header, frame)?),
        PacketType::PingResp => Inbound::PingResp,
        PacketType::Disconnect => Inbound::Disconnect,
        other => Inbound::Unexpected(other),
    };
    Ok(Some(packet))
}

/// Bytes after the fixed header of a complete frame
fn frame_body(frame: &Bytes) -> Result<Bytes, CodecError> {
    match decode_remaining_length(&frame[1..])? {
        Some((_, len_bytes)) => Ok(frame.slice(1 + len_bytes..)),
        None => Err(CodecError::InvalidRemainingLength),
    }
}

fn write_packet(
    write: impl FnOnce(&mut BytesMut) -> Result<usize, mqttbytes::Error>,
) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    write(&mut buf)?;
    Ok(buf.freeze())
}

/// Build an outbound PUBLISH; `packet_id` is ignored at QoS 0
pub fn encode_publish(
    topic: &str,
    payload: &[u8],
    qos: QoS,
    packet_id: u16,
) -> Result<Bytes, CodecError> {
    let mut publish = Publish::from_bytes(topic, qos, Bytes::copy_from_slice(payload));
    if qos != QoS::AtMostOnce {
        publish.pkid = packet_id;
    }
    write_packet(|buf| publish.write(buf))
}

pub fn encode_puback(packet_id: u16) -> Result<Bytes, CodecError> {
    write_packet(|buf| PubAck::new(packet_id).write(buf))
}

pub fn encode_pubrec(packet_id: u16) -> Result<Bytes, CodecError> {
    write_packet(|buf| PubRec::new(packet_id).write(buf))
}

pub fn encode_pubcomp(packet_id: u16) -> Result<Bytes, CodecError> {
    write_packet(|buf| PubComp::new(packet_id).write(buf))
}

pub fn encode_pingreq() -> Result<Bytes, CodecError> {
    write_packet(|buf| PingReq.write(buf))
}

pub fn encode_disconnect() -> Result<Bytes, CodecError> {
    write_packet(|buf| Disconnect.write(buf))
}
