//! Write side of the Thrift compact protocol
//!
//! The CONNECT auth blob is a compact-encoded struct: field headers carry a
//! delta-encoded field id and a type nibble, integers are zigzag varints,
//! strings are varint-length-prefixed and booleans live in the header itself.
//! Only the types used by the connect schema are supported.

const STOP: u8 = 0x00;

/// Compact protocol type nibbles
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactType {
    BooleanTrue = 1,
    BooleanFalse = 2,
    Byte = 3,
    I16 = 4,
    I32 = 5,
    I64 = 6,
    Double = 7,
    Binary = 8,
    List = 9,
    Set = 10,
    Map = 11,
    Struct = 12,
}

/// Streaming compact-protocol writer over an owned buffer
#[derive(Debug, Default)]
pub struct CompactWriter {
    buf: Vec<u8>,
    last_field_id: i16,
    parents: Vec<i16>,
}

impl CompactWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        debug_assert!(self.parents.is_empty(), "unterminated nested struct");
        self.buf
    }

    /// Terminate the current struct with a STOP marker and return to the parent
    pub fn write_struct_end(&mut self) {
        self.buf.push(STOP);
        self.last_field_id = self.parents.pop().unwrap_or(0);
    }

    /// Open a nested struct as field `id`; close it with [`Self::write_struct_end`]
    pub fn write_struct_field_begin(&mut self, id: i16) {
        self.write_field_header(CompactType::Struct, id);
        self.parents.push(self.last_field_id);
        self.last_field_id = 0;
    }

    pub fn write_bool_field(&mut self, id: i16, value: bool) {
        let kind = if value {
            CompactType::BooleanTrue
        } else {
            CompactType::BooleanFalse
        };
        self.write_field_header(kind, id);
    }

    pub fn write_byte_field(&mut self, id: i16, value: i8) {
        self.write_field_header(CompactType::Byte, id);
        self.buf.push(value as u8);
    }

    pub fn write_i32_field(&mut self, id: i16, value: i32) {
        self.write_field_header(CompactType::I32, id);
        self.write_varint(zigzag_i32(value));
    }

    pub fn write_i64_field(&mut self, id: i16, value: i64) {
        self.write_field_header(CompactType::I64, id);
        self.write_varint(zigzag_i64(value));
    }

    pub fn write_string_field(&mut self, id: i16, value: &str) {
        self.write_field_header(CompactType::Binary, id);
        self.write_varint(value.len() as u64);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_i32_list_field(&mut self, id: i16, values: &[i32]) {
        self.write_field_header(CompactType::List, id);
        let elem = CompactType::I32 as u8;
        if values.len() < 15 {
            self.buf.push(((values.len() as u8) << 4) | elem);
        } else {
            self.buf.push(0xF0 | elem);
            self.write_varint(values.len() as u64);
        }
        for value in values {
            self.write_varint(zigzag_i32(*value));
        }
    }

    fn write_field_header(&mut self, kind: CompactType, id: i16) {
        let delta = id.wrapping_sub(self.last_field_id);
        if delta > 0 && delta <= 15 {
            self.buf.push(((delta as u8) << 4) | kind as u8);
        } else {
            self.buf.push(kind as u8);
            self.write_varint(zigzag_i32(i32::from(id)));
        }
        self.last_field_id = id;
    }

    fn write_varint(&mut self, mut value: u64) {
        loop {
            if value & !0x7F == 0 {
                self.buf.push(value as u8);
                return;
            }
            self.buf.push(((value & 0x7F) as u8) | 0x80);
            value >>= 7;
        }
    }
}

fn zigzag_i32(value: i32) -> u64 {
    u64::from(((value << 1) ^ (value >> 31)) as u32)
}

fn zigzag_i64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zigzag() {
        assert_eq!(zigzag_i32(0), 0);
        assert_eq!(zigzag_i32(-1), 1);
        assert_eq!(zigzag_i32(1), 2);
        assert_eq!(zigzag_i32(i32::MIN), u64::from(u32::MAX));
        assert_eq!(zigzag_i64(-2), 3);
        assert_eq!(zigzag_i64(i64::MAX), u64::MAX - 1);
    }

    #[test]
    fn test_short_form_field_headers() {
        let mut writer = CompactWriter::new();
        writer.write_i64_field(1, 1);
        writer.write_string_field(2, "ab");
        writer.write_bool_field(3, true);
        writer.write_bool_field(4, false);
        writer.write_struct_end();

        assert_eq!(
            writer.into_bytes(),
            vec![0x16, 0x02, 0x18, 0x02, b'a', b'b', 0x11, 0x12, 0x00]
        );
    }

    #[test]
    fn test_long_form_field_header_when_delta_exceeds_nibble() {
        let mut writer = CompactWriter::new();
        writer.write_string_field(1, "");
        writer.write_byte_field(21, 3);
        writer.write_struct_end();

        // id 21 after id 1: type byte then zigzag(21) = 42
        assert_eq!(writer.into_bytes(), vec![0x18, 0x00, 0x03, 0x2A, 0x03, 0x00]);
    }

    #[test]
    fn test_i32_list() {
        let mut writer = CompactWriter::new();
        writer.write_i32_list_field(14, &[76, 80]);
        writer.write_struct_end();

        // delta 14 from 0 fits a nibble; 76 -> 152, 80 -> 160 as varints
        assert_eq!(
            writer.into_bytes(),
            vec![0xE9, 0x25, 0x98, 0x01, 0xA0, 0x01, 0x00]
        );
    }

    #[test]
    fn test_nested_struct_restores_parent_field_id() {
        let mut writer = CompactWriter::new();
        writer.write_string_field(1, "c");
        writer.write_struct_field_begin(4);
        writer.write_i32_field(1, 1);
        writer.write_struct_end();
        writer.write_string_field(5, "p");
        writer.write_struct_end();

        assert_eq!(
            writer.into_bytes(),
            vec![0x18, 0x01, b'c', 0x3C, 0x15, 0x02, 0x00, 0x18, 0x01, b'p', 0x00]
        );
    }

    #[test]
    fn test_large_varint() {
        let mut writer = CompactWriter::new();
        writer.write_i64_field(1, 567310203415052);
        let bytes = writer.into_bytes();
        assert_eq!(bytes[0], 0x16);
        // every byte but the last carries a continuation bit
        let tail = &bytes[1..];
        assert!(tail[..tail.len() - 1].iter().all(|b| b & 0x80 != 0));
        assert_eq!(tail[tail.len() - 1] & 0x80, 0);
    }
}
