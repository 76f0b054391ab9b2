//! Tag/varint field encoding for message payloads.
//!
//! Every field starts with a varint key `(field_number << 3) | wire_type`.
//! Integers are base-128 varints (signed values zig-zag encoded), byte
//! strings and nested messages are length-delimited.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Longest legal varint encoding of a 64-bit value.
pub const MAX_VARINT_LEN: usize = 10;

/// Wire type carried in the low three bits of a field key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    Fixed32,
}

impl WireType {
    pub fn bits(self) -> u64 {
        match self {
            WireType::Varint => 0,
            WireType::Fixed64 => 1,
            WireType::LengthDelimited => 2,
            WireType::Fixed32 => 5,
        }
    }

    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        match bits {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(ProtocolError::InvalidWireType(other)),
        }
    }
}

pub fn put_varint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn get_varint(buf: &mut impl Buf) -> Result<u64, ProtocolError> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(ProtocolError::TruncatedVarint);
        }
        let byte = buf.get_u8();
        // The tenth byte may only contribute the top bit of a u64.
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(ProtocolError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ProtocolError::VarintOverflow)
}

pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

pub fn put_key(buf: &mut BytesMut, field: u32, wire_type: WireType) {
    put_varint(buf, (u64::from(field) << 3) | wire_type.bits());
}

pub fn put_uint_field(buf: &mut BytesMut, field: u32, value: u64) {
    put_key(buf, field, WireType::Varint);
    put_varint(buf, value);
}

pub fn put_sint_field(buf: &mut BytesMut, field: u32, value: i64) {
    put_uint_field(buf, field, zigzag_encode(value));
}

pub fn put_bool_field(buf: &mut BytesMut, field: u32, value: bool) {
    put_uint_field(buf, field, u64::from(value));
}

pub fn put_bytes_field(buf: &mut BytesMut, field: u32, value: &[u8]) {
    put_key(buf, field, WireType::LengthDelimited);
    put_varint(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Writes a nested message built by `encode` as a length-delimited field.
///
/// The field is emitted even when the nested message is empty, so presence
/// survives a round trip.
pub fn put_message_field<F>(buf: &mut BytesMut, field: u32, encode: F)
where
    F: FnOnce(&mut BytesMut),
{
    let mut nested = BytesMut::new();
    encode(&mut nested);
    put_bytes_field(buf, field, &nested);
}

/// A single decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Varint(u64),
    Fixed64(u64),
    Bytes(Bytes),
    Fixed32(u32),
}

impl FieldValue {
    pub fn wire_type(&self) -> WireType {
        match self {
            FieldValue::Varint(_) => WireType::Varint,
            FieldValue::Fixed64(_) => WireType::Fixed64,
            FieldValue::Bytes(_) => WireType::LengthDelimited,
            FieldValue::Fixed32(_) => WireType::Fixed32,
        }
    }

    fn mismatch(&self, field: &'static str, expected: WireType) -> ProtocolError {
        ProtocolError::WireTypeMismatch {
            field,
            expected,
            actual: self.wire_type(),
        }
    }

    pub fn into_u64(self, field: &'static str) -> Result<u64, ProtocolError> {
        match self {
            FieldValue::Varint(v) => Ok(v),
            other => Err(other.mismatch(field, WireType::Varint)),
        }
    }

    pub fn into_u32(self, field: &'static str) -> Result<u32, ProtocolError> {
        let value = self.into_u64(field)?;
        u32::try_from(value).map_err(|_| ProtocolError::ValueOutOfRange { field, value })
    }

    pub fn into_sint64(self, field: &'static str) -> Result<i64, ProtocolError> {
        self.into_u64(field).map(zigzag_decode)
    }

    pub fn into_bool(self, field: &'static str) -> Result<bool, ProtocolError> {
        match self.into_u64(field)? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(ProtocolError::ValueOutOfRange { field, value }),
        }
    }

    pub fn into_bytes(self, field: &'static str) -> Result<Bytes, ProtocolError> {
        match self {
            FieldValue::Bytes(b) => Ok(b),
            other => Err(other.mismatch(field, WireType::LengthDelimited)),
        }
    }

    pub fn into_string(self, field: &'static str) -> Result<String, ProtocolError> {
        let bytes = self.into_bytes(field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
    }
}

/// Iterates over the fields of one encoded message.
pub struct FieldReader {
    buf: Bytes,
}

impl FieldReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Returns the next `(field_number, value)` pair, or `None` at the end
    /// of the message.
    pub fn next_field(&mut self) -> Result<Option<(u32, FieldValue)>, ProtocolError> {
        if !self.buf.has_remaining() {
            return Ok(None);
        }

        let key = get_varint(&mut self.buf)?;
        let number = key >> 3;
        if number == 0 || number > u64::from(u32::MAX >> 3) {
            return Err(ProtocolError::InvalidFieldNumber(number));
        }
        let wire_type = WireType::from_bits((key & 0x7) as u8)?;

        let value = match wire_type {
            WireType::Varint => FieldValue::Varint(get_varint(&mut self.buf)?),
            WireType::Fixed64 => {
                self.ensure(8)?;
                FieldValue::Fixed64(self.buf.get_u64_le())
            }
            WireType::LengthDelimited => {
                let len = get_varint(&mut self.buf)?;
                let len = usize::try_from(len).map_err(|_| ProtocolError::TruncatedField {
                    needed: usize::MAX,
                    remaining: self.buf.remaining(),
                })?;
                self.ensure(len)?;
                FieldValue::Bytes(self.buf.split_to(len))
            }
            WireType::Fixed32 => {
                self.ensure(4)?;
                FieldValue::Fixed32(self.buf.get_u32_le())
            }
        };

        Ok(Some((number as u32, value)))
    }

    fn ensure(&self, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::TruncatedField {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }
}
