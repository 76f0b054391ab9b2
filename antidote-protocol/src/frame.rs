//! Length-prefixed frame format.
//!
//! Frame layout (4 bytes length prefix + 1 byte message code + payload):
//!
//! ```text
//! +-------------+--------+--------------------------+
//! | length      | code   | payload                  |
//! | 4 bytes BE  | 1 byte | length - 1 bytes         |
//! +-------------+--------+--------------------------+
//! ```
//!
//! The length counts the code byte plus the payload, so a legal frame
//! always declares at least 1 byte.

use crate::error::ProtocolError;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCode {
    ErrorResp,
    OperationResp,
    ReadObjects,
    UpdateObjects,
    StartTransaction,
    AbortTransaction,
    CommitTransaction,
    StaticUpdateObjects,
    StaticReadObjects,
    StartTransactionResp,
    ReadObjectsResp,
    CommitResp,
    StaticReadObjectsResp,
}

impl MessageCode {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageCode::ErrorResp => 0,
            MessageCode::OperationResp => 111,
            MessageCode::ReadObjects => 116,
            MessageCode::UpdateObjects => 118,
            MessageCode::StartTransaction => 119,
            MessageCode::AbortTransaction => 120,
            MessageCode::CommitTransaction => 121,
            MessageCode::StaticUpdateObjects => 122,
            MessageCode::StaticReadObjects => 123,
            MessageCode::StartTransactionResp => 124,
            MessageCode::ReadObjectsResp => 126,
            MessageCode::CommitResp => 127,
            MessageCode::StaticReadObjectsResp => 128,
        }
    }

    /// Returns whether messages with this code travel client to server.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageCode::ReadObjects
                | MessageCode::UpdateObjects
                | MessageCode::StartTransaction
                | MessageCode::AbortTransaction
                | MessageCode::CommitTransaction
                | MessageCode::StaticUpdateObjects
                | MessageCode::StaticReadObjects
        )
    }
}

impl TryFrom<u8> for MessageCode {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        let code = match code {
            0 => MessageCode::ErrorResp,
            111 => MessageCode::OperationResp,
            116 => MessageCode::ReadObjects,
            118 => MessageCode::UpdateObjects,
            119 => MessageCode::StartTransaction,
            120 => MessageCode::AbortTransaction,
            121 => MessageCode::CommitTransaction,
            122 => MessageCode::StaticUpdateObjects,
            123 => MessageCode::StaticReadObjects,
            124 => MessageCode::StartTransactionResp,
            126 => MessageCode::ReadObjectsResp,
            127 => MessageCode::CommitResp,
            128 => MessageCode::StaticReadObjectsResp,
            other => return Err(ProtocolError::UnknownMessageCode(other)),
        };
        Ok(code)
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u8())
    }
}

/// A parsed frame: message code plus undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: MessageCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(code: MessageCode, payload: Bytes) -> Self {
        Self { code, payload }
    }

    /// Value of the length prefix for this frame.
    pub fn declared_len(&self) -> usize {
        1 + self.payload.len()
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let len = self.declared_len();
        if len > MAX_FRAME_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: u32::try_from(len).unwrap_or(u32::MAX),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + len);
        buf.put_u32(len as u32);
        buf.put_u8(self.code.as_u8());
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Validates a length prefix against the frame size limit.
    pub fn check_len(declared: u32, max: u32) -> Result<usize, ProtocolError> {
        if declared == 0 {
            return Err(ProtocolError::EmptyFrame);
        }
        if declared > max {
            return Err(ProtocolError::FrameTooLarge {
                size: declared,
                max,
            });
        }
        Ok(declared as usize)
    }

    /// Builds a frame from the bytes that follow the length prefix.
    pub fn from_body(mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        let code = MessageCode::try_from(body.get_u8())?;
        Ok(Self::new(code, body))
    }

    /// Parses exactly one complete frame.
    ///
    /// Fails with `LengthMismatch` if the length prefix disagrees with the
    /// number of bytes actually present.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < LENGTH_PREFIX_SIZE {
            return Err(ProtocolError::LengthMismatch {
                declared: LENGTH_PREFIX_SIZE,
                actual: bytes.len(),
            });
        }
        let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let len = Self::check_len(declared, MAX_FRAME_SIZE)?;
        let body = &bytes[LENGTH_PREFIX_SIZE..];
        if body.len() != len {
            return Err(ProtocolError::LengthMismatch {
                declared: len,
                actual: body.len(),
            });
        }
        Self::from_body(Bytes::copy_from_slice(body))
    }

    /// Decodes a frame from a stream buffer.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        Self::decode_with_limit(buf, MAX_FRAME_SIZE)
    }

    /// Like [`Frame::decode`], rejecting frames longer than `max`.
    pub fn decode_with_limit(buf: &mut BytesMut, max: u32) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let len = Self::check_len(declared, max)?;
        if buf.len() < LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let body = buf.split_to(len).freeze();
        Self::from_body(body).map(Some)
    }
}
