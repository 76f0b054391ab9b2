//! Protocol error types and server error codes.

use crate::frame::MessageCode;
use crate::model::CrdtType;
use crate::wire::WireType;
use std::fmt;
use thiserror::Error;

/// Errors raised while framing, encoding or decoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("empty frame: length prefix must cover the message code")]
    EmptyFrame,

    #[error("frame length mismatch: header declares {declared} bytes, buffer holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown message code: {0}")]
    UnknownMessageCode(u8),

    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: MessageCode,
        actual: MessageCode,
    },

    #[error("truncated varint")]
    TruncatedVarint,

    #[error("varint exceeds 64 bits")]
    VarintOverflow,

    #[error("truncated field: need {needed} bytes, {remaining} remaining")]
    TruncatedField { needed: usize, remaining: usize },

    #[error("invalid wire type: {0}")]
    InvalidWireType(u8),

    #[error("invalid field number: {0}")]
    InvalidFieldNumber(u64),

    #[error("field {field} has wire type {actual:?}, expected {expected:?}")]
    WireTypeMismatch {
        field: &'static str,
        expected: WireType,
        actual: WireType,
    },

    #[error("value out of range for {field}: {value}")]
    ValueOutOfRange { field: &'static str, value: u64 },

    #[error("invalid {name} value: {value}")]
    InvalidEnum { name: &'static str, value: u64 },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("conflicting fields in {0}: exactly one must be set")]
    ConflictingFields(&'static str),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("read returned {returned} values for {requested} objects")]
    ValueCountMismatch { requested: usize, returned: usize },

    #[error("read returned a value that is not a {expected} for {object}")]
    ValueTypeMismatch { object: String, expected: CrdtType },

    #[error("maps nested deeper than {max} levels")]
    NestingTooDeep { max: usize },

    #[error("invalid object model: {0}")]
    Model(#[from] ModelError),
}

/// Errors raised when building bound objects and updates.
///
/// These never involve I/O: a mismatched operation is rejected before any
/// bytes are produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("object key must not be empty")]
    EmptyKey,

    #[error("object bucket must not be empty")]
    EmptyBucket,

    #[error("{operation} operation cannot be applied to a {target} object")]
    TypeMismatch {
        operation: &'static str,
        target: CrdtType,
    },

    #[error("map updates nested deeper than {max} levels")]
    NestingTooDeep { max: usize },
}

/// Error codes carried by failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unknown,
    Timeout,
    NoPermissions,
    Aborted,
    /// A code this client does not recognise, preserved as sent.
    Other(u32),
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0 => ErrorCode::Unknown,
            1 => ErrorCode::Timeout,
            2 => ErrorCode::NoPermissions,
            3 => ErrorCode::Aborted,
            other => ErrorCode::Other(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            ErrorCode::Unknown => 0,
            ErrorCode::Timeout => 1,
            ErrorCode::NoPermissions => 2,
            ErrorCode::Aborted => 3,
            ErrorCode::Other(code) => *code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Unknown => write!(f, "UNKNOWN"),
            ErrorCode::Timeout => write!(f, "TIMEOUT"),
            ErrorCode::NoPermissions => write!(f, "NO_PERMISSIONS"),
            ErrorCode::Aborted => write!(f, "ABORTED"),
            ErrorCode::Other(code) => write!(f, "CODE_{}", code),
        }
    }
}
