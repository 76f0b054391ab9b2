//! # antidote-protocol
//!
//! Wire protocol for the Antidote CRDT database client.
//!
//! This crate provides:
//! - Length-prefixed framing with a one-byte message code
//! - Tag/varint payload encoding for every request and response
//! - The CRDT object model (bound objects, operations, read values)
//! - Error codes and protocol constants

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod model;
pub mod wire;

pub use codec::{decode_request, decode_response, Decoder, Encoder};
pub use error::{ErrorCode, ModelError, ProtocolError};
pub use frame::{Frame, MessageCode, LENGTH_PREFIX_SIZE};
pub use message::{CommitTime, ErrorResponse, Request, Response, TransactionDescriptor};
pub use model::{BoundObject, CrdtType, MapKey, MapOp, Operation, Update, Value};

/// Default port of the server's protocol buffer interface.
pub const DEFAULT_PORT: u16 = 8087;

/// Maximum frame size (16 MiB), counting the code byte and payload.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum number of maps nested inside one operation or read value.
pub const MAX_NESTING_DEPTH: usize = 64;
