//! Request and response messages and their payload schema.

use crate::error::{ErrorCode, ProtocolError};
use crate::frame::MessageCode;
use crate::MAX_NESTING_DEPTH;
use crate::model::{BoundObject, CrdtType, MapKey, MapOp, Operation, Update, Value};
use crate::wire::{
    put_bool_field, put_bytes_field, put_message_field, put_sint_field, put_uint_field,
    FieldReader,
};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Opaque server-issued transaction token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TransactionDescriptor(Bytes);

impl TransactionDescriptor {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl fmt::Debug for TransactionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionDescriptor({})", hex::encode(&self.0))
    }
}

/// Opaque commit timestamp returned by a successful commit.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CommitTime(Bytes);

impl CommitTime {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl fmt::Debug for CommitTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitTime({})", hex::encode(&self.0))
    }
}

/// Client to server messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    StartTransaction {
        timestamp: Option<CommitTime>,
    },
    ReadObjects {
        objects: Vec<BoundObject>,
        descriptor: TransactionDescriptor,
    },
    UpdateObjects {
        updates: Vec<Update>,
        descriptor: TransactionDescriptor,
    },
    CommitTransaction {
        descriptor: TransactionDescriptor,
    },
    AbortTransaction {
        descriptor: TransactionDescriptor,
    },
    StaticReadObjects {
        timestamp: Option<CommitTime>,
        objects: Vec<BoundObject>,
    },
    StaticUpdateObjects {
        timestamp: Option<CommitTime>,
        updates: Vec<Update>,
    },
}

/// Explicit error message sent in place of a normal response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

/// Server to client messages.
///
/// Responses that carry a `success` flag decode to `Err(code)` when the
/// server reports failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Error(ErrorResponse),
    StartTransaction(Result<TransactionDescriptor, ErrorCode>),
    Operation(Result<(), ErrorCode>),
    ReadObjects(Result<Vec<Value>, ErrorCode>),
    Commit(Result<CommitTime, ErrorCode>),
    StaticReadObjects {
        objects: Result<Vec<Value>, ErrorCode>,
        commit: Result<CommitTime, ErrorCode>,
    },
}

impl Request {
    pub fn code(&self) -> MessageCode {
        match self {
            Request::StartTransaction { .. } => MessageCode::StartTransaction,
            Request::ReadObjects { .. } => MessageCode::ReadObjects,
            Request::UpdateObjects { .. } => MessageCode::UpdateObjects,
            Request::CommitTransaction { .. } => MessageCode::CommitTransaction,
            Request::AbortTransaction { .. } => MessageCode::AbortTransaction,
            Request::StaticReadObjects { .. } => MessageCode::StaticReadObjects,
            Request::StaticUpdateObjects { .. } => MessageCode::StaticUpdateObjects,
        }
    }

    /// Code of the response the server answers this request with, apart
    /// from an explicit `ErrorResp`.
    pub fn response_code(&self) -> MessageCode {
        match self {
            Request::StartTransaction { .. } => MessageCode::StartTransactionResp,
            Request::ReadObjects { .. } => MessageCode::ReadObjectsResp,
            Request::UpdateObjects { .. } | Request::AbortTransaction { .. } => {
                MessageCode::OperationResp
            }
            Request::CommitTransaction { .. } | Request::StaticUpdateObjects { .. } => {
                MessageCode::CommitResp
            }
            Request::StaticReadObjects { .. } => MessageCode::StaticReadObjectsResp,
        }
    }

    /// Encodes the payload (without frame header).
    pub fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Request::StartTransaction { timestamp } => encode_start(buf, timestamp.as_ref()),
            Request::ReadObjects {
                objects,
                descriptor,
            } => {
                for object in objects {
                    put_message_field(buf, 1, |b| encode_bound_object(b, object));
                }
                put_bytes_field(buf, 2, descriptor.as_bytes());
            }
            Request::UpdateObjects {
                updates,
                descriptor,
            } => {
                for update in updates {
                    put_message_field(buf, 1, |b| encode_update_op(b, update));
                }
                put_bytes_field(buf, 2, descriptor.as_bytes());
            }
            Request::CommitTransaction { descriptor } | Request::AbortTransaction { descriptor } => {
                put_bytes_field(buf, 1, descriptor.as_bytes());
            }
            Request::StaticReadObjects { timestamp, objects } => {
                put_message_field(buf, 1, |b| encode_start(b, timestamp.as_ref()));
                for object in objects {
                    put_message_field(buf, 2, |b| encode_bound_object(b, object));
                }
            }
            Request::StaticUpdateObjects { timestamp, updates } => {
                put_message_field(buf, 1, |b| encode_start(b, timestamp.as_ref()));
                for update in updates {
                    put_message_field(buf, 2, |b| encode_update_op(b, update));
                }
            }
        }
    }

    /// Decodes a request payload for the given message code.
    pub fn decode(code: MessageCode, payload: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = FieldReader::new(payload);
        let request = match code {
            MessageCode::StartTransaction => Request::StartTransaction {
                timestamp: decode_start(reader)?,
            },
            MessageCode::ReadObjects => {
                let mut objects = Vec::new();
                let mut descriptor = None;
                while let Some((field, value)) = reader.next_field()? {
                    match field {
                        1 => objects.push(decode_bound_object(value.into_bytes("boundobjects")?)?),
                        2 => descriptor = Some(value.into_bytes("transaction_descriptor")?),
                        _ => {}
                    }
                }
                Request::ReadObjects {
                    objects,
                    descriptor: require_descriptor(descriptor)?,
                }
            }
            MessageCode::UpdateObjects => {
                let mut updates = Vec::new();
                let mut descriptor = None;
                while let Some((field, value)) = reader.next_field()? {
                    match field {
                        1 => updates.push(decode_update_op(value.into_bytes("updates")?)?),
                        2 => descriptor = Some(value.into_bytes("transaction_descriptor")?),
                        _ => {}
                    }
                }
                Request::UpdateObjects {
                    updates,
                    descriptor: require_descriptor(descriptor)?,
                }
            }
            MessageCode::CommitTransaction | MessageCode::AbortTransaction => {
                let mut descriptor = None;
                while let Some((field, value)) = reader.next_field()? {
                    if field == 1 {
                        descriptor = Some(value.into_bytes("transaction_descriptor")?);
                    }
                }
                let descriptor = require_descriptor(descriptor)?;
                if code == MessageCode::CommitTransaction {
                    Request::CommitTransaction { descriptor }
                } else {
                    Request::AbortTransaction { descriptor }
                }
            }
            MessageCode::StaticReadObjects => {
                let mut transaction = None;
                let mut objects = Vec::new();
                while let Some((field, value)) = reader.next_field()? {
                    match field {
                        1 => {
                            let nested = FieldReader::new(value.into_bytes("transaction")?);
                            transaction = Some(decode_start(nested)?);
                        }
                        2 => objects.push(decode_bound_object(value.into_bytes("objects")?)?),
                        _ => {}
                    }
                }
                Request::StaticReadObjects {
                    timestamp: transaction.ok_or(ProtocolError::MissingField("transaction"))?,
                    objects,
                }
            }
            MessageCode::StaticUpdateObjects => {
                let mut transaction = None;
                let mut updates = Vec::new();
                while let Some((field, value)) = reader.next_field()? {
                    match field {
                        1 => {
                            let nested = FieldReader::new(value.into_bytes("transaction")?);
                            transaction = Some(decode_start(nested)?);
                        }
                        2 => updates.push(decode_update_op(value.into_bytes("updates")?)?),
                        _ => {}
                    }
                }
                Request::StaticUpdateObjects {
                    timestamp: transaction.ok_or(ProtocolError::MissingField("transaction"))?,
                    updates,
                }
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: MessageCode::StartTransaction,
                    actual: other,
                })
            }
        };
        Ok(request)
    }
}

impl Response {
    pub fn code(&self) -> MessageCode {
        match self {
            Response::Error(_) => MessageCode::ErrorResp,
            Response::StartTransaction(_) => MessageCode::StartTransactionResp,
            Response::Operation(_) => MessageCode::OperationResp,
            Response::ReadObjects(_) => MessageCode::ReadObjectsResp,
            Response::Commit(_) => MessageCode::CommitResp,
            Response::StaticReadObjects { .. } => MessageCode::StaticReadObjectsResp,
        }
    }

    /// Encodes the payload (without frame header).
    pub fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Response::Error(err) => {
                put_bytes_field(buf, 1, err.message.as_bytes());
                put_uint_field(buf, 2, u64::from(err.code.as_u32()));
            }
            Response::StartTransaction(result) => match result {
                Ok(descriptor) => {
                    put_bool_field(buf, 1, true);
                    put_bytes_field(buf, 2, descriptor.as_bytes());
                }
                Err(code) => encode_failure(buf, 3, *code),
            },
            Response::Operation(result) => match result {
                Ok(()) => put_bool_field(buf, 1, true),
                Err(code) => encode_failure(buf, 2, *code),
            },
            Response::ReadObjects(result) => encode_read_objects(buf, result),
            Response::Commit(result) => encode_commit(buf, result),
            Response::StaticReadObjects { objects, commit } => {
                put_message_field(buf, 1, |b| encode_read_objects(b, objects));
                put_message_field(buf, 2, |b| encode_commit(b, commit));
            }
        }
    }

    /// Decodes a response payload for the given message code.
    pub fn decode(code: MessageCode, payload: Bytes) -> Result<Self, ProtocolError> {
        let reader = FieldReader::new(payload);
        let response = match code {
            MessageCode::ErrorResp => Response::Error(decode_error(reader)?),
            MessageCode::StartTransactionResp => {
                let status = decode_status(reader, 2, 3)?;
                Response::StartTransaction(status.into_result(|body| {
                    body.map(TransactionDescriptor::new)
                        .ok_or(ProtocolError::MissingField("transaction_descriptor"))
                })?)
            }
            MessageCode::OperationResp => {
                let status = decode_status(reader, 0, 2)?;
                Response::Operation(status.into_result(|_| Ok(()))?)
            }
            MessageCode::ReadObjectsResp => Response::ReadObjects(decode_read_objects(reader)?),
            MessageCode::CommitResp => Response::Commit(decode_commit(reader)?),
            MessageCode::StaticReadObjectsResp => {
                let mut reader = reader;
                let mut objects = None;
                let mut commit = None;
                while let Some((field, value)) = reader.next_field()? {
                    match field {
                        1 => {
                            let nested = FieldReader::new(value.into_bytes("objects")?);
                            objects = Some(decode_read_objects(nested)?);
                        }
                        2 => {
                            let nested = FieldReader::new(value.into_bytes("committime")?);
                            commit = Some(decode_commit(nested)?);
                        }
                        _ => {}
                    }
                }
                Response::StaticReadObjects {
                    objects: objects.ok_or(ProtocolError::MissingField("objects"))?,
                    commit: commit.ok_or(ProtocolError::MissingField("committime"))?,
                }
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: MessageCode::OperationResp,
                    actual: other,
                })
            }
        };
        Ok(response)
    }
}

// ============================================================================
// Shared sub-message encoding
// ============================================================================

fn encode_start(buf: &mut BytesMut, timestamp: Option<&CommitTime>) {
    if let Some(ts) = timestamp {
        put_bytes_field(buf, 1, ts.as_bytes());
    }
    // Empty transaction properties: server defaults apply.
    put_message_field(buf, 2, |_| {});
}

fn decode_start(mut reader: FieldReader) -> Result<Option<CommitTime>, ProtocolError> {
    let mut timestamp = None;
    while let Some((field, value)) = reader.next_field()? {
        if field == 1 {
            timestamp = Some(CommitTime::new(value.into_bytes("timestamp")?));
        }
    }
    Ok(timestamp)
}

fn require_descriptor(bytes: Option<Bytes>) -> Result<TransactionDescriptor, ProtocolError> {
    bytes
        .map(TransactionDescriptor::new)
        .ok_or(ProtocolError::MissingField("transaction_descriptor"))
}

fn encode_bound_object(buf: &mut BytesMut, object: &BoundObject) {
    put_bytes_field(buf, 1, object.key().as_bytes());
    put_uint_field(buf, 2, u64::from(object.crdt_type().code()));
    put_bytes_field(buf, 3, object.bucket().as_bytes());
}

fn decode_bound_object(payload: Bytes) -> Result<BoundObject, ProtocolError> {
    let mut reader = FieldReader::new(payload);
    let (mut key, mut crdt_type, mut bucket) = (None, None, None);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            1 => key = Some(value.into_string("key")?),
            2 => crdt_type = Some(CrdtType::from_code(value.into_u64("type")?)?),
            3 => bucket = Some(value.into_string("bucket")?),
            _ => {}
        }
    }
    Ok(BoundObject::new(
        key.ok_or(ProtocolError::MissingField("key"))?,
        crdt_type.ok_or(ProtocolError::MissingField("type"))?,
        bucket.ok_or(ProtocolError::MissingField("bucket"))?,
    )?)
}

fn encode_map_key(buf: &mut BytesMut, key: &MapKey) {
    put_bytes_field(buf, 1, key.key().as_bytes());
    put_uint_field(buf, 2, u64::from(key.crdt_type().code()));
}

fn decode_map_key(payload: Bytes) -> Result<MapKey, ProtocolError> {
    let mut reader = FieldReader::new(payload);
    let (mut key, mut crdt_type) = (None, None);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            1 => key = Some(value.into_string("key")?),
            2 => crdt_type = Some(CrdtType::from_code(value.into_u64("type")?)?),
            _ => {}
        }
    }
    Ok(MapKey::new(
        key.ok_or(ProtocolError::MissingField("key"))?,
        crdt_type.ok_or(ProtocolError::MissingField("type"))?,
    )?)
}

fn encode_update_op(buf: &mut BytesMut, update: &Update) {
    put_message_field(buf, 1, |b| encode_bound_object(b, update.object()));
    put_message_field(buf, 2, |b| encode_operation(b, update.operation()));
}

fn decode_update_op(payload: Bytes) -> Result<Update, ProtocolError> {
    let mut reader = FieldReader::new(payload);
    let (mut object, mut operation) = (None, None);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            1 => object = Some(decode_bound_object(value.into_bytes("boundobject")?)?),
            2 => operation = Some(decode_operation(value.into_bytes("operation")?, 0)?),
            _ => {}
        }
    }
    Ok(Update::new(
        object.ok_or(ProtocolError::MissingField("boundobject"))?,
        operation.ok_or(ProtocolError::MissingField("operation"))?,
    )?)
}

const SET_OP_ADD: u64 = 1;
const SET_OP_REMOVE: u64 = 2;

fn encode_operation(buf: &mut BytesMut, operation: &Operation) {
    match operation {
        Operation::Increment(by) => put_message_field(buf, 1, |b| put_sint_field(b, 1, *by)),
        Operation::SetAdd(elements) => put_message_field(buf, 2, |b| {
            put_uint_field(b, 1, SET_OP_ADD);
            for e in elements {
                put_bytes_field(b, 2, e);
            }
        }),
        Operation::SetRemove(elements) => put_message_field(buf, 2, |b| {
            put_uint_field(b, 1, SET_OP_REMOVE);
            for e in elements {
                put_bytes_field(b, 3, e);
            }
        }),
        Operation::Assign(value) => put_message_field(buf, 3, |b| put_bytes_field(b, 1, value)),
        Operation::Map(map) => put_message_field(buf, 5, |b| {
            for (key, nested) in &map.updates {
                put_message_field(b, 1, |n| {
                    put_message_field(n, 1, |k| encode_map_key(k, key));
                    put_message_field(n, 2, |o| encode_operation(o, nested));
                });
            }
            for key in &map.removed {
                put_message_field(b, 2, |k| encode_map_key(k, key));
            }
        }),
        Operation::Reset => put_message_field(buf, 6, |_| {}),
        Operation::Flag(enabled) => put_message_field(buf, 7, |b| put_bool_field(b, 1, *enabled)),
    }
}

/// Decodes an operation nested `depth` maps deep.
fn decode_operation(payload: Bytes, depth: usize) -> Result<Operation, ProtocolError> {
    check_depth(depth)?;
    let mut reader = FieldReader::new(payload);
    let mut operation = None;
    while let Some((field, value)) = reader.next_field()? {
        let decoded = match field {
            1 => {
                let mut inc = 0;
                let mut nested = FieldReader::new(value.into_bytes("counterop")?);
                while let Some((f, v)) = nested.next_field()? {
                    if f == 1 {
                        inc = v.into_sint64("inc")?;
                    }
                }
                Operation::Increment(inc)
            }
            2 => decode_set_op(value.into_bytes("setop")?)?,
            3 => {
                let mut assigned = None;
                let mut nested = FieldReader::new(value.into_bytes("regop")?);
                while let Some((f, v)) = nested.next_field()? {
                    if f == 1 {
                        assigned = Some(v.into_bytes("value")?);
                    }
                }
                Operation::Assign(assigned.ok_or(ProtocolError::MissingField("value"))?)
            }
            5 => Operation::Map(decode_map_op(value.into_bytes("mapop")?, depth)?),
            6 => {
                value.into_bytes("resetop")?;
                Operation::Reset
            }
            7 => {
                let mut enabled = None;
                let mut nested = FieldReader::new(value.into_bytes("flagop")?);
                while let Some((f, v)) = nested.next_field()? {
                    if f == 1 {
                        enabled = Some(v.into_bool("value")?);
                    }
                }
                Operation::Flag(enabled.ok_or(ProtocolError::MissingField("value"))?)
            }
            _ => continue,
        };
        if operation.replace(decoded).is_some() {
            return Err(ProtocolError::ConflictingFields("operation"));
        }
    }
    operation.ok_or(ProtocolError::MissingField("operation"))
}

fn check_depth(depth: usize) -> Result<(), ProtocolError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ProtocolError::NestingTooDeep {
            max: MAX_NESTING_DEPTH,
        });
    }
    Ok(())
}

fn decode_set_op(payload: Bytes) -> Result<Operation, ProtocolError> {
    let mut reader = FieldReader::new(payload);
    let mut optype = None;
    let (mut adds, mut rems) = (Vec::new(), Vec::new());
    while let Some((field, value)) = reader.next_field()? {
        match field {
            1 => optype = Some(value.into_u64("optype")?),
            2 => adds.push(value.into_bytes("adds")?),
            3 => rems.push(value.into_bytes("rems")?),
            _ => {}
        }
    }
    match optype {
        Some(SET_OP_ADD) => Ok(Operation::SetAdd(adds)),
        Some(SET_OP_REMOVE) => Ok(Operation::SetRemove(rems)),
        Some(other) => Err(ProtocolError::InvalidEnum {
            name: "SetOpType",
            value: other,
        }),
        None => Err(ProtocolError::MissingField("optype")),
    }
}

fn decode_map_op(payload: Bytes, depth: usize) -> Result<MapOp, ProtocolError> {
    let mut reader = FieldReader::new(payload);
    let mut map = MapOp::new();
    while let Some((field, value)) = reader.next_field()? {
        match field {
            1 => {
                let mut nested = FieldReader::new(value.into_bytes("updates")?);
                let (mut key, mut update) = (None, None);
                while let Some((f, v)) = nested.next_field()? {
                    match f {
                        1 => key = Some(decode_map_key(v.into_bytes("key")?)?),
                        2 => {
                            update = Some(decode_operation(v.into_bytes("update")?, depth + 1)?)
                        }
                        _ => {}
                    }
                }
                map.updates.push((
                    key.ok_or(ProtocolError::MissingField("key"))?,
                    update.ok_or(ProtocolError::MissingField("update"))?,
                ));
            }
            2 => map
                .removed
                .push(decode_map_key(value.into_bytes("removedKeys")?)?),
            _ => {}
        }
    }
    Ok(map)
}

// ============================================================================
// Response helpers
// ============================================================================

fn encode_failure(buf: &mut BytesMut, code_field: u32, code: ErrorCode) {
    put_bool_field(buf, 1, false);
    put_uint_field(buf, code_field, u64::from(code.as_u32()));
}

/// `success` flag, optional error code and optional body of a response.
struct Status {
    success: bool,
    error_code: Option<u32>,
    body: Option<Bytes>,
}

impl Status {
    fn into_result<T, F>(self, on_success: F) -> Result<Result<T, ErrorCode>, ProtocolError>
    where
        F: FnOnce(Option<Bytes>) -> Result<T, ProtocolError>,
    {
        if self.success {
            on_success(self.body).map(Ok)
        } else {
            Ok(Err(ErrorCode::from_u32(self.error_code.unwrap_or(0))))
        }
    }
}

/// Reads `success` (field 1), a single bytes body (`body_field`, 0 for
/// none) and the error code (`code_field`).
fn decode_status(
    mut reader: FieldReader,
    body_field: u32,
    code_field: u32,
) -> Result<Status, ProtocolError> {
    let (mut success, mut error_code, mut body) = (None, None, None);
    while let Some((field, value)) = reader.next_field()? {
        if field == 1 {
            success = Some(value.into_bool("success")?);
        } else if field == code_field {
            error_code = Some(value.into_u32("errorcode")?);
        } else if body_field != 0 && field == body_field {
            body = Some(value.into_bytes("body")?);
        }
    }
    Ok(Status {
        success: success.ok_or(ProtocolError::MissingField("success"))?,
        error_code,
        body,
    })
}

fn decode_error(mut reader: FieldReader) -> Result<ErrorResponse, ProtocolError> {
    let (mut message, mut code) = (None, None);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            1 => {
                let bytes = value.into_bytes("errmsg")?;
                message = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            2 => code = Some(value.into_u32("errcode")?),
            _ => {}
        }
    }
    Ok(ErrorResponse {
        code: ErrorCode::from_u32(code.ok_or(ProtocolError::MissingField("errcode"))?),
        message: message.ok_or(ProtocolError::MissingField("errmsg"))?,
    })
}

fn encode_commit(buf: &mut BytesMut, result: &Result<CommitTime, ErrorCode>) {
    match result {
        Ok(time) => {
            put_bool_field(buf, 1, true);
            put_bytes_field(buf, 2, time.as_bytes());
        }
        Err(code) => encode_failure(buf, 3, *code),
    }
}

fn decode_commit(reader: FieldReader) -> Result<Result<CommitTime, ErrorCode>, ProtocolError> {
    decode_status(reader, 2, 3)?.into_result(|body| {
        body.map(CommitTime::new)
            .ok_or(ProtocolError::MissingField("commit_time"))
    })
}

fn encode_read_objects(buf: &mut BytesMut, result: &Result<Vec<Value>, ErrorCode>) {
    match result {
        Ok(values) => {
            put_bool_field(buf, 1, true);
            for value in values {
                put_message_field(buf, 2, |b| encode_value(b, value));
            }
        }
        Err(code) => encode_failure(buf, 3, *code),
    }
}

fn decode_read_objects(
    mut reader: FieldReader,
) -> Result<Result<Vec<Value>, ErrorCode>, ProtocolError> {
    let (mut success, mut error_code) = (None, None);
    let mut values = Vec::new();
    while let Some((field, value)) = reader.next_field()? {
        match field {
            1 => success = Some(value.into_bool("success")?),
            2 => values.push(decode_value(value.into_bytes("objects")?, 0)?),
            3 => error_code = Some(value.into_u32("errorcode")?),
            _ => {}
        }
    }
    match success {
        Some(true) => Ok(Ok(values)),
        Some(false) => Ok(Err(ErrorCode::from_u32(error_code.unwrap_or(0)))),
        None => Err(ProtocolError::MissingField("success")),
    }
}

fn encode_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Counter(n) => put_message_field(buf, 1, |b| put_sint_field(b, 1, *n)),
        Value::Set(elements) => put_message_field(buf, 2, |b| {
            for e in elements {
                put_bytes_field(b, 1, e);
            }
        }),
        Value::Register(r) => put_message_field(buf, 3, |b| put_bytes_field(b, 1, r)),
        Value::MultiValueRegister(values) => put_message_field(buf, 4, |b| {
            for v in values {
                put_bytes_field(b, 1, v);
            }
        }),
        Value::Map(entries) => put_message_field(buf, 6, |b| {
            for (key, nested) in entries {
                put_message_field(b, 1, |e| {
                    put_message_field(e, 1, |k| encode_map_key(k, key));
                    put_message_field(e, 2, |v| encode_value(v, nested));
                });
            }
        }),
        Value::Flag(enabled) => put_message_field(buf, 7, |b| put_bool_field(b, 1, *enabled)),
    }
}

fn decode_value(payload: Bytes, depth: usize) -> Result<Value, ProtocolError> {
    check_depth(depth)?;
    let mut reader = FieldReader::new(payload);
    let mut decoded = None;
    while let Some((field, value)) = reader.next_field()? {
        let v = match field {
            1 => {
                let mut n = None;
                let mut nested = FieldReader::new(value.into_bytes("counter")?);
                while let Some((f, v)) = nested.next_field()? {
                    if f == 1 {
                        n = Some(v.into_sint64("value")?);
                    }
                }
                Value::Counter(n.ok_or(ProtocolError::MissingField("value"))?)
            }
            2 => Value::Set(
                repeated_bytes(value.into_bytes("set")?, "value")?
                    .into_iter()
                    .collect::<BTreeSet<_>>(),
            ),
            3 => {
                let mut values = repeated_bytes(value.into_bytes("reg")?, "value")?;
                Value::Register(values.pop().ok_or(ProtocolError::MissingField("value"))?)
            }
            4 => Value::MultiValueRegister(repeated_bytes(value.into_bytes("mvreg")?, "values")?),
            6 => Value::Map(decode_map_entries(value.into_bytes("map")?, depth)?),
            7 => {
                let mut enabled = None;
                let mut nested = FieldReader::new(value.into_bytes("flag")?);
                while let Some((f, v)) = nested.next_field()? {
                    if f == 1 {
                        enabled = Some(v.into_bool("value")?);
                    }
                }
                Value::Flag(enabled.ok_or(ProtocolError::MissingField("value"))?)
            }
            _ => continue,
        };
        if decoded.replace(v).is_some() {
            return Err(ProtocolError::ConflictingFields("ReadObjectResp"));
        }
    }
    decoded.ok_or(ProtocolError::MissingField("ReadObjectResp"))
}

/// Collects every field-1 byte string of a nested message.
fn repeated_bytes(payload: Bytes, name: &'static str) -> Result<Vec<Bytes>, ProtocolError> {
    let mut reader = FieldReader::new(payload);
    let mut out = Vec::new();
    while let Some((field, value)) = reader.next_field()? {
        if field == 1 {
            out.push(value.into_bytes(name)?);
        }
    }
    Ok(out)
}

fn decode_map_entries(
    payload: Bytes,
    depth: usize,
) -> Result<BTreeMap<MapKey, Value>, ProtocolError> {
    let mut reader = FieldReader::new(payload);
    let mut entries = BTreeMap::new();
    while let Some((field, value)) = reader.next_field()? {
        if field != 1 {
            continue;
        }
        let mut entry = FieldReader::new(value.into_bytes("entries")?);
        let (mut key, mut nested) = (None, None);
        while let Some((f, v)) = entry.next_field()? {
            match f {
                1 => key = Some(decode_map_key(v.into_bytes("key")?)?),
                2 => nested = Some(decode_value(v.into_bytes("value")?, depth + 1)?),
                _ => {}
            }
        }
        entries.insert(
            key.ok_or(ProtocolError::MissingField("key"))?,
            nested.ok_or(ProtocolError::MissingField("value"))?,
        );
    }
    Ok(entries)
}
