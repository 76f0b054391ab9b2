//! Encoder and decoder for frames and messages.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{Request, Response};
use crate::MAX_FRAME_SIZE;
use bytes::{Bytes, BytesMut};

/// Encodes requests and responses into wire frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a request into a complete frame.
    pub fn encode_request(request: &Request) -> Result<BytesMut, ProtocolError> {
        let mut payload = BytesMut::new();
        request.encode_payload(&mut payload);
        Frame::new(request.code(), payload.freeze()).encode()
    }

    /// Encodes a response into a complete frame.
    pub fn encode_response(response: &Response) -> Result<BytesMut, ProtocolError> {
        let mut payload = BytesMut::new();
        response.encode_payload(&mut payload);
        Frame::new(response.code(), payload.freeze()).encode()
    }
}

/// Decodes a request from an already split frame.
pub fn decode_request(frame: Frame) -> Result<Request, ProtocolError> {
    Request::decode(frame.code, frame.payload)
}

/// Decodes a response from an already split frame.
pub fn decode_response(frame: Frame) -> Result<Response, ProtocolError> {
    Response::decode(frame.code, frame.payload)
}

/// Buffers stream bytes and yields complete frames.
pub struct Decoder {
    buffer: BytesMut,
    max_frame_size: u32,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Creates a decoder that rejects frames longer than `max`.
    pub fn with_max_frame_size(max: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame_size: max,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode_with_limit(&mut self.buffer, self.max_frame_size)
    }

    /// Attempts to decode the next request from the buffer.
    pub fn decode_request(&mut self) -> Result<Option<Request>, ProtocolError> {
        self.decode_frame()?.map(decode_request).transpose()
    }

    /// Attempts to decode the next response from the buffer.
    pub fn decode_response(&mut self) -> Result<Option<Response>, ProtocolError> {
        self.decode_frame()?.map(decode_response).transpose()
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
