//! Encoder and decoder for LDAP messages on a byte stream.

use crate::ber::{read_header, Packet};
use crate::control::ControlRegistry;
use crate::error::ProtocolError;
use crate::message::{encode_message, Request, Response};
use crate::MAX_MESSAGE_SIZE;
use bytes::{Buf, Bytes, BytesMut};

/// Encodes requests into wire bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes a request envelope. Fails before producing any bytes if the
    /// request itself cannot be encoded.
    pub fn encode_request(
        message_id: i32,
        request: &dyn Request,
    ) -> Result<BytesMut, ProtocolError> {
        Ok(encode_message(message_id, request)?.encode())
    }

    pub fn encode_packet(packet: &Packet) -> BytesMut {
        packet.encode()
    }
}

/// Splits a byte stream into complete BER messages.
pub struct Decoder {
    buffer: BytesMut,
    max_message_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next message from the buffer.
    ///
    /// Returns `Ok(None)` until a whole message has been buffered.
    pub fn decode_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        let Some(header) = read_header(&self.buffer)? else {
            return Ok(None);
        };
        let total = header.total_len().ok_or(ProtocolError::InvalidLength)?;
        if total > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: total,
                max: self.max_message_size,
            });
        }
        if self.buffer.len() < total {
            return Ok(None);
        }

        let message = self.buffer.split_to(total).freeze();
        let (packet, _) = Packet::decode_bytes(&message)?;
        tracing::trace!(bytes = total, remaining = self.buffer.remaining(), "decoded message");
        Ok(Some(packet))
    }

    /// Attempts to decode the next response from the buffer.
    pub fn decode_response(
        &mut self,
        registry: &ControlRegistry,
    ) -> Result<Option<Response>, ProtocolError> {
        match self.decode_packet()? {
            Some(packet) => Ok(Some(Response::decode(&packet, registry)?)),
            None => Ok(None),
        }
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
