//! Binary frame format.
//!
//! Frame layout (16 bytes header + body, all integers big-endian):
//!
//! ```text
//! +--------------+------------+---------+-----------+-------------+
//! | total_length | header_len | version | operation | sequence_id |
//! |   4 bytes    |  2 bytes   | 2 bytes |  4 bytes  |   4 bytes   |
//! +--------------+------------+---------+-----------+-------------+
//! | body (total_length - header_len bytes)                        |
//! +---------------------------------------------------------------+
//! ```
//!
//! A WebSocket binary message is zero or more frames back to back.

use crate::error::ProtocolError;
use crate::message::{Operation, ProtocolVersion};
use crate::{OUTBOUND_SEQUENCE, OUTBOUND_VERSION};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed frame header in bytes (4+2+2+4+4 = 16).
pub const HEADER_SIZE: usize = 16;

/// Size of the popularity value carried by heartbeat replies.
const POPULARITY_SIZE: usize = 4;

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub total_length: u32,
    pub header_length: u16,
    pub version: u16,
    pub operation: u32,
    pub sequence_id: u32,
}

impl FrameHeader {
    /// Returns the known operation, if any.
    pub fn op(&self) -> Option<Operation> {
        Operation::from_u32(self.operation)
    }

    pub fn protocol_version(&self) -> Result<ProtocolVersion, ProtocolError> {
        ProtocolVersion::from_u16(self.version)
    }
}

/// A frame read from a buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl Frame {
    /// Encodes a raw body into a complete outbound frame.
    pub fn encode(body: &[u8], operation: Operation) -> Result<Bytes, ProtocolError> {
        let max = u32::MAX as usize - HEADER_SIZE;
        if body.len() > max {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max,
            });
        }

        let total = HEADER_SIZE + body.len();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(total as u32);
        buf.put_u16(HEADER_SIZE as u16);
        buf.put_u16(OUTBOUND_VERSION);
        buf.put_u32(operation.as_u32());
        buf.put_u32(OUTBOUND_SEQUENCE);
        buf.put_slice(body);
        Ok(buf.freeze())
    }

    /// Encodes a JSON-serializable value into a complete outbound frame.
    pub fn encode_json<T: serde::Serialize>(
        value: &T,
        operation: Operation,
    ) -> Result<Bytes, ProtocolError> {
        let body = serde_json::to_vec(value)?;
        Self::encode(&body, operation)
    }

    /// Popularity carried by a heartbeat reply.
    pub fn popularity(&self) -> Option<u32> {
        if self.header.op() != Some(Operation::HeartbeatReply) {
            return None;
        }
        let bytes: [u8; POPULARITY_SIZE] = self.body.get(..POPULARITY_SIZE)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }
}

/// Reads the 16-byte header starting at `offset`.
pub fn decode_header(buf: &[u8], offset: usize) -> Result<FrameHeader, ProtocolError> {
    let remaining = buf.len().saturating_sub(offset);
    let h = buf
        .get(offset..offset + HEADER_SIZE)
        .ok_or(ProtocolError::MalformedHeader { offset, remaining })?;

    let header = FrameHeader {
        total_length: u32::from_be_bytes([h[0], h[1], h[2], h[3]]),
        header_length: u16::from_be_bytes([h[4], h[5]]),
        version: u16::from_be_bytes([h[6], h[7]]),
        operation: u32::from_be_bytes([h[8], h[9], h[10], h[11]]),
        sequence_id: u32::from_be_bytes([h[12], h[13], h[14], h[15]]),
    };

    if (header.header_length as usize) < HEADER_SIZE
        || header.total_length < header.header_length as u32
    {
        return Err(ProtocolError::MalformedHeader { offset, remaining });
    }
    Ok(header)
}

/// Reads every complete frame of one buffer, in order.
///
/// Compressed bodies are returned as-is; see [`crate::unpack`] for the
/// flattening variant.
pub fn decode_message(buf: Bytes) -> Vec<Frame> {
    FrameReader::new(buf).collect()
}

/// Iterator over the frames of one buffer.
///
/// Iteration ends at the end of the buffer or at the first header that
/// cannot be read; truncation is not an error.
#[derive(Debug)]
pub struct FrameReader {
    buf: Bytes,
    offset: usize,
    done: bool,
}

impl FrameReader {
    pub fn new(buf: Bytes) -> Self {
        Self {
            buf,
            offset: 0,
            done: false,
        }
    }
}

impl Iterator for FrameReader {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.done || self.offset >= self.buf.len() {
            return None;
        }

        let header = match decode_header(&self.buf, self.offset) {
            Ok(header) => header,
            Err(_) => {
                self.done = true;
                return None;
            }
        };
        let body_start = self.offset + header.header_length as usize;

        // The declared length of a heartbeat reply excludes whatever the
        // client appended to its own heartbeat; only the popularity counts.
        if header.op() == Some(Operation::HeartbeatReply) {
            self.done = true;
            let body_end = body_start + POPULARITY_SIZE;
            if body_end > self.buf.len() {
                return None;
            }
            return Some(Frame {
                header,
                body: self.buf.slice(body_start..body_end),
            });
        }

        let end = self.offset + header.total_length as usize;
        if end > self.buf.len() {
            self.done = true;
            return None;
        }

        self.offset = end;
        Some(Frame {
            header,
            body: self.buf.slice(body_start..end),
        })
    }
}
