//! Decompression and flattening of nested frame buffers.
//!
//! A compressed business frame carries a whole new concatenation of
//! frames. Instead of recursing, readers for nested buffers are kept on an
//! explicit stack whose depth is capped at [`MAX_NESTING_DEPTH`].

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameReader};
use crate::message::ProtocolVersion;
use bytes::Bytes;
use std::io::Read;

/// Maximum number of buffers on the unpack stack, the outer one included.
pub const MAX_NESTING_DEPTH: usize = 8;

const BROTLI_BUFFER_SIZE: usize = 4096;

impl Frame {
    /// Returns the compression of a business frame's body, if compressed.
    pub fn compression(&self) -> Option<ProtocolVersion> {
        if !self.header.op()?.is_business() {
            return None;
        }
        self.header
            .protocol_version()
            .ok()
            .filter(|v| v.is_compressed())
    }
}

/// Decompresses a body with the algorithm named by `version`.
///
/// CPU bound; async callers should run it on a blocking worker.
pub fn decompress(version: ProtocolVersion, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    match version {
        ProtocolVersion::Plain => Ok(body.to_vec()),
        ProtocolVersion::Deflate => miniz_oxide::inflate::decompress_to_vec_zlib(body)
            .map_err(|e| ProtocolError::Decompress(format!("deflate: {e:?}"))),
        ProtocolVersion::Brotli => {
            let mut out = Vec::with_capacity(body.len() * 4);
            brotli::Decompressor::new(body, BROTLI_BUFFER_SIZE)
                .read_to_end(&mut out)
                .map_err(|e| ProtocolError::Decompress(format!("brotli: {e}")))?;
            Ok(out)
        }
    }
}

/// Stack of frame readers over nested buffers.
///
/// Frames come out in wire order: after a compressed frame is pushed, its
/// inner frames are yielded before the rest of the outer buffer.
#[derive(Debug)]
pub struct Unpacker {
    stack: Vec<FrameReader>,
}

impl Unpacker {
    pub fn new(buf: Bytes) -> Self {
        Self {
            stack: vec![FrameReader::new(buf)],
        }
    }

    /// Pushes a decompressed body to be read before the current buffer
    /// continues.
    pub fn push(&mut self, buf: Bytes) -> Result<(), ProtocolError> {
        if self.stack.len() >= MAX_NESTING_DEPTH {
            return Err(ProtocolError::NestingTooDeep {
                max: MAX_NESTING_DEPTH,
            });
        }
        self.stack.push(FrameReader::new(buf));
        Ok(())
    }

    /// Returns the next frame from the innermost unfinished buffer.
    pub fn next_frame(&mut self) -> Option<Frame> {
        while let Some(reader) = self.stack.last_mut() {
            if let Some(frame) = reader.next() {
                return Some(frame);
            }
            self.stack.pop();
        }
        None
    }
}

/// Reads every frame in `buf`, decompressing nested buffers inline.
///
/// Compressed frames are replaced by their inner frames. A compressed frame
/// that fails to decompress is dropped, as are frames with an unknown
/// protocol version; the rest of the buffer is still read. Only nesting
/// past [`MAX_NESTING_DEPTH`] fails the whole buffer.
pub fn unpack(buf: Bytes) -> Result<Vec<Frame>, ProtocolError> {
    let mut unpacker = Unpacker::new(buf);
    let mut frames = Vec::new();

    while let Some(frame) = unpacker.next_frame() {
        match frame.compression() {
            Some(version) => {
                if let Ok(inner) = decompress(version, &frame.body) {
                    unpacker.push(Bytes::from(inner))?;
                }
            }
            None if frame.header.protocol_version().is_ok() => frames.push(frame),
            None => {}
        }
    }

    Ok(frames)
}
