//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or body handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Fewer than 16 bytes remain, or the header describes a frame that
    /// cannot fit. Readers treat this as the end of the buffer.
    #[error("malformed header at offset {offset}: {remaining} bytes remain")]
    MalformedHeader { offset: usize, remaining: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("compressed frames nested deeper than {max}")]
    NestingTooDeep { max: usize },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
