//! # livedm-protocol
//!
//! Wire protocol implementation for the live room danmaku WebSocket service.
//!
//! This crate provides:
//! - The fixed 16-byte big-endian frame header and frame encoding
//! - Self-delimiting multi-frame buffer reading
//! - Deflate/Brotli body decompression with bounded nesting
//! - Operation and protocol version constants
//! - Command helpers (`cmd` name extraction, synthesized heartbeat command)

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{decompress, unpack, Unpacker, MAX_NESTING_DEPTH};
pub use error::ProtocolError;
pub use frame::{decode_header, decode_message, Frame, FrameHeader, FrameReader, HEADER_SIZE};
pub use message::{
    command_name, heartbeat_command, parse_command, AuthReply, Operation, ProtocolVersion,
    HEARTBEAT_COMMAND,
};

/// Protocol version written into every outbound frame.
pub const OUTBOUND_VERSION: u16 = 1;

/// Sequence id written into every outbound frame. The server ignores it.
pub const OUTBOUND_SEQUENCE: u32 = 1;
