//! Operations, protocol versions and command helpers.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Name of the command synthesized from heartbeat replies.
pub const HEARTBEAT_COMMAND: &str = "_HEARTBEAT";

/// Wire-level message kind.
///
/// The numeric values are protocol constants shared with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Operation {
    Handshake = 0,
    HandshakeReply = 1,
    Heartbeat = 2,
    HeartbeatReply = 3,
    SendMsg = 4,
    SendMsgReply = 5,
    DisconnectReply = 6,
    Auth = 7,
    AuthReply = 8,
    Raw = 9,
    ProtoReady = 10,
    ProtoFinish = 11,
    ChangeRoom = 12,
    ChangeRoomReply = 13,
    Register = 14,
    RegisterReply = 15,
    Unregister = 16,
    UnregisterReply = 17,
}

impl Operation {
    pub fn from_u32(value: u32) -> Option<Self> {
        let op = match value {
            0 => Operation::Handshake,
            1 => Operation::HandshakeReply,
            2 => Operation::Heartbeat,
            3 => Operation::HeartbeatReply,
            4 => Operation::SendMsg,
            5 => Operation::SendMsgReply,
            6 => Operation::DisconnectReply,
            7 => Operation::Auth,
            8 => Operation::AuthReply,
            9 => Operation::Raw,
            10 => Operation::ProtoReady,
            11 => Operation::ProtoFinish,
            12 => Operation::ChangeRoom,
            13 => Operation::ChangeRoomReply,
            14 => Operation::Register,
            15 => Operation::RegisterReply,
            16 => Operation::Unregister,
            17 => Operation::UnregisterReply,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Business messages carry JSON commands, possibly compressed.
    pub fn is_business(self) -> bool {
        matches!(self, Operation::SendMsg | Operation::SendMsgReply)
    }
}

/// Body encoding tag carried in the header's version field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// Versions 0 and 1: the body is used as-is.
    Plain,
    /// Version 2: zlib-wrapped deflate of a frame concatenation.
    Deflate,
    /// Version 3: brotli of a frame concatenation.
    Brotli,
}

impl ProtocolVersion {
    pub fn from_u16(value: u16) -> Result<Self, ProtocolError> {
        match value {
            0 | 1 => Ok(ProtocolVersion::Plain),
            2 => Ok(ProtocolVersion::Deflate),
            3 => Ok(ProtocolVersion::Brotli),
            other => Err(ProtocolError::UnsupportedVersion(other)),
        }
    }

    pub fn is_compressed(self) -> bool {
        !matches!(self, ProtocolVersion::Plain)
    }
}

/// Server reply to the `Auth` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthReply {
    pub code: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl AuthReply {
    pub const OK: i64 = 0;
    pub const TOKEN_ERROR: i64 = -101;

    pub fn is_ok(&self) -> bool {
        self.code == Self::OK
    }
}

/// Returns the significant part of a command's `cmd` key.
///
/// Anything after the first `:` is a parameter and is ignored. Missing or
/// non-string `cmd` values yield an empty name.
pub fn command_name(command: &Value) -> &str {
    let cmd = command.get("cmd").and_then(Value::as_str).unwrap_or("");
    match cmd.find(':') {
        Some(pos) => &cmd[..pos],
        None => cmd,
    }
}

/// Builds the command dispatched for a heartbeat reply.
pub fn heartbeat_command(popularity: u32) -> Value {
    json!({
        "cmd": HEARTBEAT_COMMAND,
        "data": {
            "popularity": popularity,
        },
    })
}

/// Parses a plain business body. Empty bodies carry no command.
pub fn parse_command(body: &[u8]) -> Result<Option<Value>, ProtocolError> {
    if body.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(body)?))
}
