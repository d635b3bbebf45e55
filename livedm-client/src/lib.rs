//! # livedm-client
//!
//! Client library for live room danmaku streams.
//!
//! This crate provides:
//! - A reconnecting connection engine, one per room ([`LiveClient`])
//! - Client heartbeat scheduling
//! - Command dispatch to registered callbacks
//! - Pluggable room info resolution and auth bodies
//! - Reconnect backoff policies

pub mod client;
mod connection;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod resolver;
pub mod retry;

#[cfg(test)]
mod test_util;

pub use client::{select_server, ClientConfig, ClientHandle, ClientState, LiveClient, DEFAULT_USER_AGENT};
pub use dispatcher::{Callback, Dispatcher, Handler, QUIET_COMMANDS};
pub use error::{ClientError, HandlerError};
pub use heartbeat::{FrameSink, HeartbeatScheduler};
pub use resolver::{
    default_edge_servers, AuthBody, AuthBodyBuilder, EdgeServer, RoomInfo, RoomResolver,
    StaticResolver, DEFAULT_EDGE_HOST,
};
pub use retry::RetryPolicy;
