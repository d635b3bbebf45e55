//! # livedm-web
//!
//! HTTP bootstrap for livedm clients.
//!
//! This crate provides:
//! - wbi request signing with a cached, single-flight refreshed key
//! - A resolver for the public web API (room info, danmaku servers, uid and buvid)
//! - A resolver for open platform sessions, with game heartbeats

pub mod error;
pub mod http;
pub mod open_live;
pub mod wbi;
pub mod web;

pub use error::WebError;
pub use http::{cookie_value, HttpConfig};
pub use open_live::{sign_headers, GameSession, OpenLiveConfig, OpenLiveResolver};
pub use wbi::{mixin_key, sign_params, WbiSigner, WBI_KEY_TTL};
pub use web::{WebEndpoints, WebRoomResolver};
