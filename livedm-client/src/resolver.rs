//! Boundary with the bootstrap side: room info resolution and auth bodies.

use crate::error::ClientError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Host of the public fallback edge server.
pub const DEFAULT_EDGE_HOST: &str = "broadcastlv.chat.bilibili.com";

/// One WebSocket endpoint serving a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeServer {
    pub host: String,
    pub port: u16,
    pub wss_port: u16,
    #[serde(default)]
    pub ws_port: u16,
    /// Full endpoint URL, when the server was announced as a link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl EdgeServer {
    pub fn new(host: impl Into<String>, port: u16, wss_port: u16, ws_port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            wss_port,
            ws_port,
            url: None,
        }
    }

    /// Builds an edge server from a full `ws://` or `wss://` link.
    pub fn from_url(link: &str) -> Result<Self, ClientError> {
        let parsed = url::Url::parse(link).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ClientError::InvalidUrl(format!("missing host: {link}")))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| ClientError::InvalidUrl(format!("missing port: {link}")))?;
        let (wss_port, ws_port) = match parsed.scheme() {
            "wss" => (port, 0),
            "ws" => (0, port),
            other => return Err(ClientError::InvalidUrl(format!("unsupported scheme: {other}"))),
        };
        Ok(Self {
            host: host.to_string(),
            port,
            wss_port,
            ws_port,
            url: Some(link.to_string()),
        })
    }

    /// URL the engine connects to.
    pub fn ws_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!("wss://{}:{}/sub", self.host, self.wss_port),
        }
    }
}

/// Fallback edge servers used when room info cannot be resolved.
pub fn default_edge_servers() -> Vec<EdgeServer> {
    vec![EdgeServer::new(DEFAULT_EDGE_HOST, 2243, 443, 2244)]
}

/// Everything needed to connect to one room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomInfo {
    /// Real (long) room id.
    pub room_id: u64,
    pub owner_uid: u64,
    /// Edge servers; empty means "use the fallback list".
    pub servers: Vec<EdgeServer>,
    /// Token authorizing the connection, if the resolver obtained one.
    pub token: Option<String>,
    /// Set when part of the info is a stand-in for data the resolver could
    /// not fetch.
    pub degraded: bool,
}

/// Body of the `Auth` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthBody {
    /// Serialized as JSON.
    Json(Value),
    /// Sent verbatim, for bodies the platform hands out pre-built.
    Raw(String),
}

impl AuthBody {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            AuthBody::Json(value) => serde_json::to_vec(value),
            AuthBody::Raw(raw) => Ok(raw.as_bytes().to_vec()),
        }
    }
}

/// Resolves a room id (long or short) into connection details.
#[async_trait]
pub trait RoomResolver: Send + Sync {
    async fn resolve(&self, room_id: u64) -> Result<RoomInfo, ClientError>;

    /// Called before every connection attempt that would otherwise reuse
    /// the current room info.
    fn should_reresolve(&self, _retry_count: u32, _server_count: usize) -> bool {
        false
    }

    /// Completes when the resolver has invalidated the current session.
    /// The engine then drops the socket and resolves again.
    async fn invalidated(&self) {
        std::future::pending::<()>().await
    }

    /// Releases resolver-owned resources.
    async fn close(&self) {}
}

/// Builds the auth body for a client variant.
pub trait AuthBodyBuilder: Send + Sync {
    fn build_auth_body(&self, room: &RoomInfo) -> Result<AuthBody, ClientError>;
}

/// Resolver returning fixed room info.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    info: RoomInfo,
}

impl StaticResolver {
    pub fn new(info: RoomInfo) -> Self {
        Self { info }
    }
}

#[async_trait]
impl RoomResolver for StaticResolver {
    async fn resolve(&self, _room_id: u64) -> Result<RoomInfo, ClientError> {
        Ok(self.info.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ws_url_from_host() {
        let server = EdgeServer::new("tx-bj-live-comet-01.chat.bilibili.com", 2243, 443, 2244);
        assert_eq!(
            server.ws_url(),
            "wss://tx-bj-live-comet-01.chat.bilibili.com:443/sub"
        );
    }

    #[test]
    fn test_from_url() {
        let server = EdgeServer::from_url("wss://zj-cn-live-comet.chat.bilibili.com:2245/sub").unwrap();
        assert_eq!(server.host, "zj-cn-live-comet.chat.bilibili.com");
        assert_eq!(server.wss_port, 2245);
        assert_eq!(
            server.ws_url(),
            "wss://zj-cn-live-comet.chat.bilibili.com:2245/sub"
        );

        let server = EdgeServer::from_url("ws://127.0.0.1:9000/sub").unwrap();
        assert_eq!(server.ws_port, 9000);
        assert_eq!(server.wss_port, 0);

        assert!(EdgeServer::from_url("http://example.com/").is_err());
        assert!(EdgeServer::from_url("not a url").is_err());
    }

    #[test]
    fn test_edge_server_deserialize() {
        let server: EdgeServer = serde_json::from_value(json!({
            "host": "broadcastlv.chat.bilibili.com",
            "port": 2243,
            "wss_port": 443,
            "ws_port": 2244
        }))
        .unwrap();
        assert_eq!(server, default_edge_servers()[0]);
    }

    #[test]
    fn test_auth_body_bytes() {
        let raw = AuthBody::Raw(r#"{"roomid":1,"key":"k"}"#.to_string());
        assert_eq!(raw.to_bytes().unwrap(), br#"{"roomid":1,"key":"k"}"#.to_vec());

        let body = AuthBody::Json(json!({"uid": 0}));
        assert_eq!(body.to_bytes().unwrap(), br#"{"uid":0}"#.to_vec());
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let info = RoomInfo {
            room_id: 7,
            owner_uid: 9,
            servers: default_edge_servers(),
            token: None,
            degraded: false,
        };
        let resolver = StaticResolver::new(info.clone());
        assert_eq!(resolver.resolve(1).await.unwrap(), info);
        assert!(!resolver.should_reresolve(3, 1));
    }
}
