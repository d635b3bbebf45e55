//! Room resolution and auth for the web client.

use crate::error::WebError;
use crate::http::{cookie_value, read_json, ApiResponse, HttpConfig};
use crate::wbi::WbiSigner;
use async_trait::async_trait;
use livedm_client::{AuthBody, AuthBodyBuilder, ClientError, EdgeServer, RoomInfo, RoomResolver};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Code returned by the nav endpoint for a logged-out session.
const NOT_LOGGED_IN: i64 = -101;

/// Minimum number of consecutive retries between forced re-resolutions.
const MIN_RERESOLVE_PERIOD: usize = 3;

/// Endpoints used by [`WebRoomResolver`].
#[derive(Debug, Clone)]
pub struct WebEndpoints {
    pub nav_url: String,
    pub home_url: String,
    pub room_init_url: String,
    pub danmaku_conf_url: String,
}

impl Default for WebEndpoints {
    fn default() -> Self {
        Self {
            nav_url: "https://api.bilibili.com/x/web-interface/nav".to_string(),
            home_url: "https://www.bilibili.com/".to_string(),
            room_init_url: "https://api.live.bilibili.com/room/v1/Room/get_info".to_string(),
            danmaku_conf_url: "https://api.live.bilibili.com/xlive/web-room/v1/index/getDanmuInfo"
                .to_string(),
        }
    }
}

impl WebEndpoints {
    /// All endpoints on one base URL, keeping the default paths.
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            nav_url: format!("{base}/x/web-interface/nav"),
            home_url: format!("{base}/"),
            room_init_url: format!("{base}/room/v1/Room/get_info"),
            danmaku_conf_url: format!("{base}/xlive/web-room/v1/index/getDanmuInfo"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NavData {
    #[serde(rename = "isLogin", default)]
    is_login: bool,
    #[serde(default)]
    mid: u64,
}

#[derive(Debug, Deserialize)]
struct RoomInitData {
    room_id: u64,
    uid: u64,
}

#[derive(Debug, Deserialize)]
struct DanmakuConf {
    #[serde(default)]
    host_list: Vec<EdgeServer>,
    #[serde(default)]
    token: Option<String>,
}

/// Resolves rooms through the public web API and builds web auth bodies.
///
/// One resolver can serve any number of rooms; the uid and buvid it
/// discovers belong to the HTTP session, not to a room.
#[derive(Debug)]
pub struct WebRoomResolver {
    http: reqwest::Client,
    signer: Arc<WbiSigner>,
    endpoints: WebEndpoints,
    cookie: Option<String>,
    uid: RwLock<Option<u64>>,
    buvid: RwLock<Option<String>>,
}

impl WebRoomResolver {
    pub fn new(http: reqwest::Client, signer: Arc<WbiSigner>) -> Self {
        Self {
            http,
            signer,
            endpoints: WebEndpoints::default(),
            cookie: None,
            uid: RwLock::new(None),
            buvid: RwLock::new(None),
        }
    }

    /// Creates a resolver with its own HTTP client and signer.
    pub fn from_config(config: &HttpConfig) -> Result<Self, WebError> {
        let http = config.build_client()?;
        let signer = Arc::new(WbiSigner::new(http.clone()));
        Ok(Self::new(http, signer))
    }

    /// Fixes the uid sent in auth bodies. 0 means logged out.
    pub fn with_uid(self, uid: u64) -> Self {
        *self.uid.write() = Some(uid);
        self
    }

    /// `Cookie` header sent with every request, e.g. `SESSDATA=...; buvid3=...`.
    pub fn with_cookie(self, cookie: impl Into<String>) -> Self {
        let cookie = cookie.into();
        if let Some(buvid) = cookie_value(&cookie, "buvid3").filter(|v| !v.is_empty()) {
            *self.buvid.write() = Some(buvid.to_string());
        }
        Self {
            cookie: Some(cookie),
            ..self
        }
    }

    pub fn with_endpoints(mut self, endpoints: WebEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn signer(&self) -> &Arc<WbiSigner> {
        &self.signer
    }

    pub fn uid(&self) -> Option<u64> {
        *self.uid.read()
    }

    pub fn buvid(&self) -> Option<String> {
        self.buvid.read().clone()
    }

    fn cookie_header(&self) -> Option<String> {
        let buvid = self.buvid();
        match (&self.cookie, buvid) {
            (Some(cookie), Some(buvid)) if cookie_value(cookie, "buvid3").is_none() => {
                Some(format!("{cookie}; buvid3={buvid}"))
            }
            (Some(cookie), _) => Some(cookie.clone()),
            (None, Some(buvid)) => Some(format!("buvid3={buvid}")),
            (None, None) => None,
        }
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.http.get(url);
        match self.cookie_header() {
            Some(cookie) => request.header(reqwest::header::COOKIE, cookie),
            None => request,
        }
    }

    /// Looks up the logged-in uid. Without a `SESSDATA` cookie the session
    /// is logged out and no request is made.
    async fn fetch_uid(&self) -> Result<u64, WebError> {
        let logged_in = self
            .cookie
            .as_deref()
            .and_then(|cookie| cookie_value(cookie, "SESSDATA"))
            .is_some_and(|sessdata| !sessdata.is_empty());
        if !logged_in {
            return Ok(0);
        }

        let response = self.get(&self.endpoints.nav_url).send().await?;
        let nav: ApiResponse<NavData> = read_json(response).await?;
        if nav.code == NOT_LOGGED_IN {
            return Ok(0);
        }
        let data = nav.into_data()?;
        Ok(if data.is_login { data.mid } else { 0 })
    }

    /// Reads `buvid3` from the homepage's `Set-Cookie` headers.
    async fn fetch_buvid(&self) -> Result<Option<String>, WebError> {
        let response = self.get(&self.endpoints.home_url).send().await?;
        if !response.status().is_success() {
            tracing::warn!("Homepage returned status {}", response.status());
        }
        let buvid = response
            .cookies()
            .find(|c| c.name() == "buvid3")
            .map(|c| c.value().to_string());
        Ok(buvid)
    }

    async fn fetch_room(&self, room_id: u64) -> Result<RoomInitData, WebError> {
        let response = self
            .get(&self.endpoints.room_init_url)
            .query(&[("room_id", room_id)])
            .send()
            .await?;
        let body: ApiResponse<RoomInitData> = read_json(response).await?;
        body.into_data()
    }

    async fn fetch_danmaku_conf(&self, room_id: u64) -> Result<DanmakuConf, WebError> {
        if self.signer.ensure_key().await.is_none() {
            return Err(WebError::NoWbiKey);
        }

        let params = self
            .signer
            .signed_params(vec![
                ("id".to_string(), room_id.to_string()),
                ("type".to_string(), "0".to_string()),
            ])
            .await;
        let response = self
            .get(&self.endpoints.danmaku_conf_url)
            .query(&params)
            .send()
            .await?;
        let body: ApiResponse<DanmakuConf> = read_json(response).await?;
        if body.code == WebError::WBI_SIGN_ERROR {
            self.signer.reset();
        }
        let conf = body.into_data()?;
        if conf.host_list.is_empty() {
            return Err(WebError::Parse("empty host_list".to_string()));
        }
        Ok(conf)
    }

    async fn ensure_session(&self, room_id: u64) {
        if self.uid().is_none() {
            let uid = match self.fetch_uid().await {
                Ok(uid) => uid,
                Err(e) => {
                    tracing::warn!(room_id, "Failed to get uid, using 0: {}", e);
                    0
                }
            };
            *self.uid.write() = Some(uid);
        }

        if self.buvid().is_none() {
            match self.fetch_buvid().await {
                Ok(Some(buvid)) => *self.buvid.write() = Some(buvid),
                Ok(None) => tracing::warn!(room_id, "Homepage did not set buvid3"),
                Err(e) => tracing::warn!(room_id, "Failed to get buvid: {}", e),
            }
        }
    }
}

#[async_trait]
impl RoomResolver for WebRoomResolver {
    async fn resolve(&self, room_id: u64) -> Result<RoomInfo, ClientError> {
        self.ensure_session(room_id).await;

        // Without room info the requested id is used as is and the owner
        // stays unknown; the danmaku config is still worth fetching.
        let mut info = match self.fetch_room(room_id).await {
            Ok(room) => RoomInfo {
                room_id: room.room_id,
                owner_uid: room.uid,
                ..RoomInfo::default()
            },
            Err(e) => {
                tracing::warn!(room_id, "Failed to get room info: {}", e);
                RoomInfo {
                    room_id,
                    degraded: true,
                    ..RoomInfo::default()
                }
            }
        };

        match self.fetch_danmaku_conf(info.room_id).await {
            Ok(conf) => {
                info.servers = conf.host_list;
                info.token = conf.token;
            }
            // Leave the list empty so the engine falls back to defaults.
            Err(e) => tracing::warn!(room_id = info.room_id, "Failed to get danmaku servers: {}", e),
        }
        Ok(info)
    }

    fn should_reresolve(&self, retry_count: u32, server_count: usize) -> bool {
        let period = server_count.max(MIN_RERESOLVE_PERIOD);
        retry_count > 0 && retry_count as usize % period == 0
    }
}

impl AuthBodyBuilder for WebRoomResolver {
    fn build_auth_body(&self, room: &RoomInfo) -> Result<AuthBody, ClientError> {
        let mut body = json!({
            "uid": self.uid().unwrap_or(0),
            "roomid": room.room_id,
            "protover": 3,
            "platform": "web",
            "type": 2,
            "buvid": self.buvid().unwrap_or_default(),
        });
        if let Some(token) = &room.token {
            body["key"] = json!(token);
        }
        Ok(AuthBody::Json(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn nav_body(logged_in: bool) -> serde_json::Value {
        json!({
            "code": if logged_in { 0 } else { -101 },
            "message": "0",
            "data": {
                "isLogin": logged_in,
                "mid": if logged_in { 12345 } else { 0 },
                "wbi_img": {
                    "img_url": "https://i0.hdslb.com/bfs/wbi/7cd084941338484aae1ad9425b84077c.png",
                    "sub_url": "https://i0.hdslb.com/bfs/wbi/4932caff0ff746eab6f01bf08b70ac45.png"
                }
            }
        })
    }

    async fn mount_room(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/room/v1/Room/get_info"))
            .and(query_param("room_id", "6"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "message": "ok",
                "data": { "room_id": 7734200, "uid": 50329118 }
            })))
            .mount(server)
            .await;
    }

    async fn mount_nav(server: &MockServer, logged_in: bool) {
        Mock::given(method("GET"))
            .and(path("/x/web-interface/nav"))
            .respond_with(ResponseTemplate::new(200).set_body_json(nav_body(logged_in)))
            .mount(server)
            .await;
    }

    fn resolver(server: &MockServer) -> WebRoomResolver {
        let http = reqwest::Client::new();
        let endpoints = WebEndpoints::with_base(&server.uri());
        let signer = Arc::new(WbiSigner::with_nav_url(http.clone(), endpoints.nav_url.clone()));
        WebRoomResolver::new(http, signer).with_endpoints(endpoints)
    }

    #[tokio::test]
    async fn test_resolve_room() {
        let server = MockServer::start().await;
        mount_room(&server).await;
        mount_nav(&server, true).await;
        Mock::given(method("GET"))
            .and(path("/xlive/web-room/v1/index/getDanmuInfo"))
            .and(query_param("id", "7734200"))
            .and(query_param("type", "0"))
            .and(header("cookie", "SESSDATA=s3cr3t; buvid3=BUVID-infoc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "message": "0",
                "data": {
                    "token": "tok",
                    "host_list": [
                        {"host": "a.chat.bilibili.com", "port": 2243, "wss_port": 443, "ws_port": 2244},
                        {"host": "b.chat.bilibili.com", "port": 2243, "wss_port": 443, "ws_port": 2244}
                    ]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = resolver(&server).with_cookie("SESSDATA=s3cr3t; buvid3=BUVID-infoc");
        let info = resolver.resolve(6).await.unwrap();

        assert_eq!(info.room_id, 7734200);
        assert_eq!(info.owner_uid, 50329118);
        assert!(!info.degraded);
        assert_eq!(info.servers.len(), 2);
        assert_eq!(info.servers[1].ws_url(), "wss://b.chat.bilibili.com:443/sub");
        assert_eq!(info.token.as_deref(), Some("tok"));
        assert_eq!(resolver.uid(), Some(12345));

        let requests = server.received_requests().await.unwrap();
        let conf = requests
            .iter()
            .find(|r| r.url.path() == "/xlive/web-room/v1/index/getDanmuInfo")
            .unwrap();
        let query: Vec<(String, String)> = conf.url.query_pairs().into_owned().collect();
        assert!(query.iter().any(|(k, _)| k == "wts"));
        assert!(query.iter().any(|(k, v)| k == "w_rid" && v.len() == 32));

        let body = resolver.build_auth_body(&info).unwrap();
        let AuthBody::Json(body) = body else {
            panic!("web auth body must be JSON");
        };
        assert_eq!(
            body,
            json!({
                "uid": 12345,
                "roomid": 7734200,
                "protover": 3,
                "platform": "web",
                "type": 2,
                "buvid": "BUVID-infoc",
                "key": "tok"
            })
        );
    }

    #[tokio::test]
    async fn test_logged_out_session_fetches_buvid() {
        let server = MockServer::start().await;
        mount_room(&server).await;
        mount_nav(&server, false).await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .append_header("set-cookie", "b_nut=100; path=/")
                    .append_header("set-cookie", "buvid3=FROM-HOME; path=/; domain=bilibili.com"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xlive/web-room/v1/index/getDanmuInfo"))
            .and(header("cookie", "buvid3=FROM-HOME"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "data": {"token": null, "host_list": [{"host": "h", "port": 1, "wss_port": 2, "ws_port": 3}]}
            })))
            .mount(&server)
            .await;

        let resolver = resolver(&server);
        let info = resolver.resolve(6).await.unwrap();
        assert_eq!(resolver.uid(), Some(0));
        assert_eq!(resolver.buvid().as_deref(), Some("FROM-HOME"));
        assert!(info.token.is_none());

        let AuthBody::Json(body) = resolver.build_auth_body(&info).unwrap() else {
            panic!("web auth body must be JSON");
        };
        assert!(body.get("key").is_none());
        assert_eq!(body["uid"], 0);
    }

    #[tokio::test]
    async fn test_bad_signature_resets_key() {
        let server = MockServer::start().await;
        mount_room(&server).await;
        mount_nav(&server, false).await;
        Mock::given(method("GET"))
            .and(path("/xlive/web-room/v1/index/getDanmuInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": -352,
                "message": "-352",
                "data": null
            })))
            .mount(&server)
            .await;

        let resolver = resolver(&server).with_uid(0).with_cookie("buvid3=x");
        let info = resolver.resolve(6).await.unwrap();

        // Room info is still usable; servers are left to the engine's fallback.
        assert_eq!(info.room_id, 7734200);
        assert!(info.servers.is_empty());
        assert!(resolver.signer().needs_refresh());
    }

    #[tokio::test]
    async fn test_room_info_failure_degrades() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/room/v1/Room/get_info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 1,
                "message": "room does not exist",
                "data": null
            })))
            .mount(&server)
            .await;

        mount_nav(&server, false).await;
        Mock::given(method("GET"))
            .and(path("/xlive/web-room/v1/index/getDanmuInfo"))
            .and(query_param("id", "6"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "data": {"token": "tok", "host_list": [{"host": "h", "port": 1, "wss_port": 2, "ws_port": 3}]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = resolver(&server).with_uid(0).with_cookie("buvid3=x");
        let info = resolver.resolve(6).await.unwrap();
        assert_eq!(info.room_id, 6);
        assert_eq!(info.owner_uid, 0);
        assert!(info.degraded);
        assert_eq!(info.servers.len(), 1);
        assert_eq!(info.token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_should_reresolve_period() {
        let resolver = WebRoomResolver::new(
            reqwest::Client::new(),
            Arc::new(WbiSigner::new(reqwest::Client::new())),
        );

        let hits: Vec<u32> = (0..10).filter(|n| resolver.should_reresolve(*n, 2)).collect();
        assert_eq!(hits, vec![3, 6, 9]);

        let hits: Vec<u32> = (0..11).filter(|n| resolver.should_reresolve(*n, 5)).collect();
        assert_eq!(hits, vec![5, 10]);
    }

    #[test]
    fn test_cookie_header_merges_buvid() {
        let resolver = WebRoomResolver::new(
            reqwest::Client::new(),
            Arc::new(WbiSigner::new(reqwest::Client::new())),
        )
        .with_cookie("SESSDATA=abc");
        assert_eq!(resolver.cookie_header().as_deref(), Some("SESSDATA=abc"));

        *resolver.buvid.write() = Some("B".to_string());
        assert_eq!(
            resolver.cookie_header().as_deref(),
            Some("SESSDATA=abc; buvid3=B")
        );
    }
}
