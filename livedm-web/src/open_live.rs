//! Open platform sessions.
//!
//! The open platform hands out the auth body and WebSocket links when a
//! "game" is started for an anchor's auth code. The game must be kept alive
//! with its own heartbeat; when the platform reports it gone, the current
//! WebSocket session is invalidated and the game is started again.

use crate::error::WebError;
use crate::http::{read_json, ApiResponse, HttpConfig};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use livedm_client::{AuthBody, AuthBodyBuilder, ClientError, EdgeServer, RoomInfo, RoomResolver};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_OPEN_LIVE_URL: &str = "https://live-open.biliapi.com";

/// The game has already ended.
pub const CODE_GAME_ENDED: i64 = 7000;
/// The game is not running, usually after missed heartbeats.
pub const CODE_GAME_GONE: i64 = 7003;

const SIGNATURE_METHOD: &str = "HMAC-SHA256";
const SIGNATURE_VERSION: &str = "1.0";

/// Open platform credentials and session settings.
#[derive(Debug, Clone)]
pub struct OpenLiveConfig {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub app_id: u64,
    /// Auth code of the anchor whose room is joined.
    pub auth_code: String,
    pub game_heartbeat_interval: Duration,
    pub base_url: String,
}

impl OpenLiveConfig {
    pub fn new(
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
        app_id: u64,
        auth_code: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
            app_id,
            auth_code: auth_code.into(),
            game_heartbeat_interval: Duration::from_secs(20),
            base_url: DEFAULT_OPEN_LIVE_URL.to_string(),
        }
    }

    pub fn with_game_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.game_heartbeat_interval = interval;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Signature headers for one request, in signing order, followed by
/// `Authorization`.
pub fn sign_headers(
    access_key_id: &str,
    access_key_secret: &str,
    body: &[u8],
    nonce: u32,
    timestamp: i64,
) -> Result<Vec<(&'static str, String)>, WebError> {
    let mut headers = vec![
        ("x-bili-accesskeyid", access_key_id.to_string()),
        ("x-bili-content-md5", format!("{:x}", md5::compute(body))),
        ("x-bili-signature-method", SIGNATURE_METHOD.to_string()),
        ("x-bili-signature-nonce", nonce.to_string()),
        ("x-bili-signature-version", SIGNATURE_VERSION.to_string()),
        ("x-bili-timestamp", timestamp.to_string()),
    ];

    let content = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}"))
        .collect::<Vec<_>>()
        .join("\n");
    let mut mac = Hmac::<Sha256>::new_from_slice(access_key_secret.as_bytes())
        .map_err(|e| WebError::InvalidConfig(e.to_string()))?;
    mac.update(content.as_bytes());
    headers.push(("authorization", hex::encode(mac.finalize().into_bytes())));
    Ok(headers)
}

#[derive(Debug, Deserialize)]
struct StartData {
    game_info: GameInfo,
    websocket_info: WebsocketInfo,
    anchor_info: AnchorInfo,
}

#[derive(Debug, Deserialize)]
struct GameInfo {
    game_id: String,
}

#[derive(Debug, Deserialize)]
struct WebsocketInfo {
    auth_body: String,
    #[serde(default)]
    wss_link: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AnchorInfo {
    room_id: u64,
    uid: u64,
}

/// A started game.
#[derive(Debug, Clone)]
pub struct GameSession {
    pub game_id: String,
    pub auth_body: String,
}

#[derive(Debug)]
struct Shared {
    http: reqwest::Client,
    config: OpenLiveConfig,
    session: RwLock<Option<GameSession>>,
    invalid: AtomicBool,
    invalidated: Notify,
}

impl Shared {
    async fn request(&self, path: &str, body: &Value) -> Result<Value, WebError> {
        let payload = serde_json::to_vec(body)?;
        let nonce = rand::thread_rng().gen_range(0..1_000_000_000);
        let headers = sign_headers(
            &self.config.access_key_id,
            &self.config.access_key_secret,
            &payload,
            nonce,
            chrono::Utc::now().timestamp(),
        )?;

        let mut request = self
            .http
            .post(self.config.url(path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json");
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.body(payload).send().await?;
        let body: ApiResponse<Value> = read_json(response).await?;
        if body.code != 0 {
            tracing::debug!(
                code = body.code,
                request_id = body.request_id.as_deref().unwrap_or(""),
                "Open platform error on {}",
                path
            );
        }
        body.into_data()
    }

    fn game_id(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.game_id.clone())
    }

    async fn send_game_heartbeat(&self) {
        let Some(game_id) = self.game_id() else {
            tracing::warn!("Game heartbeat skipped, no game started");
            return;
        };

        match self.request("/v2/app/heartbeat", &json!({ "game_id": game_id })).await {
            Ok(_) => tracing::debug!(game_id = %game_id, "Sent game heartbeat"),
            Err(e) => {
                tracing::warn!(game_id = %game_id, "Game heartbeat failed: {}", e);
                // Only invalidate if the game was not restarted meanwhile.
                if e.api_code() == Some(CODE_GAME_GONE) && self.game_id().as_deref() == Some(&game_id) {
                    self.invalid.store(true, Ordering::SeqCst);
                    self.invalidated.notify_waiters();
                }
            }
        }
    }
}

/// Resolver and auth body builder for the open platform.
///
/// One resolver serves one anchor auth code, so one room.
#[derive(Debug)]
pub struct OpenLiveResolver {
    shared: Arc<Shared>,
    heartbeat: Mutex<Option<CancellationToken>>,
}

impl OpenLiveResolver {
    pub fn new(http: reqwest::Client, config: OpenLiveConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                http,
                config,
                session: RwLock::new(None),
                invalid: AtomicBool::new(false),
                invalidated: Notify::new(),
            }),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn from_config(http_config: &HttpConfig, config: OpenLiveConfig) -> Result<Self, WebError> {
        Ok(Self::new(http_config.build_client()?, config))
    }

    pub fn game_id(&self) -> Option<String> {
        self.shared.game_id()
    }

    /// Starts a game, replacing any previous session.
    pub async fn start_game(&self) -> Result<RoomInfo, WebError> {
        let config = &self.shared.config;
        let data = self
            .shared
            .request(
                "/v2/app/start",
                &json!({ "code": config.auth_code, "app_id": config.app_id }),
            )
            .await?;
        let data: StartData = serde_json::from_value(data)?;

        let servers = data
            .websocket_info
            .wss_link
            .iter()
            .filter_map(|link| match EdgeServer::from_url(link) {
                Ok(server) => Some(server),
                Err(e) => {
                    tracing::warn!("Skipping bad wss link {}: {}", link, e);
                    None
                }
            })
            .collect();

        *self.shared.session.write() = Some(GameSession {
            game_id: data.game_info.game_id.clone(),
            auth_body: data.websocket_info.auth_body,
        });
        self.shared.invalid.store(false, Ordering::SeqCst);
        tracing::info!(
            room_id = data.anchor_info.room_id,
            game_id = %data.game_info.game_id,
            "Started open platform game"
        );

        if !data.game_info.game_id.is_empty() {
            self.start_game_heartbeat();
        }

        Ok(RoomInfo {
            room_id: data.anchor_info.room_id,
            owner_uid: data.anchor_info.uid,
            servers,
            token: None,
            degraded: false,
        })
    }

    /// Ends the current game. A game the platform already considers ended
    /// counts as success.
    pub async fn end_game(&self) -> Result<(), WebError> {
        let Some(game_id) = self.game_id() else {
            return Ok(());
        };

        let body = json!({ "app_id": self.shared.config.app_id, "game_id": game_id });
        match self.shared.request("/v2/app/end", &body).await {
            Ok(_) => {}
            Err(e) if matches!(e.api_code(), Some(CODE_GAME_ENDED | CODE_GAME_GONE)) => {}
            Err(e) => return Err(e),
        }
        *self.shared.session.write() = None;
        tracing::info!(game_id = %game_id, "Ended open platform game");
        Ok(())
    }

    fn start_game_heartbeat(&self) {
        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let shared = self.shared.clone();
        let period = shared.config.game_heartbeat_interval;
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let shared = shared.clone();
                tokio::spawn(async move { shared.send_game_heartbeat().await });
            }
        });
        *heartbeat = Some(cancel);
    }

    fn stop_game_heartbeat(&self) {
        if let Some(cancel) = self.heartbeat.lock().take() {
            cancel.cancel();
        }
    }
}

impl Drop for OpenLiveResolver {
    fn drop(&mut self) {
        self.stop_game_heartbeat();
    }
}

#[async_trait]
impl RoomResolver for OpenLiveResolver {
    async fn resolve(&self, _room_id: u64) -> Result<RoomInfo, ClientError> {
        Ok(self.start_game().await?)
    }

    fn should_reresolve(&self, _retry_count: u32, _server_count: usize) -> bool {
        self.shared.invalid.load(Ordering::SeqCst) || self.game_id().is_none()
    }

    async fn invalidated(&self) {
        loop {
            let notified = self.shared.invalidated.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.invalid.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    async fn close(&self) {
        self.stop_game_heartbeat();
        if let Err(e) = self.end_game().await {
            tracing::warn!("Failed to end open platform game: {}", e);
        }
    }
}

impl AuthBodyBuilder for OpenLiveResolver {
    fn build_auth_body(&self, _room: &RoomInfo) -> Result<AuthBody, ClientError> {
        self.shared
            .session
            .read()
            .as_ref()
            .map(|session| AuthBody::Raw(session.auth_body.clone()))
            .ok_or_else(|| ClientError::Resolve("no open platform game started".to_string()))
    }
}
