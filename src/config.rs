//! Monitor configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via LIVEDM_CONFIG)
//! 3. Environment variables

use livedm_client::{ClientConfig, RetryPolicy};
use livedm_web::{HttpConfig, OpenLiveConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Monitor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Rooms to join through the web API.
    pub rooms: Vec<u64>,
    /// Connection engine configuration.
    pub client: EngineConfig,
    /// Reconnect backoff.
    pub retry: RetryConfig,
    /// Web API configuration.
    pub web: WebConfig,
    /// Open platform configuration.
    pub open_live: OpenLiveSection,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("LIVEDM_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::ParseError(_, msg) => ConfigError::ParseError(path.to_path_buf(), msg),
            other => other,
        })
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(PathBuf::from("<inline>"), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(rooms) = std::env::var("LIVEDM_ROOMS") {
            let parsed: Result<Vec<u64>, _> = rooms
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect();
            if let Ok(parsed) = parsed {
                self.rooms = parsed;
            }
        }

        self.client.apply_env_overrides();
        self.retry.apply_env_overrides();
        self.web.apply_env_overrides();
        self.open_live.apply_env_overrides();
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rooms.is_empty() && !self.open_live.enabled {
            return Err(ConfigError::ValidationError(
                "no rooms configured and open_live disabled".to_string(),
            ));
        }
        if self.client.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "client.heartbeat_interval_secs must be positive".to_string(),
            ));
        }
        self.open_live.validate()
    }

    /// Engine configuration for one room.
    pub fn client_config(&self, room_id: u64) -> ClientConfig {
        ClientConfig::new(room_id)
            .with_heartbeat_interval(self.client.heartbeat_interval())
            .with_receive_timeout_margin(Duration::from_secs(self.client.receive_timeout_margin_secs))
            .with_connect_timeout(Duration::from_secs(self.client.connect_timeout_secs))
            .with_retry_policy(self.retry.policy())
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig::default().with_timeout(Duration::from_secs(self.web.http_timeout_secs))
    }
}

/// Connection engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Client heartbeat period in seconds.
    pub heartbeat_interval_secs: u64,
    /// Added to the heartbeat period to get the receive timeout.
    pub receive_timeout_margin_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            receive_timeout_margin_secs: 5,
            connect_timeout_secs: 10,
        }
    }
}

impl EngineConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(interval) = std::env::var("LIVEDM_HEARTBEAT_INTERVAL") {
            if let Ok(secs) = interval.parse() {
                self.heartbeat_interval_secs = secs;
            }
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Backoff kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryKind {
    Constant,
    Linear,
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub kind: RetryKind,
    /// Constant interval, or the first interval of a linear backoff.
    pub interval_ms: u64,
    /// Linear growth per failed attempt.
    pub step_ms: u64,
    /// Linear cap.
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            kind: RetryKind::Constant,
            interval_ms: 1000,
            step_ms: 1000,
            max_ms: 10_000,
        }
    }
}

impl RetryConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(interval) = std::env::var("LIVEDM_RETRY_INTERVAL") {
            if let Ok(ms) = interval.parse() {
                self.interval_ms = ms;
            }
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        let interval = Duration::from_millis(self.interval_ms);
        match self.kind {
            RetryKind::Constant => RetryPolicy::constant(interval),
            RetryKind::Linear => RetryPolicy::linear(
                interval,
                Duration::from_millis(self.step_ms),
                Duration::from_millis(self.max_ms),
            ),
        }
    }
}

/// Web API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// `Cookie` header, e.g. `SESSDATA=...; buvid3=...`.
    pub cookie: Option<String>,
    /// Fixed uid. Looked up from the cookie when unset.
    pub uid: Option<u64>,
    pub http_timeout_secs: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            cookie: None,
            uid: None,
            http_timeout_secs: 10,
        }
    }
}

impl WebConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(cookie) = std::env::var("LIVEDM_COOKIE") {
            self.cookie = Some(cookie);
        }
        if let Ok(uid) = std::env::var("LIVEDM_UID") {
            if let Ok(uid) = uid.parse() {
                self.uid = Some(uid);
            }
        }
        if let Ok(timeout) = std::env::var("LIVEDM_HTTP_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.http_timeout_secs = secs;
            }
        }
    }
}

/// Open platform configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenLiveSection {
    pub enabled: bool,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub app_id: u64,
    /// Anchor auth code.
    pub auth_code: String,
    /// Overrides the platform URL.
    pub base_url: Option<String>,
}

impl OpenLiveSection {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("LIVEDM_OPEN_LIVE_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(id) = std::env::var("LIVEDM_OPEN_LIVE_ACCESS_KEY_ID") {
            self.access_key_id = id;
        }
        if let Ok(secret) = std::env::var("LIVEDM_OPEN_LIVE_ACCESS_KEY_SECRET") {
            self.access_key_secret = secret;
        }
        if let Ok(app_id) = std::env::var("LIVEDM_OPEN_LIVE_APP_ID") {
            if let Ok(n) = app_id.parse() {
                self.app_id = n;
            }
        }
        if let Ok(code) = std::env::var("LIVEDM_OPEN_LIVE_AUTH_CODE") {
            self.auth_code = code;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.access_key_id.is_empty() || self.access_key_secret.is_empty() {
            return Err(ConfigError::ValidationError(
                "open_live enabled but access key not set".to_string(),
            ));
        }
        if self.app_id == 0 {
            return Err(ConfigError::ValidationError(
                "open_live enabled but app_id not set".to_string(),
            ));
        }
        if self.auth_code.is_empty() {
            return Err(ConfigError::ValidationError(
                "open_live enabled but auth_code not set".to_string(),
            ));
        }

        Ok(())
    }

    pub fn to_open_live_config(&self) -> OpenLiveConfig {
        let config = OpenLiveConfig::new(
            self.access_key_id.clone(),
            self.access_key_secret.clone(),
            self.app_id,
            self.auth_code.clone(),
        );
        match &self.base_url {
            Some(url) => config.with_base_url(url.clone()),
            None => config,
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
