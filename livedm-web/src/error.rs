//! Web bootstrap error types.

use livedm_client::ClientError;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("API error: code={code}, message={message}")]
    Api { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no wbi key available")]
    NoWbiKey,

    #[error("wbi key fetch failed: {0}")]
    KeyFetch(Arc<WebError>),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl WebError {
    /// Server code reporting a bad wbi signature.
    pub const WBI_SIGN_ERROR: i64 = -352;

    pub fn api_code(&self) -> Option<i64> {
        match self {
            WebError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<WebError> for ClientError {
    fn from(err: WebError) -> Self {
        ClientError::Resolve(err.to_string())
    }
}
