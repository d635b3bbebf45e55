//! Shared HTTP plumbing: client construction, API envelopes and cookies.

use crate::error::WebError;
use livedm_client::DEFAULT_USER_AGENT;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Settings for HTTP clients created by this crate.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Total timeout of one request.
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl HttpConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn build_client(&self) -> Result<reqwest::Client, WebError> {
        Ok(reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .build()?)
    }
}

/// Standard `{code, message, data}` response envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Returns `data` of a successful response.
    pub fn into_data(self) -> Result<T, WebError> {
        if self.code != 0 {
            return Err(WebError::Api {
                code: self.code,
                message: self.message,
            });
        }
        self.data
            .ok_or_else(|| WebError::Parse("missing data field".to_string()))
    }
}

/// Reads a JSON body after checking for HTTP 200.
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, WebError> {
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(WebError::Status {
            status: status.as_u16(),
            url: response.url().to_string(),
        });
    }
    Ok(response.json().await?)
}

/// Value of cookie `name` in a user-supplied `Cookie` header string.
pub fn cookie_value<'a>(cookie: &'a str, name: &str) -> Option<&'a str> {
    cookie.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}
