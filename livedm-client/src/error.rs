//! Client error types.

use thiserror::Error;

/// Error type returned by registered command callbacks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(#[from] livedm_protocol::ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out waiting for server")]
    Timeout,

    #[error("auth reply error: code={code}, body={body}")]
    Auth { code: i64, body: String },

    #[error("room session invalidated by resolver")]
    SessionInvalidated,

    #[error("room info resolution failed: {0}")]
    Resolve(String),

    #[error("no edge servers available")]
    NoEdgeServers,

    #[error("invalid edge server URL: {0}")]
    InvalidUrl(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl ClientError {
    /// Returns whether this error means the socket is gone and a reconnect
    /// is needed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::WebSocket(_)
                | ClientError::ConnectionClosed
                | ClientError::Timeout
                | ClientError::InvalidUrl(_)
        )
    }

    /// Returns whether room info must be resolved again before the next
    /// connection attempt.
    pub fn requires_reresolve(&self) -> bool {
        matches!(
            self,
            ClientError::Auth { .. } | ClientError::SessionInvalidated
        )
    }

    /// Returns whether the error ends the current socket session.
    pub fn is_session_fatal(&self) -> bool {
        self.is_transport() || self.requires_reresolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ClientError::Timeout.is_transport());
        assert!(ClientError::ConnectionClosed.is_transport());
        assert!(!ClientError::Timeout.requires_reresolve());

        let auth = ClientError::Auth {
            code: -101,
            body: "{}".to_string(),
        };
        assert!(auth.requires_reresolve());
        assert!(!auth.is_transport());
        assert!(auth.is_session_fatal());

        assert!(ClientError::SessionInvalidated.requires_reresolve());

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ClientError::from(json);
        assert!(!err.is_session_fatal());
        assert!(!ClientError::Worker("join failed".to_string()).is_session_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = ClientError::Auth {
            code: -101,
            body: r#"{"code":-101}"#.to_string(),
        };
        assert!(err.to_string().contains("-101"));
        assert!(ClientError::NoEdgeServers.to_string().contains("edge"));
    }
}
