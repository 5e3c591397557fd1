use tokio_tungstenite::tungstenite;

/// Token acquisition failed. Never retried automatically.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("token provider failed: {0}")]
    Provider(String),

    #[error("token provider returned an empty token")]
    EmptyToken,
}

/// Socket-level failure. Always handled by reconnecting.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid header {0}")]
    InvalidHeader(String),

    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Returns `true` if the server refused the upgrade because of our
    /// credentials (HTTP 401 or 403).
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Ws(tungstenite::Error::Http(response)) => {
                let status = response.status().as_u16();
                status == 401 || status == 403
            }
            _ => false,
        }
    }
}

/// Misuse of the [`ConnectionManager`](crate::ConnectionManager) lifecycle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ManagerError {
    #[error("connection manager already started")]
    AlreadyStarted,

    #[error("connection manager was stopped")]
    Stopped,

    #[error("connection manager not started")]
    NotStarted,
}
