use std::time::Duration;

use serde::{Deserialize, Serialize};

/// WebSocket subprotocol negotiated on the upgrade request.
pub const GRAPHQL_WS_SUBPROTOCOL: &str = "graphql-ws";

/// Time to wait for any incoming message before the connection is
/// considered dead.
///
/// The server emits keep-alive frames of its own, and every ping we send is
/// answered with a pong, so a silent minute means the socket is gone.
pub const WS_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(15);

/// Maximum inbound text frame size in bytes (4 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Default fixed delay between a lost connection and the next attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Close code sent by the server when the bearer token is rejected.
pub const WS_CLOSE_UNAUTHORIZED: u16 = 4401;
/// Close code sent by the server when the bearer token lacks access.
pub const WS_CLOSE_FORBIDDEN: u16 = 4403;

/// Classification of an inbound frame by its `type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    #[serde(rename = "connection_ack")]
    ConnectionAck,
    #[serde(rename = "data")]
    Data,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "complete")]
    Complete,

    /// Forward compatibility: unknown frame types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Returns `true` if a close code means the server refused our credentials.
pub fn is_auth_close_code(code: u16) -> bool {
    code == WS_CLOSE_UNAUTHORIZED || code == WS_CLOSE_FORBIDDEN
}
