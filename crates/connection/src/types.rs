//! Public types for the connection manager.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use poolflow_protocol::SubscriptionRequest;
use poolflow_protocol::constants::{
    DEFAULT_RECONNECT_DELAY, GRAPHQL_WS_SUBPROTOCOL, WS_PING_PERIOD, WS_READ_TIMEOUT,
};

use crate::error::AuthError;
use crate::token::AuthToken;

/// Lifecycle state of the single client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or token acquisition failed.
    Disconnected,
    /// Fetching a token or opening the socket.
    Connecting,
    /// Socket open, `connection_init` sent.
    AwaitingAck,
    /// Handshake complete, subscription started.
    Ready,
    /// Stopped by the owner. Terminal.
    Closing,
    /// Connection lost, next attempt scheduled.
    Reconnecting { attempt: u32 },
}

/// Events surfaced to the owner of a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// No token could be obtained. The client stays disconnected.
    AuthFailed(AuthError),
    /// The server reported an error for the subscription. The connection
    /// stays open.
    SubscriptionError { id: Option<String>, payload: Value },
    /// The server completed the subscription. It stays inactive until the
    /// owner registers a request again.
    SubscriptionCompleted { id: String },
    /// A reconnect attempt has been scheduled.
    Reconnecting { attempt: u32, next_retry_secs: f64 },
}

/// Fixed-interval reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay between a lost connection and the next attempt.
    pub delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Liveness settings for an open connection.
///
/// `read_timeout` should be several `ping_interval`s long: every ping is
/// answered with a pong, so a healthy socket is never silent that long.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Interval between client pings.
    pub ping_interval: Duration,
    /// Silence after which the connection is treated as dead.
    pub read_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: WS_PING_PERIOD,
            read_timeout: WS_READ_TIMEOUT,
        }
    }
}

/// Static client identity sent with every connection.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    pub app_name: String,
    pub app_version: String,
    /// Operating-mode tag (e.g. `"production"`).
    pub mode: String,
    /// Additional fixed headers, e.g. `X-Cloud`.
    pub extra_headers: BTreeMap<String, String>,
}

impl ClientIdentity {
    /// Builds the header set for a connection using `token`.
    ///
    /// Empty identity values are left out.
    pub fn headers(&self, token: &AuthToken) -> BTreeMap<String, String> {
        let mut headers = self.extra_headers.clone();
        for (name, value) in [
            ("X-App-Name", &self.app_name),
            ("X-App-Version", &self.app_version),
            ("X-Mode", &self.mode),
        ] {
            if !value.is_empty() {
                headers.insert(name.to_string(), value.clone());
            }
        }
        headers.insert("Authorization".to_string(), token.bearer());
        headers
    }
}

/// Everything needed to run one subscription client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub url: String,
    pub identity: ClientIdentity,
    pub subscription: SubscriptionRequest,
    pub reconnect: ReconnectConfig,
    pub keepalive: KeepaliveConfig,
    /// Subprotocol requested on the upgrade, `None` to request none.
    pub subprotocol: Option<String>,
}

impl ClientConfig {
    /// Creates a config with default identity, reconnect policy and subprotocol.
    pub fn new(url: impl Into<String>, subscription: SubscriptionRequest) -> Self {
        Self {
            url: url.into(),
            identity: ClientIdentity::default(),
            subscription,
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
            subprotocol: Some(GRAPHQL_WS_SUBPROTOCOL.to_string()),
        }
    }
}
