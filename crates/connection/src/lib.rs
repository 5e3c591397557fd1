//! Subscription client for live telemetry.
//!
//! Authenticates through a [`TokenProvider`], keeps one WebSocket open,
//! performs the `connection_init`/`connection_ack` handshake, starts the
//! registered subscription and feeds data frames to a
//! [`TelemetryExtractor`](poolflow_telemetry::TelemetryExtractor).
//! Lost connections are re-established after a fixed delay with the same
//! subscription id.

mod driver;
pub mod error;
pub(crate) mod machine;
pub mod manager;
mod pumps;
pub mod subscription;
pub mod token;
pub mod types;
mod ws_client;

pub use error::{AuthError, ManagerError, TransportError};
pub use manager::ConnectionManager;
pub use subscription::{Routed, SubscriptionManager};
pub use token::{AuthToken, CachedTokenProvider, TokenFuture, TokenProvider};
pub use types::{
    ClientConfig, ClientIdentity, ConnectionEvent, ConnectionState, KeepaliveConfig,
    ReconnectConfig,
};
