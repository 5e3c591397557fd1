//! Monitor configuration.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/poolflow/monitor.toml`
//! - Windows: `%APPDATA%/poolflow/monitor.toml`
//!
//! `POOLFLOW_CONFIG` overrides the path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use poolflow_cloud_auth::Credentials;
use poolflow_connection::{ClientConfig, ClientIdentity, KeepaliveConfig, ReconnectConfig};
use poolflow_protocol::SubscriptionRequest;
use poolflow_protocol::constants::{GRAPHQL_WS_SUBPROTOCOL, WS_PING_PERIOD, WS_READ_TIMEOUT};
use poolflow_telemetry::MeasurementPath;

const DEFAULT_QUERY: &str = "subscription UnitUpdates($unitId: String!) {
  unit(id: $unitId) {
    id
    measurements {
      ph
      rx
      cl
      temperature
      waterflow
    }
  }
}";

/// Monitor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub subscription: SubscriptionSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSection {
    /// WebSocket endpoint of the subscription server.
    #[serde(default = "default_ws_url")]
    pub url: String,

    /// Seconds between a lost connection and the next attempt.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Seconds between keepalive pings.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds of silence after which the connection is dropped.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Subprotocol requested on upgrade. Empty requests none.
    #[serde(default = "default_subprotocol")]
    pub subprotocol: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    /// Cloud id, also sent as the `X-Cloud` header.
    #[serde(default)]
    pub cloud: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_app_version")]
    pub app_version: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSection {
    #[serde(default = "default_subscription_id")]
    pub id: String,
    #[serde(default)]
    pub unit_id: String,
    #[serde(default = "default_query")]
    pub query: String,
    #[serde(default = "default_entity")]
    pub entity: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_field")]
    pub field: String,
}

fn default_ws_url() -> String {
    "wss://graphql.acs.prod.aseko.cloud/graphql".into()
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_ping_interval() -> u64 {
    WS_PING_PERIOD.as_secs()
}

fn default_read_timeout() -> u64 {
    WS_READ_TIMEOUT.as_secs()
}

fn default_subprotocol() -> String {
    GRAPHQL_WS_SUBPROTOCOL.into()
}

fn default_login_url() -> String {
    "https://auth.aseko.acs.aseko.cloud/auth/login".into()
}

fn default_app_name() -> String {
    "pool-live".into()
}

fn default_app_version() -> String {
    "4.2.0".into()
}

fn default_mode() -> String {
    "production".into()
}

fn default_subscription_id() -> String {
    "1".into()
}

fn default_query() -> String {
    DEFAULT_QUERY.into()
}

fn default_entity() -> String {
    "unit".into()
}

fn default_group() -> String {
    "measurements".into()
}

fn default_field() -> String {
    "waterflow".into()
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            url: default_ws_url(),
            reconnect_delay_secs: default_reconnect_delay(),
            ping_interval_secs: default_ping_interval(),
            read_timeout_secs: default_read_timeout(),
            subprotocol: default_subprotocol(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            app_version: default_app_version(),
            mode: default_mode(),
            extra_headers: BTreeMap::new(),
        }
    }
}

impl Default for SubscriptionSection {
    fn default() -> Self {
        Self {
            id: default_subscription_id(),
            unit_id: String::new(),
            query: default_query(),
            entity: default_entity(),
            group: default_group(),
            field: default_field(),
        }
    }
}

impl MonitorConfig {
    /// Loads and validates the configuration file.
    ///
    /// Unlike most settings, credentials have no default: a missing file or
    /// missing credentials is an error.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: MonitorConfig = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.auth.email.trim().is_empty() || self.auth.password.is_empty() {
            bail!("auth.email and auth.password must be set");
        }
        if self.subscription.unit_id.trim().is_empty() {
            bail!("subscription.unit_id must be set");
        }
        if !(self.connection.url.starts_with("ws://") || self.connection.url.starts_with("wss://")) {
            bail!("connection.url must be a ws:// or wss:// URL");
        }
        let connection = &self.connection;
        if connection.reconnect_delay_secs == 0 {
            bail!("connection.reconnect_delay_secs must be at least 1");
        }
        if connection.ping_interval_secs == 0
            || connection.read_timeout_secs <= connection.ping_interval_secs
        {
            bail!("connection.read_timeout_secs must exceed a non-zero ping_interval_secs");
        }
        Ok(())
    }

    /// Static identity sent on login and on every connection.
    pub fn identity(&self) -> ClientIdentity {
        let mut extra_headers = self.client.extra_headers.clone();
        if !self.auth.cloud.is_empty() {
            extra_headers.insert("X-Cloud".into(), self.auth.cloud.clone());
        }
        ClientIdentity {
            app_name: self.client.app_name.clone(),
            app_version: self.client.app_version.clone(),
            mode: self.client.mode.clone(),
            extra_headers,
        }
    }

    /// Identity headers without `Authorization`, for the login request.
    pub fn login_headers(&self) -> BTreeMap<String, String> {
        let identity = self.identity();
        let mut headers = identity.extra_headers;
        headers.insert("X-App-Name".into(), identity.app_name);
        headers.insert("X-App-Version".into(), identity.app_version);
        headers.insert("X-Mode".into(), identity.mode);
        headers.retain(|_, v| !v.is_empty());
        headers
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            email: self.auth.email.clone(),
            password: self.auth.password.clone(),
            cloud: self.auth.cloud.clone(),
        }
    }

    pub fn measurement_path(&self) -> MeasurementPath {
        MeasurementPath {
            entity: self.subscription.entity.clone(),
            group: self.subscription.group.clone(),
            field: self.subscription.field.clone(),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        let request = SubscriptionRequest::new(&self.subscription.id, &self.subscription.query)
            .with_variable("unitId", self.subscription.unit_id.clone());
        let mut config = ClientConfig::new(&self.connection.url, request);
        config.identity = self.identity();
        config.reconnect = ReconnectConfig {
            delay: Duration::from_secs(self.connection.reconnect_delay_secs),
        };
        config.keepalive = KeepaliveConfig {
            ping_interval: Duration::from_secs(self.connection.ping_interval_secs),
            read_timeout: Duration::from_secs(self.connection.read_timeout_secs),
        };
        config.subprotocol =
            Some(self.connection.subprotocol.clone()).filter(|p| !p.is_empty());
        config
    }
}

/// Returns the configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("POOLFLOW_CONFIG") {
        return Ok(PathBuf::from(path));
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("poolflow").join("monitor.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(PathBuf::from(home)
            .join(".config")
            .join("poolflow")
            .join("monitor.toml"))
    }
}
