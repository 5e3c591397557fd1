//! Login endpoint client.
//!
//! POSTs `{"email", "password", "cloud"}` and reads `token` from the JSON
//! response. There is no fallback credential: missing credentials or a
//! failed login surface as an error.

use std::collections::BTreeMap;
use std::fmt;

use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use poolflow_connection::{AuthError, AuthToken, TokenFuture, TokenProvider};

/// Errors from the login client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("login response carried no token")]
    MissingToken,

    #[error("invalid header {0}")]
    InvalidHeader(String),
}

/// Account credentials sent to the login endpoint.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    /// Cloud (tenant) identifier.
    pub cloud: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("cloud", &self.cloud)
            .finish()
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    user: Option<LoginUser>,
}

#[derive(Deserialize)]
struct LoginUser {
    id: String,
}

/// Exchanges credentials for bearer tokens.
pub struct LoginClient {
    http: reqwest::Client,
    login_url: String,
    credentials: Credentials,
}

impl LoginClient {
    /// Creates a client sending `headers` (client identity) with every
    /// login request.
    pub fn new(
        login_url: impl Into<String>,
        credentials: Credentials,
        headers: &BTreeMap<String, String>,
    ) -> Result<Self, Error> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidHeader(name.clone()))?;
            let header_value =
                HeaderValue::from_str(value).map_err(|_| Error::InvalidHeader(name.clone()))?;
            default_headers.insert(header_name, header_value);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()?;

        Ok(Self {
            http,
            login_url: login_url.into(),
            credentials,
        })
    }

    /// Logs in and returns a fresh token.
    pub async fn login(&self) -> Result<AuthToken, Error> {
        debug!(url = %self.login_url, email = %self.credentials.email, "logging in");
        let resp = self
            .http
            .post(&self.login_url)
            .json(&self.credentials)
            .send()
            .await?;
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "login rejected");
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.bytes().await?;
        let login: LoginResponse = serde_json::from_slice(&body)?;
        let token = login
            .token
            .filter(|t| !t.trim().is_empty())
            .ok_or(Error::MissingToken)?;

        match login.user {
            Some(user) => info!(user = %user.id, "login succeeded"),
            None => info!("login succeeded"),
        }
        Ok(AuthToken::new(token))
    }
}

impl TokenProvider for LoginClient {
    fn get_token(&self) -> TokenFuture<'_> {
        Box::pin(async move {
            self.login()
                .await
                .map_err(|e| AuthError::Provider(e.to_string()))
        })
    }
}
