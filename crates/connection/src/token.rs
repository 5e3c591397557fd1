//! Bearer token acquisition.
//!
//! The connection driver asks a [`TokenProvider`] for a token before every
//! fresh connection cycle. [`CachedTokenProvider`] keeps the token between
//! cycles and only goes back to the source after an explicit
//! [`invalidate`](TokenProvider::invalidate).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tracing::debug;

use crate::error::AuthError;

/// Opaque bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns `true` if the token is non-empty.
    pub fn is_present(&self) -> bool {
        !self.0.trim().is_empty()
    }

    /// Raw token value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `Authorization` header value for this token.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Future returned by [`TokenProvider::get_token`].
pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Result<AuthToken, AuthError>> + Send + 'a>>;

/// Supplies bearer tokens on demand. May perform network I/O.
pub trait TokenProvider: Send + Sync {
    /// Returns a token, fetching one if needed.
    fn get_token(&self) -> TokenFuture<'_>;

    /// Discards any cached token so the next call fetches a fresh one.
    fn invalidate(&self) {}
}

/// Caches the first valid token of an inner provider until invalidated.
pub struct CachedTokenProvider<P> {
    inner: P,
    cached: Mutex<Option<AuthToken>>,
}

impl<P: TokenProvider> CachedTokenProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cached: Mutex::new(None),
        }
    }

    /// Returns `true` if a token is currently cached.
    pub fn has_token(&self) -> bool {
        self.cached.lock().map(|c| c.is_some()).unwrap_or(false)
    }
}

impl<P: TokenProvider> TokenProvider for CachedTokenProvider<P> {
    fn get_token(&self) -> TokenFuture<'_> {
        Box::pin(async move {
            if let Some(token) = self.cached.lock().ok().and_then(|c| c.clone()) {
                return Ok(token);
            }

            let token = self.inner.get_token().await?;
            if !token.is_present() {
                return Err(AuthError::EmptyToken);
            }
            if let Ok(mut cached) = self.cached.lock() {
                *cached = Some(token.clone());
            }
            debug!("fetched and cached a new token");
            Ok(token)
        })
    }

    fn invalidate(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            if cached.take().is_some() {
                debug!("cached token invalidated");
            }
        }
        self.inner.invalidate();
    }
}
