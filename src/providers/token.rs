//! Access token suppliers.
//!
//! Drivers never read tokens off the connection directly. They ask a
//! [`TokenSupplier`] for a currently valid access token before each request:
//!
//! - [`RefreshingTokenSupplier`] refreshes short-lived tokens against the
//!   stored refresh token and writes the result back to the store
//! - [`DelegatedTokenSupplier`] defers to a session layer that already
//!   manages refresh
//! - [`StaticTokenSupplier`] hands out a fixed token
//!
//! A supplier either returns a non-empty token or fails. Credentials the
//! provider rejects surface as [`ProviderError::Authentication`]; an
//! unreachable or overloaded token endpoint keeps its own error so the
//! connection survives.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use super::oauth::OAuthClient;
use super::{ProviderError, Result};
use crate::domain::{Connection, ConnectionId, ProviderId, TokenUpdate};
use crate::storage::ConnectionStore;

/// Source of access tokens for provider requests.
#[async_trait]
pub trait TokenSupplier: Send + Sync {
    /// Returns a usable, non-empty access token.
    async fn access_token(&self) -> Result<String>;
}

/// Session layer that manages provider tokens on the host's behalf.
#[async_trait]
pub trait SessionTokenSource: Send + Sync {
    /// Returns the current access token for a provider, if the session has one.
    async fn session_token(&self, provider: ProviderId) -> Option<String>;
}

/// Supplier that always returns the same token.
#[derive(Clone)]
pub struct StaticTokenSupplier {
    token: String,
}

impl StaticTokenSupplier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSupplier for StaticTokenSupplier {
    async fn access_token(&self) -> Result<String> {
        if self.token.is_empty() {
            return Err(ProviderError::Authentication(
                "no access token available".to_string(),
            ));
        }
        Ok(self.token.clone())
    }
}

/// Supplier backed by a host session layer.
pub struct DelegatedTokenSupplier {
    provider: ProviderId,
    source: Arc<dyn SessionTokenSource>,
}

impl DelegatedTokenSupplier {
    pub fn new(provider: ProviderId, source: Arc<dyn SessionTokenSource>) -> Self {
        Self { provider, source }
    }
}

#[async_trait]
impl TokenSupplier for DelegatedTokenSupplier {
    async fn access_token(&self) -> Result<String> {
        match self.source.session_token(self.provider).await {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(ProviderError::Authentication(
                "Failed to get access token".to_string(),
            )),
        }
    }
}

/// Upper bound on the refresh skew.
const MAX_SKEW_SECS: u64 = 86_400;

/// Cached token fields of one connection.
struct TokenState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl TokenState {
    /// Returns the cached access token if it can be used without refreshing.
    fn usable(&self, now: DateTime<Utc>, skew: Duration) -> Option<String> {
        let token = self.access_token.as_ref().filter(|t| !t.is_empty())?;
        let fresh = match self.expires_at {
            Some(expires_at) => expires_at > now + skew,
            None => self.refresh_token.is_none(),
        };
        fresh.then(|| token.clone())
    }
}

/// Supplier that refreshes expired tokens with the connection's refresh token.
///
/// Makes at most one refresh attempt per call. Concurrent callers on the same
/// supplier wait for a single refresh.
pub struct RefreshingTokenSupplier {
    connection_id: ConnectionId,
    oauth: OAuthClient,
    store: Arc<dyn ConnectionStore>,
    skew: Duration,
    state: Mutex<TokenState>,
}

impl RefreshingTokenSupplier {
    /// Creates a supplier seeded with the connection's stored tokens.
    pub fn new(
        connection: &Connection,
        oauth: OAuthClient,
        store: Arc<dyn ConnectionStore>,
        skew_secs: u64,
    ) -> Self {
        Self {
            connection_id: connection.id.clone(),
            oauth,
            store,
            skew: Duration::seconds(skew_secs.min(MAX_SKEW_SECS) as i64),
            state: Mutex::new(TokenState {
                access_token: connection.access_token.clone(),
                refresh_token: connection.refresh_token.clone(),
                expires_at: connection.expires_at,
            }),
        }
    }
}

#[async_trait]
impl TokenSupplier for RefreshingTokenSupplier {
    async fn access_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.usable(Utc::now(), self.skew) {
            return Ok(token);
        }

        let refresh_token = state
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ProviderError::Authentication("no refresh token available".to_string())
            })?;

        let tokens = self
            .oauth
            .refresh(&refresh_token)
            .await
            .map_err(refresh_error)?;

        if tokens.access_token.is_empty() {
            return Err(ProviderError::Authentication(
                "token refresh returned an empty access token".to_string(),
            ));
        }

        let update = TokenUpdate {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            expires_at: tokens.expires_at,
        };
        if let Err(e) = self.store.update(&self.connection_id, &update).await {
            tracing::warn!(
                connection_id = %self.connection_id,
                error = %e,
                "failed to persist refreshed tokens"
            );
        }

        state.access_token = Some(tokens.access_token.clone());
        if tokens.refresh_token.is_some() {
            state.refresh_token = tokens.refresh_token;
        }
        state.expires_at = tokens.expires_at;

        tracing::info!(connection_id = %self.connection_id, "access token refreshed");
        Ok(tokens.access_token)
    }
}

/// Maps a failed refresh grant.
///
/// A client error from the token endpoint means the refresh token is no longer
/// accepted. Rate limits, server errors and transport failures are returned
/// unchanged so they classify as transient.
fn refresh_error(err: ProviderError) -> ProviderError {
    match err {
        ProviderError::Api { status, .. } if (400..500).contains(&status) && status != 429 => {
            ProviderError::Authentication(format!("token refresh failed: {}", err))
        }
        other => other,
    }
}
