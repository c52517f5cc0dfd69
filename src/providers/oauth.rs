//! OAuth 2.0 grant flows.
//!
//! Wraps an [`oauth2::basic::BasicClient`] configured from [`ProviderSettings`]
//! for the authorization-code exchange and the refresh-token grant, and posts
//! revocation requests for providers that offer them. Grants go through the
//! driver's shared `reqwest::Client`, so the configured timeout and user agent
//! apply to token calls too.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use oauth2::basic::{BasicClient, BasicErrorResponse, BasicTokenResponse};
use oauth2::http::header::{HeaderMap, HeaderName, HeaderValue};
use oauth2::http::StatusCode;
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, HttpRequest, HttpResponse,
    RedirectUrl, RefreshToken, RequestTokenError, TokenResponse, TokenUrl,
};

use super::http::error_from_response;
use super::{ProviderError, Result};
use crate::config::ProviderSettings;
use crate::domain::{OAuthTokens, ProviderId};

/// OAuth client for one provider.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    provider: ProviderId,
    client: BasicClient,
    http: reqwest::Client,
    revoke_url: Option<String>,
}

impl OAuthClient {
    /// Builds a client from provider settings.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidRequest`] if a configured URL is malformed.
    pub fn new(
        provider: ProviderId,
        settings: &ProviderSettings,
        http: reqwest::Client,
    ) -> Result<Self> {
        let auth_url = AuthUrl::new(settings.auth_url.clone())
            .map_err(|e| ProviderError::InvalidRequest(format!("invalid auth url: {}", e)))?;
        let token_url = TokenUrl::new(settings.token_url.clone())
            .map_err(|e| ProviderError::InvalidRequest(format!("invalid token url: {}", e)))?;

        let mut client = BasicClient::new(
            ClientId::new(settings.client_id.clone()),
            Some(ClientSecret::new(settings.client_secret.clone())),
            auth_url,
            Some(token_url),
        )
        .set_auth_type(AuthType::RequestBody);

        if let Some(uri) = &settings.redirect_uri {
            let redirect = RedirectUrl::new(uri.clone()).map_err(|e| {
                ProviderError::InvalidRequest(format!("invalid redirect uri: {}", e))
            })?;
            client = client.set_redirect_uri(redirect);
        }

        Ok(Self {
            provider,
            client,
            http,
            revoke_url: settings.revoke_url.clone(),
        })
    }

    /// Exchanges an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str) -> Result<OAuthTokens> {
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(self.transport())
            .await
            .map_err(token_error)?;

        tracing::info!(provider = %self.provider, "authorization code exchanged");
        Ok(to_tokens(&response))
    }

    /// Runs the refresh-token grant once.
    pub async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens> {
        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(self.transport())
            .await
            .map_err(token_error)?;

        Ok(to_tokens(&response))
    }

    /// HTTP function for oauth2 requests, bound to the shared client.
    fn transport(
        &self,
    ) -> impl FnOnce(HttpRequest) -> BoxFuture<'static, std::result::Result<HttpResponse, GrantError>>
    {
        let http = self.http.clone();
        move |request| send_grant(http, request).boxed()
    }

    /// Revokes a token at the provider's revocation endpoint.
    ///
    /// Returns `false` when the provider has no endpoint or rejects the token.
    pub async fn revoke(&self, token: &str) -> Result<bool> {
        let Some(url) = &self.revoke_url else {
            tracing::warn!(provider = %self.provider, "token revocation not supported");
            return Ok(false);
        };

        let response = self
            .http
            .post(url)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        let revoked = response.status().is_success();
        if !revoked {
            tracing::warn!(
                provider = %self.provider,
                status = response.status().as_u16(),
                "token revocation rejected"
            );
        }
        Ok(revoked)
    }
}

fn to_tokens(response: &BasicTokenResponse) -> OAuthTokens {
    let expires_at = response
        .expires_in()
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| Utc::now() + d);

    let scope = response.scopes().map(|scopes| {
        scopes
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    });

    OAuthTokens {
        access_token: response.access_token().secret().clone(),
        refresh_token: response.refresh_token().map(|t| t.secret().clone()),
        expires_at,
        scope,
    }
}

/// Failure of a token endpoint call.
#[derive(Debug, thiserror::Error)]
enum GrantError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unsupported method {0}")]
    Method(String),
    /// The endpoint answered with something other than 200.
    #[error(transparent)]
    Rejected(ProviderError),
}

/// Sends an oauth2 request on the shared client.
///
/// Any reply other than 200 is turned into a [`ProviderError`] here, keeping
/// its real status, instead of being left to oauth2's error-body parsing.
async fn send_grant(
    http: reqwest::Client,
    request: HttpRequest,
) -> std::result::Result<HttpResponse, GrantError> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
        .map_err(|_| GrantError::Method(request.method.to_string()))?;

    let mut builder = http.request(method, request.url.as_str());
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    let response = builder.body(request.body).send().await?;
    if response.status() != reqwest::StatusCode::OK {
        return Err(GrantError::Rejected(error_from_response(response).await));
    }

    let mut headers = HeaderMap::new();
    for (name, value) in response.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    let body = response.bytes().await?.to_vec();

    Ok(HttpResponse {
        status_code: StatusCode::OK,
        headers,
        body,
    })
}

fn token_error(err: RequestTokenError<GrantError, BasicErrorResponse>) -> ProviderError {
    match err {
        RequestTokenError::Request(GrantError::Rejected(e)) => e,
        RequestTokenError::Request(e) => ProviderError::Connection(e.to_string()),
        // Only reachable for an error body on a 200 reply.
        RequestTokenError::ServerResponse(response) => {
            let code = response.error().to_string();
            let message = response
                .error_description()
                .cloned()
                .unwrap_or_else(|| code.clone());
            ProviderError::Api {
                status: StatusCode::OK.as_u16(),
                code: Some(code),
                message,
            }
        }
        RequestTokenError::Parse(e, _) => {
            ProviderError::Internal(format!("parse token response: {}", e))
        }
        RequestTokenError::Other(message) => ProviderError::Internal(message),
    }
}
