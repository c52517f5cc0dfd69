//! Bearer-authenticated JSON client shared by the drivers.
//!
//! Fetches a token from the driver's [`TokenSupplier`] for every request and
//! turns non-success responses into [`ProviderError`]s, reading both the
//! Google/Graph `{"error": {...}}` shape and the OAuth
//! `{"error": "...", "error_description": "..."}` shape.

use std::sync::Arc;

use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::token::TokenSupplier;
use super::{ProviderError, Result};

/// Query parameters for a request.
pub type Query<'a> = [(&'a str, String)];

/// Request body.
enum Payload {
    Json(Value),
    Raw { content_type: String, body: String },
}

/// HTTP client for one provider API.
#[derive(Clone)]
pub struct ApiClient {
    base: String,
    http: reqwest::Client,
    tokens: Arc<dyn TokenSupplier>,
}

impl ApiClient {
    /// Creates a client for the API rooted at `base`.
    pub fn new(
        base: impl Into<String>,
        http: reqwest::Client,
        tokens: Arc<dyn TokenSupplier>,
    ) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            http,
            tokens,
        }
    }

    /// Returns the API base URL without a trailing slash.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Resolves a path against the base. Absolute URLs are used as given.
    fn url(&self, target: &str) -> String {
        if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            format!("{}{}", self.base, target)
        }
    }

    /// GETs a JSON document.
    pub async fn get_json<T: DeserializeOwned>(&self, target: &str, query: &Query<'_>) -> Result<T> {
        let response = self.execute(Method::GET, target, query, None).await?;
        Ok(response.json().await?)
    }

    /// Sends a JSON body and parses the JSON response.
    pub async fn send_json<T, B>(&self, method: Method, target: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = serde_json::to_value(body)
            .map_err(|e| ProviderError::Internal(format!("serialize request: {}", e)))?;
        let response = self
            .execute(method, target, &[], Some(Payload::Json(body)))
            .await?;
        Ok(response.json().await?)
    }

    /// Sends a request and discards the response body.
    pub async fn send_empty(&self, method: Method, target: &str, body: Option<Value>) -> Result<()> {
        self.execute(method, target, &[], body.map(Payload::Json)).await?;
        Ok(())
    }

    /// Sends a pre-encoded body and returns the response content type and text.
    pub async fn send_raw(
        &self,
        method: Method,
        target: &str,
        content_type: &str,
        body: String,
    ) -> Result<(String, String)> {
        let payload = Payload::Raw {
            content_type: content_type.to_string(),
            body,
        };
        let response = self.execute(method, target, &[], Some(payload)).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok((content_type, response.text().await?))
    }

    async fn execute(
        &self,
        method: Method,
        target: &str,
        query: &Query<'_>,
        body: Option<Payload>,
    ) -> Result<Response> {
        let token = self.tokens.access_token().await?;
        let url = self.url(target);
        tracing::debug!(method = %method, url = %url, "provider request");

        let mut request = self.http.request(method, &url).bearer_auth(token);
        if !query.is_empty() {
            request = request.query(query);
        }
        match body {
            Some(Payload::Json(body)) => request = request.json(&body),
            Some(Payload::Raw { content_type, body }) => {
                request = request.header(CONTENT_TYPE, content_type).body(body);
            }
            None => {}
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response).await)
        }
    }
}

/// Converts an error response into a [`ProviderError`].
pub async fn error_from_response(response: Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok());
    let body = response.text().await.unwrap_or_default();
    parse_error(status, retry_after, &body)
}

/// Builds a [`ProviderError`] from a status code and response body.
pub fn parse_error(status: u16, retry_after_secs: Option<u64>, body: &str) -> ProviderError {
    if status == 429 {
        return ProviderError::RateLimited { retry_after_secs };
    }

    let (code, message) = parse_error_body(body);
    let message = message.unwrap_or_else(|| {
        reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("request failed")
            .to_string()
    });

    ProviderError::Api {
        status,
        code,
        message,
    }
}

/// Extracts `(code, message)` from a provider error body.
pub fn parse_error_body(body: &str) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        let trimmed = body.trim();
        return (None, (!trimmed.is_empty()).then(|| trimmed.to_string()));
    };

    let as_string = |v: &Value| v.as_str().map(str::to_string);

    match value.get("error") {
        Some(Value::Object(error)) => {
            let code = error
                .get("code")
                .and_then(as_string)
                .or_else(|| error.get("status").and_then(as_string))
                .or_else(|| {
                    error
                        .get("errors")
                        .and_then(|e| e.get(0))
                        .and_then(|e| e.get("reason"))
                        .and_then(as_string)
                });
            (code, error.get("message").and_then(as_string))
        }
        Some(Value::String(code)) => {
            let message = value
                .get("error_description")
                .and_then(as_string)
                .unwrap_or_else(|| code.clone());
            (Some(code.clone()), Some(message))
        }
        _ => (None, value.get("message").and_then(as_string)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::token::StaticTokenSupplier;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ApiClient {
        ApiClient::new(
            format!("{}/v1/", server.uri()),
            reqwest::Client::new(),
            Arc::new(StaticTokenSupplier::new("token-1")),
        )
    }

    #[test]
    fn parses_google_error_shape() {
        let body = r#"{"error":{"code":401,"message":"Invalid Credentials","status":"UNAUTHENTICATED","errors":[{"reason":"authError"}]}}"#;
        let (code, message) = parse_error_body(body);
        assert_eq!(code.as_deref(), Some("UNAUTHENTICATED"));
        assert_eq!(message.as_deref(), Some("Invalid Credentials"));
    }

    #[test]
    fn parses_google_error_reason_without_status() {
        let body = r#"{"error":{"code":401,"message":"Login Required","errors":[{"reason":"authError"}]}}"#;
        let (code, _) = parse_error_body(body);
        assert_eq!(code.as_deref(), Some("authError"));
    }

    #[test]
    fn parses_graph_error_shape() {
        let body = r#"{"error":{"code":"InvalidAuthenticationToken","message":"Access token has expired."}}"#;
        let (code, message) = parse_error_body(body);
        assert_eq!(code.as_deref(), Some("InvalidAuthenticationToken"));
        assert_eq!(message.as_deref(), Some("Access token has expired."));
    }

    #[test]
    fn parses_oauth_error_shape() {
        let body = r#"{"error":"invalid_grant","error_description":"Bad Request"}"#;
        let (code, message) = parse_error_body(body);
        assert_eq!(code.as_deref(), Some("invalid_grant"));
        assert_eq!(message.as_deref(), Some("Bad Request"));
    }

    #[test]
    fn parse_error_falls_back_to_status_reason() {
        match parse_error(503, None, "") {
            ProviderError::Api {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 503);
                assert!(code.is_none());
                assert_eq!(message, "Service Unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_error_rate_limited() {
        assert!(matches!(
            parse_error(429, Some(30), "{}"),
            ProviderError::RateLimited {
                retry_after_secs: Some(30)
            }
        ));
    }

    #[tokio::test]
    async fn sends_bearer_token_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/items"))
            .and(header("authorization", "Bearer token-1"))
            .and(query_param("limit", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let value: Value = client(&server)
            .get_json("/items", &[("limit", "5".to_string())])
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn send_json_posts_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/items"))
            .and(body_json(serde_json::json!({"name": "x"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "1"})))
            .mount(&server)
            .await;

        let value: Value = client(&server)
            .send_json(Method::POST, "/items", &serde_json::json!({"name": "x"}))
            .await
            .unwrap();
        assert_eq!(value["id"], "1");
    }

    #[tokio::test]
    async fn rate_limit_reads_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/items/1"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
            .mount(&server)
            .await;

        let err = client(&server)
            .send_empty(Method::DELETE, "/items/1", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::RateLimited {
                retry_after_secs: Some(12)
            }
        ));
    }

    #[tokio::test]
    async fn absolute_urls_bypass_base() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/elsewhere"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/elsewhere", server.uri());
        let value: Value = client(&server).get_json(&url, &[]).await.unwrap();
        assert!(value.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn token_failure_skips_request() {
        let server = MockServer::start().await;
        let client = ApiClient::new(
            server.uri(),
            reqwest::Client::new(),
            Arc::new(StaticTokenSupplier::new("")),
        );

        let err = client.get_json::<Value>("/items", &[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Authentication(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
