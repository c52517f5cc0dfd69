//! Integration tests for the driver layer.
//!
//! These tests build drivers through the public factory, point them at mock
//! provider servers and check behavior that spans modules: token refresh,
//! error classification and connection invalidation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{Duration, Utc};
use mailbridge::config::Settings;
use mailbridge::domain::{
    Address, Connection, ConnectionId, LabelChanges, OutgoingMessage, TokenUpdate,
};
use mailbridge::providers::{
    DriverConfig, DriverFactory, ErrorKind, ListParams, MailDriver, ProviderError,
};
use mailbridge::storage::{ConnectionStore, MemoryConnectionStore, StoreError};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const GMAIL_BASE: &str = "/gmail/v1/users/me";

// ============================================================================
// Fixtures
// ============================================================================

/// Memory store that counts deletions.
#[derive(Default)]
struct CountingStore {
    inner: MemoryConnectionStore,
    deletes: AtomicUsize,
}

impl CountingStore {
    fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionStore for CountingStore {
    async fn find(
        &self,
        user_id: &str,
        connection_id: &ConnectionId,
    ) -> Result<Option<Connection>, StoreError> {
        self.inner.find(user_id, connection_id).await
    }

    async fn update(
        &self,
        connection_id: &ConnectionId,
        tokens: &TokenUpdate,
    ) -> Result<(), StoreError> {
        self.inner.update(connection_id, tokens).await
    }

    async fn delete(&self, connection_id: &ConnectionId) -> Result<(), StoreError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(connection_id).await
    }
}

fn settings_for(server: &MockServer) -> Settings {
    let mut settings = Settings::default();
    settings.google.api_base = format!("{}{}", server.uri(), GMAIL_BASE);
    settings.google.token_url = format!("{}/google/token", server.uri());
    settings.google.userinfo_url = format!("{}/google/userinfo", server.uri());
    settings.google.revoke_url = Some(format!("{}/google/revoke", server.uri()));
    settings.microsoft.api_base = format!("{}/v1.0", server.uri());
    settings.microsoft.token_url = format!("{}/microsoft/token", server.uri());
    settings.microsoft.userinfo_url = format!("{}/v1.0/me", server.uri());
    settings
}

fn connection(provider: &str, access_token: &str, expires_in_secs: i64) -> Connection {
    Connection {
        id: ConnectionId::from(format!("conn-{}", provider)),
        user_id: "user-1".to_string(),
        provider_id: provider.to_string(),
        email: "me@example.com".to_string(),
        access_token: Some(access_token.to_string()),
        refresh_token: Some("refresh-1".to_string()),
        scope: String::new(),
        expires_at: Some(Utc::now() + Duration::seconds(expires_in_secs)),
    }
}

async fn build(
    server: &MockServer,
    store: Arc<CountingStore>,
    connection: Connection,
) -> Box<dyn MailDriver> {
    store.inner.insert(connection.clone()).await;
    let factory = DriverFactory::new(settings_for(server)).unwrap();
    factory
        .create(&connection.provider_id.clone(), DriverConfig::new(connection, store))
        .unwrap()
}

// ============================================================================
// Factory
// ============================================================================

#[test]
fn factory_rejects_unknown_provider() {
    let factory = DriverFactory::new(Settings::default()).unwrap();
    let config = DriverConfig::new(
        connection("imap", "token", 3600),
        Arc::new(MemoryConnectionStore::new()),
    );

    match factory.create("imap", config) {
        Err(ProviderError::UnsupportedProvider(id)) => assert_eq!(id, "imap"),
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("driver created for unknown provider"),
    }
}

// ============================================================================
// Token refresh
// ============================================================================

#[tokio::test]
async fn expired_token_is_refreshed_and_persisted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/google/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-token",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/labels", GMAIL_BASE)))
        .and(header("authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"labels": []})))
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(CountingStore::default());
    let conn = connection("google", "stale-token", -60);
    let id = conn.id.clone();
    let driver = build(&server, store.clone(), conn).await;

    driver.get_user_labels().await.unwrap();
    // The refreshed token is cached for the next call.
    driver.get_user_labels().await.unwrap();

    let stored = store.inner.get(&id).await.unwrap();
    assert_eq!(stored.access_token.as_deref(), Some("fresh-token"));
    assert!(stored.expires_at.unwrap() > Utc::now());
    assert_eq!(store.deletes(), 0);
}

#[tokio::test]
async fn failed_refresh_deletes_connection_without_api_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/microsoft/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "AADSTS70000: The refresh token has expired."
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(CountingStore::default());
    let driver = build(&server, store.clone(), connection("microsoft", "", 3600)).await;

    let err = driver
        .list(&ListParams::folder("inbox"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Fatal);
    assert!(matches!(err.source, ProviderError::Authentication(_)));
    assert_eq!(store.deletes(), 1);
    assert!(store.inner.is_empty().await);

    let api_calls = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path().starts_with("/v1.0"))
        .count();
    assert_eq!(api_calls, 0);
}

#[tokio::test]
async fn token_endpoint_outage_keeps_connection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/google/token"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(CountingStore::default());
    let driver = build(&server, store.clone(), connection("google", "stale-token", -60)).await;

    let err = driver
        .list(&ListParams::folder("inbox"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Transient);
    assert!(matches!(err.source, ProviderError::Api { status: 503, .. }));
    assert_eq!(store.deletes(), 0);
    assert_eq!(store.inner.len().await, 1);
}

#[tokio::test]
async fn unreachable_token_endpoint_keeps_connection() {
    let store = Arc::new(CountingStore::default());
    let conn = connection("google", "stale-token", -60);
    store.inner.insert(conn.clone()).await;

    let mut settings = Settings::default();
    settings.google.token_url = "http://127.0.0.1:9/token".to_string();
    let driver = DriverFactory::new(settings)
        .unwrap()
        .create("google", DriverConfig::new(conn, store.clone()))
        .unwrap();

    let err = driver
        .list(&ListParams::folder("inbox"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Transient);
    assert!(matches!(err.source, ProviderError::Connection(_)));
    assert_eq!(store.deletes(), 0);
}

// ============================================================================
// Invalidation
// ============================================================================

#[tokio::test]
async fn fatal_error_deletes_connection_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/threads", GMAIL_BASE)))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"code": 401, "message": "Invalid Credentials", "status": "UNAUTHENTICATED"}
        })))
        .mount(&server)
        .await;

    let store = Arc::new(CountingStore::default());
    let driver = build(&server, store.clone(), connection("google", "valid", 3600)).await;

    let err = driver
        .list(&ListParams::folder("inbox"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Fatal);
    assert_eq!(err.operation, "list");
    assert_eq!(store.deletes(), 1);
}

#[tokio::test]
async fn transient_errors_keep_connection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me/mailFolders/inbox/messages"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "5"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me/outlook/masterCategories"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = Arc::new(CountingStore::default());
    let driver = build(&server, store.clone(), connection("microsoft", "valid", 3600)).await;

    let limited = driver
        .list(&ListParams::folder("inbox"))
        .await
        .unwrap_err();
    assert_eq!(limited.kind, ErrorKind::Transient);
    assert!(matches!(
        limited.source,
        ProviderError::RateLimited {
            retry_after_secs: Some(5)
        }
    ));

    let unavailable = driver.get_user_labels().await.unwrap_err();
    assert_eq!(unavailable.kind, ErrorKind::Transient);

    assert_eq!(store.deletes(), 0);
    assert_eq!(store.inner.len().await, 1);
}

#[tokio::test]
async fn error_context_is_redacted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/google/token"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store = Arc::new(CountingStore::default());
    let driver = build(&server, store, connection("google", "valid", 3600)).await;

    let err = driver.get_tokens("secret-auth-code").await.unwrap_err();
    assert_eq!(err.context, json!({"code": "[REDACTED]"}));
    assert!(!err.to_string().contains("secret-auth-code"));
}

// ============================================================================
// Cross-provider behavior
// ============================================================================

#[tokio::test]
async fn both_drivers_skip_empty_id_lists_and_normalize_ids() {
    let server = MockServer::start().await;
    let ids = vec!["thread:abc".to_string(), "def".to_string()];

    for provider in ["google", "microsoft"] {
        let store = Arc::new(CountingStore::default());
        let driver = build(&server, store, connection(provider, "valid", 3600)).await;

        driver.mark_as_read(&[]).await.unwrap();
        driver.mark_as_unread(&[]).await.unwrap();
        driver
            .modify_labels(
                &[],
                &LabelChanges {
                    add_labels: vec!["Work".to_string()],
                    remove_labels: vec![],
                },
            )
            .await
            .unwrap();

        assert_eq!(driver.normalize_ids(&ids).unwrap(), vec!["abc", "def"]);
    }

    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn both_drivers_sanitize_outgoing_html() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/messages/send", GMAIL_BASE)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "g-1", "threadId": "t-1"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1.0/me/sendMail"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let message = OutgoingMessage {
        to: vec![Address::new("bob@example.com")],
        subject: "Update".to_string(),
        message: "<p onclick=\"evil()\">Numbers</p><script>evil()</script>".to_string(),
        ..OutgoingMessage::default()
    };

    for provider in ["google", "microsoft"] {
        let store = Arc::new(CountingStore::default());
        let driver = build(&server, store, connection(provider, "valid", 3600)).await;
        driver.create(&message).await.unwrap();
    }

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    for request in requests {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let payload = match body["raw"].as_str() {
            Some(raw) => String::from_utf8(BASE64_URL_SAFE_NO_PAD.decode(raw).unwrap()).unwrap(),
            None => body["message"]["body"]["content"].as_str().unwrap().to_string(),
        };
        assert!(payload.contains("Numbers"));
        assert!(!payload.contains("evil()"), "unsanitized payload: {}", payload);
    }
}

#[tokio::test]
async fn deleting_missing_items_succeeds_on_both_drivers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/messages/gone/trash", GMAIL_BASE)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1.0/me/messages/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    for provider in ["google", "microsoft"] {
        let store = Arc::new(CountingStore::default());
        let driver = build(&server, store.clone(), connection(provider, "valid", 3600)).await;
        driver.delete("gone").await.unwrap();
        assert_eq!(store.deletes(), 0);
    }
}
