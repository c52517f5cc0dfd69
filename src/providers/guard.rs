//! Error guard wrapped around every driver operation.
//!
//! On failure the guard classifies the error, logs it with a redacted copy of
//! the operation's inputs, deletes the connection when the failure is fatal and
//! returns a [`DriverError`].

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::classify::{classify, ErrorKind};
use super::{DriverError, DriverResult, ProviderError, Result};
use crate::domain::{ConnectionId, ProviderId};
use crate::storage::ConnectionStore;

/// Placeholder written over sensitive context values.
pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEYS: &[&str] = &[
    "token",
    "secret",
    "password",
    "authorization",
    "code",
    "auth",
];

/// Wraps driver operations for one connection.
#[derive(Clone)]
pub struct ErrorGuard {
    provider: ProviderId,
    connection_id: ConnectionId,
    store: Arc<dyn ConnectionStore>,
}

impl ErrorGuard {
    pub fn new(
        provider: ProviderId,
        connection_id: ConnectionId,
        store: Arc<dyn ConnectionStore>,
    ) -> Self {
        Self {
            provider,
            connection_id,
            store,
        }
    }

    /// Runs an async operation.
    ///
    /// A fatal failure deletes the connection before this returns.
    pub async fn run<T, F>(&self, operation: &str, context: Value, fut: F) -> DriverResult<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        match fut.await {
            Ok(value) => Ok(value),
            Err(err) => {
                let failure = self.report(operation, context, err);
                if failure.is_fatal() {
                    self.invalidate(operation).await;
                }
                Err(failure)
            }
        }
    }

    /// Runs a synchronous helper.
    ///
    /// Synchronous helpers perform no I/O, so a failure here is classified and
    /// logged but never deletes the connection.
    pub fn run_sync<T>(
        &self,
        operation: &str,
        context: Value,
        f: impl FnOnce() -> Result<T>,
    ) -> DriverResult<T> {
        f().map_err(|err| self.report(operation, context, err))
    }

    fn report(&self, operation: &str, context: Value, err: ProviderError) -> DriverError {
        let kind = classify(self.provider, &err);
        let context = redact(context);

        tracing::error!(
            provider = %self.provider,
            connection_id = %self.connection_id,
            operation,
            kind = ?kind,
            context = %context,
            error = %err,
            chain = %error_chain(&err),
            "driver operation failed"
        );

        DriverError {
            message: err.to_string(),
            operation: operation.to_string(),
            context,
            kind,
            source: err,
        }
    }

    async fn invalidate(&self, operation: &str) {
        match self.store.delete(&self.connection_id).await {
            Ok(()) => tracing::warn!(
                provider = %self.provider,
                connection_id = %self.connection_id,
                operation,
                "connection deleted after fatal error"
            ),
            Err(e) => tracing::error!(
                provider = %self.provider,
                connection_id = %self.connection_id,
                error = %e,
                "failed to delete connection after fatal error"
            ),
        }
    }
}

/// Formats an error and its sources as `outer: inner: ...`.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

/// Replaces the values of credential-like keys, recursively.
pub fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if is_sensitive(&key) {
                        (key, Value::String(REDACTED.to_string()))
                    } else {
                        (key, redact(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}

fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| key.contains(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MockConnectionStore, StoreError};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn guard(store: MockConnectionStore) -> ErrorGuard {
        ErrorGuard::new(
            ProviderId::Microsoft,
            ConnectionId::from("conn-1"),
            Arc::new(store),
        )
    }

    #[test]
    fn redact_nested_credentials() {
        let redacted = redact(json!({
            "id": "m-1",
            "accessToken": "secret-value",
            "nested": {"Authorization": "Bearer x", "folder": "inbox"},
            "items": [{"refresh_token": "r"}, {"name": "ok"}],
            "code": "auth-code"
        }));

        assert_eq!(
            redacted,
            json!({
                "id": "m-1",
                "accessToken": REDACTED,
                "nested": {"Authorization": REDACTED, "folder": "inbox"},
                "items": [{"refresh_token": REDACTED}, {"name": "ok"}],
                "code": REDACTED
            })
        );
    }

    #[tokio::test]
    async fn success_passes_through() {
        let result = guard(MockConnectionStore::new())
            .run("list", json!({}), async { Ok::<_, ProviderError>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn fatal_error_deletes_connection_once() {
        let mut store = MockConnectionStore::new();
        store
            .expect_delete()
            .withf(|id| id.0 == "conn-1")
            .times(1)
            .returning(|_| Ok(()));

        let err = guard(store)
            .run("get", json!({"id": "m-1", "token": "t"}), async {
                Err::<(), _>(ProviderError::Api {
                    status: 401,
                    code: Some("InvalidAuthenticationToken".to_string()),
                    message: "Access token has expired.".to_string(),
                })
            })
            .await
            .unwrap_err();

        assert_eq!(err.operation, "get");
        assert_eq!(err.kind, ErrorKind::Fatal);
        assert_eq!(err.context, json!({"id": "m-1", "token": REDACTED}));
        assert_eq!(err.message, "provider returned 401: Access token has expired.");
    }

    #[tokio::test]
    async fn transient_errors_never_delete() {
        let failures = [
            ProviderError::RateLimited {
                retry_after_secs: None,
            },
            ProviderError::Api {
                status: 503,
                code: None,
                message: "unavailable".to_string(),
            },
            ProviderError::Connection("reset".to_string()),
        ];

        for failure in failures {
            let mut store = MockConnectionStore::new();
            store.expect_delete().times(0);

            let err = guard(store)
                .run("count", json!({}), async { Err::<(), _>(failure) })
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::Transient);
        }
    }

    #[tokio::test]
    async fn delete_failure_keeps_original_error() {
        let mut store = MockConnectionStore::new();
        store
            .expect_delete()
            .times(1)
            .returning(|_| Err(StoreError::Backend("db down".to_string())));

        let err = guard(store)
            .run("create", json!({}), async {
                Err::<(), _>(ProviderError::Authentication("refresh failed".to_string()))
            })
            .await
            .unwrap_err();

        assert_eq!(err.message, "authentication failed: refresh failed");
        assert!(matches!(err.source, ProviderError::Authentication(_)));
    }

    #[test]
    fn run_sync_classifies_without_deleting() {
        let mut store = MockConnectionStore::new();
        store.expect_delete().times(0);

        let err = guard(store)
            .run_sync("normalize_ids", json!({"ids": []}), || {
                Err::<(), _>(ProviderError::InvalidRequest("bad id".to_string()))
            })
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Invalid);
        assert_eq!(err.operation, "normalize_ids");
    }

    #[test]
    fn error_chain_includes_sources() {
        let err = DriverError {
            message: "x".to_string(),
            operation: "list".to_string(),
            context: json!({}),
            kind: ErrorKind::Transient,
            source: ProviderError::Connection("reset".to_string()),
        };
        assert_eq!(
            error_chain(&err),
            "list failed: x: connection error: reset"
        );
    }
}
