//! Mail driver trait definition.
//!
//! This module defines the [`MailDriver`] trait which abstracts over the
//! supported mail backends (Gmail REST, Microsoft Graph). Every driver accepts
//! and returns the canonical types from [`crate::domain`] so callers never see
//! a vendor schema.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::classify::ErrorKind;
use crate::domain::{
    Draft, DraftInput, DraftPage, DraftReceipt, EmailAlias, FolderCount, Label, LabelChanges,
    LabelInput, OAuthTokens, OutgoingMessage, ProviderId, SendReceipt, ThreadDetail,
    ThreadPage, UserInfo,
};

/// Result type alias for raw provider calls.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Result type alias for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Errors raised by a single provider call, before classification.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider answered with an error status.
    #[error("provider returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Structured error code from the response body, if any.
        code: Option<String>,
        /// Human readable error message.
        message: String,
    },

    /// Authentication failed or credentials expired.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Network or connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        /// Seconds to wait before retrying, if known.
        retry_after_secs: Option<u64>,
    },

    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Provider identifier outside the supported set.
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Returns the HTTP status associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::NotFound(_) => Some(404),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Returns true when the provider reported the resource as missing.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Internal(format!("parse response: {}", err))
        } else {
            Self::Connection(err.to_string())
        }
    }
}

/// A classified failure of one driver operation.
///
/// Carries the operation name and a redacted copy of its inputs so the host
/// can log or report it without re-deriving context.
#[derive(Debug, thiserror::Error)]
#[error("{operation} failed: {message}")]
pub struct DriverError {
    /// Message of the underlying provider error.
    pub message: String,
    /// Canonical operation name, e.g. `list` or `modify_labels`.
    pub operation: String,
    /// Redacted operation inputs.
    pub context: serde_json::Value,
    /// Classification of the failure.
    pub kind: ErrorKind,
    /// The raw provider error.
    #[source]
    pub source: ProviderError,
}

impl DriverError {
    /// Returns true when the failure invalidated the connection.
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }
}

/// Parameters for listing threads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    /// Canonical folder token or a native folder/label id.
    pub folder: String,
    /// Provider search query.
    pub query: Option<String>,
    /// Maximum number of threads to return.
    pub max_results: Option<u32>,
    /// Restrict results to these labels.
    #[serde(default)]
    pub label_ids: Vec<String>,
    /// Opaque cursor from a previous page.
    pub page_token: Option<String>,
}

impl ListParams {
    /// Creates parameters for the first page of a folder.
    pub fn folder(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            ..Self::default()
        }
    }

    /// Sets the page size.
    pub fn with_limit(mut self, max_results: u32) -> Self {
        self.max_results = Some(max_results);
        self
    }

    /// Continues from a token returned with a previous page.
    pub fn with_page_token(mut self, token: impl Into<String>) -> Self {
        self.page_token = Some(token.into());
        self
    }
}

/// Parameters for listing drafts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftListParams {
    pub query: Option<String>,
    pub max_results: Option<u32>,
    pub page_token: Option<String>,
}

/// Trait for mail driver implementations.
///
/// One driver instance serves one connection for the lifetime of one request.
/// Every provider-facing operation is wrapped by the driver's error guard, so a
/// credential-invalidating failure deletes the stored connection before the
/// error reaches the caller.
///
/// # Example
///
/// ```ignore
/// use mailbridge::providers::{ListParams, MailDriver};
///
/// async fn print_inbox(driver: &dyn MailDriver) -> DriverResult<()> {
///     let page = driver.list(&ListParams::folder("inbox").with_limit(20)).await?;
///     for thread in page.threads {
///         println!("{}: {}", thread.sender.email, thread.subject);
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait MailDriver: Send + Sync {
    /// Returns the provider this driver talks to.
    fn provider(&self) -> ProviderId;

    /// Lists threads in a folder, newest first as the provider orders them.
    ///
    /// Never returns more than `max_results` threads.
    async fn list(&self, params: &ListParams) -> DriverResult<ThreadPage>;

    /// Fetches a full conversation with decoded bodies and attachments.
    async fn get(&self, id: &str) -> DriverResult<ThreadDetail>;

    /// Sends a message and keeps a copy in Sent.
    async fn create(&self, message: &OutgoingMessage) -> DriverResult<SendReceipt>;

    /// Deletes a message or thread. Deleting a missing item succeeds.
    async fn delete(&self, id: &str) -> DriverResult<()>;

    /// Marks threads as read. An empty list issues no requests.
    async fn mark_as_read(&self, ids: &[String]) -> DriverResult<()>;

    /// Marks threads as unread. An empty list issues no requests.
    async fn mark_as_unread(&self, ids: &[String]) -> DriverResult<()>;

    /// Adds and removes labels on threads. An empty list issues no requests.
    async fn modify_labels(&self, ids: &[String], changes: &LabelChanges) -> DriverResult<()>;

    /// Strips the `thread:` prefix from ids.
    ///
    /// Runs through [`ErrorGuard::run_sync`](super::ErrorGuard::run_sync),
    /// which cannot await the store: an error returned here is classified and
    /// logged but never deletes the connection. Implementations must stay pure
    /// and leave anything that can fail on credentials to the async operations.
    fn normalize_ids(&self, ids: &[String]) -> DriverResult<Vec<String>>;

    /// Returns unread counts for the canonical folders that exist.
    async fn count(&self) -> DriverResult<Vec<FolderCount>>;

    /// Returns the authenticated user's profile.
    async fn get_user_info(&self) -> DriverResult<UserInfo>;

    /// Exchanges an OAuth authorization code for tokens.
    async fn get_tokens(&self, code: &str) -> DriverResult<OAuthTokens>;

    /// Returns the OAuth scopes this driver needs, space separated.
    fn get_scope(&self) -> String;

    async fn get_user_labels(&self) -> DriverResult<Vec<Label>>;

    async fn get_label(&self, id: &str) -> DriverResult<Label>;

    async fn create_label(&self, label: &LabelInput) -> DriverResult<Label>;

    async fn update_label(&self, id: &str, label: &LabelInput) -> DriverResult<Label>;

    async fn delete_label(&self, id: &str) -> DriverResult<()>;

    async fn list_drafts(&self, params: &DraftListParams) -> DriverResult<DraftPage>;

    async fn get_draft(&self, id: &str) -> DriverResult<Draft>;

    /// Creates a draft, or updates it in place when `draft.id` is set.
    async fn create_draft(&self, draft: &DraftInput) -> DriverResult<DraftReceipt>;

    /// Sends an existing draft with its latest content.
    async fn send_draft(&self, id: &str, message: &OutgoingMessage) -> DriverResult<SendReceipt>;

    /// Returns decoded attachment bytes.
    async fn get_attachment(&self, message_id: &str, attachment_id: &str)
        -> DriverResult<Vec<u8>>;

    /// Revokes a refresh token. Returns false when the provider has no
    /// revocation endpoint.
    async fn revoke_refresh_token(&self, token: &str) -> DriverResult<bool>;

    /// Returns the addresses the account can send as.
    async fn get_email_aliases(&self) -> DriverResult<Vec<EmailAlias>>;
}

/// Prefix some callers put on thread ids.
pub const THREAD_PREFIX: &str = "thread:";

/// Strips [`THREAD_PREFIX`] from each id.
pub fn strip_thread_prefix(ids: &[String]) -> Vec<String> {
    ids.iter()
        .map(|id| id.strip_prefix(THREAD_PREFIX).unwrap_or(id).to_string())
        .collect()
}

/// Caps a provider page at `max` items.
///
/// Providers are asked for at most `max` items, so a longer page means the
/// limit was ignored. The page token already points past the extras, so they
/// would never be listed; they are dropped with a warning.
pub(crate) fn cap_page<T>(items: &mut Vec<T>, max: Option<u32>) {
    let Some(max) = max.map(|m| m as usize) else {
        return;
    };
    if items.len() > max {
        tracing::warn!(
            returned = items.len(),
            max,
            "provider ignored the page size, dropping extra items"
        );
        items.truncate(max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_page_trims_only_overlong_pages() {
        let mut items = vec![1, 2, 3];
        cap_page(&mut items, Some(2));
        assert_eq!(items, vec![1, 2]);

        cap_page(&mut items, Some(5));
        assert_eq!(items, vec![1, 2]);

        cap_page(&mut items, None);
        assert_eq!(items, vec![1, 2]);
    }

    #[test]
    fn list_params_page_token() {
        let params = ListParams::folder("inbox").with_page_token("p2");
        assert_eq!(params.page_token.as_deref(), Some("p2"));
    }

    #[test]
    fn strip_thread_prefix_handles_both_forms() {
        let ids = vec!["thread:abc123".to_string(), "abc123".to_string()];
        assert_eq!(strip_thread_prefix(&ids), vec!["abc123", "abc123"]);
        assert!(strip_thread_prefix(&[]).is_empty());
    }

    #[test]
    fn list_params_builder() {
        let params = ListParams::folder("inbox").with_limit(25);
        assert_eq!(params.folder, "inbox");
        assert_eq!(params.max_results, Some(25));
        assert!(params.page_token.is_none());
        assert!(params.label_ids.is_empty());
    }

    #[test]
    fn list_params_deserialize_camel_case() {
        let params: ListParams =
            serde_json::from_str(r#"{"folder":"sent","maxResults":5,"pageToken":"p2"}"#).unwrap();
        assert_eq!(params.max_results, Some(5));
        assert_eq!(params.page_token.as_deref(), Some("p2"));
        assert!(params.query.is_none());
    }

    #[test]
    fn provider_error_display() {
        let auth_err = ProviderError::Authentication("token expired".to_string());
        assert_eq!(auth_err.to_string(), "authentication failed: token expired");

        let rate_err = ProviderError::RateLimited {
            retry_after_secs: Some(60),
        };
        assert!(rate_err.to_string().contains("rate limit"));

        let api_err = ProviderError::Api {
            status: 403,
            code: Some("forbidden".to_string()),
            message: "Forbidden".to_string(),
        };
        assert_eq!(api_err.to_string(), "provider returned 403: Forbidden");
    }

    #[test]
    fn provider_error_status() {
        assert_eq!(ProviderError::NotFound("x".into()).status(), Some(404));
        assert!(ProviderError::Api {
            status: 404,
            code: None,
            message: String::new(),
        }
        .is_not_found());
        assert!(!ProviderError::Connection("reset".into()).is_not_found());
    }

    #[test]
    fn driver_error_display_and_source() {
        use std::error::Error;

        let err = DriverError {
            message: "connection error: reset".to_string(),
            operation: "list".to_string(),
            context: serde_json::json!({}),
            kind: ErrorKind::Transient,
            source: ProviderError::Connection("reset".to_string()),
        };

        assert_eq!(err.to_string(), "list failed: connection error: reset");
        assert!(err.source().is_some());
        assert!(!err.is_fatal());
    }
}
