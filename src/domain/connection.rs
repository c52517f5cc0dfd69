//! Stored provider connection.
//!
//! A connection is owned by the host's connection store. Drivers read it,
//! write refreshed tokens back, and ask for it to be deleted when its
//! credentials turn out to be unusable.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ConnectionId;

/// Credentials for one (user, provider, account) triple.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: String,
    /// Provider identifier, e.g. `google`.
    pub provider_id: String,
    /// Account address the connection was authorized for.
    pub email: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Space-joined granted scope.
    pub scope: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("provider_id", &self.provider_id)
            .field("email", &self.email)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token fields written back to the store after a refresh.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUpdate {
    pub access_token: String,
    /// Replacement refresh token, when the provider rotated it.
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for TokenUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenUpdate")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Connection {
    /// Applies refreshed tokens to this connection.
    pub fn apply(&mut self, update: &TokenUpdate) {
        self.access_token = Some(update.access_token.clone());
        if let Some(refresh_token) = &update.refresh_token {
            self.refresh_token = Some(refresh_token.clone());
        }
        self.expires_at = update.expires_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection() -> Connection {
        Connection {
            id: ConnectionId::from("conn-1"),
            user_id: "user-1".to_string(),
            provider_id: "google".to_string(),
            email: "user@example.com".to_string(),
            access_token: Some("access-secret".to_string()),
            refresh_token: Some("refresh-secret".to_string()),
            scope: "https://mail.google.com/".to_string(),
            expires_at: None,
        }
    }

    #[test]
    fn debug_redacts_tokens() {
        let debug = format!("{:?}", make_connection());
        assert!(!debug.contains("access-secret"));
        assert!(!debug.contains("refresh-secret"));
        assert!(debug.contains("conn-1"));
    }

    #[test]
    fn apply_keeps_refresh_token_when_not_rotated() {
        let mut connection = make_connection();
        let expires_at = Utc::now();
        connection.apply(&TokenUpdate {
            access_token: "new-access".to_string(),
            refresh_token: None,
            expires_at: Some(expires_at),
        });

        assert_eq!(connection.access_token.as_deref(), Some("new-access"));
        assert_eq!(connection.refresh_token.as_deref(), Some("refresh-secret"));
        assert_eq!(connection.expires_at, Some(expires_at));
    }

    #[test]
    fn apply_replaces_rotated_refresh_token() {
        let mut connection = make_connection();
        connection.apply(&TokenUpdate {
            access_token: "new-access".to_string(),
            refresh_token: Some("rotated".to_string()),
            expires_at: None,
        });

        assert_eq!(connection.refresh_token.as_deref(), Some("rotated"));
    }
}
