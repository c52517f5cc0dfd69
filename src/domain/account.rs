//! Account domain types.
//!
//! Identifies mail providers and describes the account-level data a driver
//! returns (profile, tokens, folder counts, aliases).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported mail provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// Google Gmail REST API.
    Google,
    /// Microsoft Graph (Outlook / Exchange Online).
    Microsoft,
}

impl ProviderId {
    /// Returns the identifier used in stored connections and driver lookups.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Microsoft => "microsoft",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(Self::Google),
            "microsoft" => Ok(Self::Microsoft),
            other => Err(other.to_string()),
        }
    }
}

/// Profile of the account a connection belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Primary email address.
    pub address: String,
    /// Display name.
    pub name: String,
    /// Profile photo URL, empty when the provider exposes none.
    pub photo: String,
}

/// Tokens obtained from an OAuth grant.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

impl fmt::Debug for OAuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Unread count for one canonical folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderCount {
    /// Canonical folder token (`inbox`, `sent`, ...).
    pub label: String,
    /// Number of unread items.
    pub count: u32,
}

/// An address the account may send as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAlias {
    pub email: String,
    pub name: Option<String>,
    pub primary: bool,
}

/// Confirmation returned by the provider after sending.
///
/// Providers that accept a send without returning the stored message
/// (Microsoft Graph answers `202 Accepted`) leave both fields empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub id: Option<String>,
    pub thread_id: Option<String>,
}
