//! Provider error classification.
//!
//! Partitions raw [`ProviderError`]s into the outcomes a caller acts on. A
//! [`ErrorKind::Fatal`] error means the stored credentials can no longer be
//! used and the connection must be deleted.

use serde::{Deserialize, Serialize};

use super::ProviderError;
use crate::domain::ProviderId;

/// How a failed provider call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credentials are invalid; the connection is deleted.
    Fatal,
    /// Retrying later may succeed.
    Transient,
    /// The requested item does not exist.
    NotFound,
    /// The caller sent something the driver cannot act on.
    Invalid,
}

/// Structured error codes Google uses for revoked or invalid credentials.
const GOOGLE_FATAL_CODES: &[&str] = &[
    "UNAUTHENTICATED",
    "invalid_grant",
    "authError",
    "unauthorized_client",
    "invalid_client",
];

/// Messages Google returns without a usable code for the same condition.
const GOOGLE_FATAL_MESSAGES: &[&str] = &[
    "Invalid Credentials",
    "Token has been expired or revoked.",
];

/// Structured error codes Microsoft uses for revoked or invalid credentials.
const MICROSOFT_FATAL_CODES: &[&str] = &[
    "InvalidAuthenticationToken",
    "AuthenticationError",
    "invalid_grant",
    "interaction_required",
];

fn fatal_codes(provider: ProviderId) -> &'static [&'static str] {
    match provider {
        ProviderId::Google => GOOGLE_FATAL_CODES,
        ProviderId::Microsoft => MICROSOFT_FATAL_CODES,
    }
}

fn fatal_messages(provider: ProviderId) -> &'static [&'static str] {
    match provider {
        ProviderId::Google => GOOGLE_FATAL_MESSAGES,
        ProviderId::Microsoft => &[],
    }
}

/// Classifies a provider error.
pub fn classify(provider: ProviderId, err: &ProviderError) -> ErrorKind {
    match err {
        ProviderError::Authentication(_) => ErrorKind::Fatal,
        ProviderError::Api {
            status,
            code,
            message,
        } => {
            let fatal_code = code
                .as_deref()
                .is_some_and(|c| fatal_codes(provider).contains(&c));
            if fatal_code || fatal_messages(provider).contains(&message.as_str()) {
                return ErrorKind::Fatal;
            }
            match status {
                429 => ErrorKind::Transient,
                404 => ErrorKind::NotFound,
                400..=499 => ErrorKind::Fatal,
                _ => ErrorKind::Transient,
            }
        }
        ProviderError::NotFound(_) => ErrorKind::NotFound,
        ProviderError::RateLimited { .. }
        | ProviderError::Connection(_)
        | ProviderError::Internal(_) => ErrorKind::Transient,
        ProviderError::InvalidRequest(_) | ProviderError::UnsupportedProvider(_) => {
            ErrorKind::Invalid
        }
    }
}
