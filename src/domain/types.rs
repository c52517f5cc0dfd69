//! Core identifier types for domain entities.
//!
//! These newtype wrappers provide type safety for entity identifiers,
//! preventing a connection id from being passed where a message id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier placed on canonical records whose provider omitted an id.
///
/// Downstream consumers can always rely on `id` being non-empty.
pub const UNKNOWN_ID: &str = "unknown";

/// Unique identifier for a stored provider connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Returns `id` unless it is absent or blank, in which case [`UNKNOWN_ID`].
pub fn id_or_unknown(id: Option<&str>) -> String {
    match id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => UNKNOWN_ID.to_string(),
    }
}
