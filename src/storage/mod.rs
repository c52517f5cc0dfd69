//! Connection storage.
//!
//! The relational store that owns connections lives in the host application.
//! Drivers only see it through [`ConnectionStore`]:
//!
//! - `find` resolves a user's connection before a driver is built
//! - `update` persists tokens after a silent refresh
//! - `delete` removes a connection whose credentials are no longer usable
//!
//! [`MemoryConnectionStore`] is an in-process implementation for tools and
//! tests.

mod memory;

pub use memory::MemoryConnectionStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Connection, ConnectionId, TokenUpdate};

/// Errors that can occur during connection store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection not found.
    #[error("connection not found: {0}")]
    NotFound(ConnectionId),

    /// Backend failure.
    #[error("storage error: {0}")]
    Backend(String),
}

/// Result type for connection store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage abstraction for provider connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Gets a user's connection by ID.
    async fn find(&self, user_id: &str, connection_id: &ConnectionId)
        -> Result<Option<Connection>>;

    /// Writes refreshed token fields to a connection.
    async fn update(&self, connection_id: &ConnectionId, tokens: &TokenUpdate) -> Result<()>;

    /// Deletes a connection.
    ///
    /// Deleting a connection that no longer exists succeeds.
    async fn delete(&self, connection_id: &ConnectionId) -> Result<()>;
}
