//! In-memory connection store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ConnectionStore, Result, StoreError};
use crate::domain::{Connection, ConnectionId, TokenUpdate};

/// A [`ConnectionStore`] backed by a map.
#[derive(Debug, Default)]
pub struct MemoryConnectionStore {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl MemoryConnectionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a connection.
    pub async fn insert(&self, connection: Connection) {
        self.connections
            .write()
            .await
            .insert(connection.id.clone(), connection);
    }

    /// Returns a connection regardless of owner.
    pub async fn get(&self, connection_id: &ConnectionId) -> Option<Connection> {
        self.connections.read().await.get(connection_id).cloned()
    }

    /// Returns the number of stored connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Returns true when no connections are stored.
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn find(
        &self,
        user_id: &str,
        connection_id: &ConnectionId,
    ) -> Result<Option<Connection>> {
        Ok(self
            .connections
            .read()
            .await
            .get(connection_id)
            .filter(|c| c.user_id == user_id)
            .cloned())
    }

    async fn update(&self, connection_id: &ConnectionId, tokens: &TokenUpdate) -> Result<()> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(connection_id)
            .ok_or_else(|| StoreError::NotFound(connection_id.clone()))?;
        connection.apply(tokens);
        Ok(())
    }

    async fn delete(&self, connection_id: &ConnectionId) -> Result<()> {
        self.connections.write().await.remove(connection_id);
        Ok(())
    }
}
