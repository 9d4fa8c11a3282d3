//! Connection Registry
//!
//! Authoritative mapping from `connection_id` to the owning principal, the
//! gateway callback endpoint, and activity timestamps. A row exists iff the
//! gateway considers the socket live (eventually consistent on disconnect).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::StoreError;
use yardproto::Connection;

/// Statistics about registered connections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryStats {
    /// Total rows.
    pub total: usize,
    /// Rows past their TTL but not yet reaped.
    pub expired: usize,
}

/// Registry trait for pluggable storage backends.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Insert or replace the row for a freshly opened socket.
    async fn put(&self, connection: Connection) -> Result<(), StoreError>;

    /// Fetch a row by id.
    async fn get(&self, connection_id: &str) -> Result<Option<Connection>, StoreError>;

    /// Update `last_seen`. Missing rows are ignored; the socket may have
    /// closed between the caller's lookup and the touch.
    async fn touch(&self, connection_id: &str) -> Result<(), StoreError>;

    /// Remove a row. Idempotent; returns whether a row existed.
    async fn remove(&self, connection_id: &str) -> Result<bool, StoreError>;

    /// All live connections owned by a user.
    async fn find_by_user(&self, user_id: &str) -> Result<Vec<Connection>, StoreError>;

    /// All live connections in a tenant.
    async fn find_by_tenant(&self, tenant_id: &str) -> Result<Vec<Connection>, StoreError>;

    /// Total registered connections, reaped or not.
    async fn count(&self) -> Result<usize, StoreError>;

    /// Remove rows whose TTL lapsed. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn stats(&self) -> Result<RegistryStats, StoreError>;
}

/// In-memory registry using DashMap.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    rows: DashMap<String, Connection>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }

    /// Create a new registry wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ConnectionRegistry for MemoryRegistry {
    async fn put(&self, connection: Connection) -> Result<(), StoreError> {
        tracing::debug!(
            connection.id = %connection.connection_id,
            connection.user = %connection.user_id,
            "Connection registered"
        );
        self.rows
            .insert(connection.connection_id.clone(), connection);
        Ok(())
    }

    async fn get(&self, connection_id: &str) -> Result<Option<Connection>, StoreError> {
        Ok(self.rows.get(connection_id).map(|r| r.value().clone()))
    }

    async fn touch(&self, connection_id: &str) -> Result<(), StoreError> {
        if let Some(mut row) = self.rows.get_mut(connection_id) {
            row.touch();
        }
        Ok(())
    }

    async fn remove(&self, connection_id: &str) -> Result<bool, StoreError> {
        let removed = self.rows.remove(connection_id).is_some();
        if removed {
            tracing::info!(connection.id = %connection_id, "Connection removed");
        }
        Ok(removed)
    }

    async fn find_by_user(&self, user_id: &str) -> Result<Vec<Connection>, StoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.value().user_id == user_id)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn find_by_tenant(&self, tenant_id: &str) -> Result<Vec<Connection>, StoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.value().tenant_id.as_deref() == Some(tenant_id))
            .map(|r| r.value().clone())
            .collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.rows.len())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let stale: Vec<String> = self
            .rows
            .iter()
            .filter(|r| r.value().is_expired(now))
            .map(|r| r.key().clone())
            .collect();

        let mut removed = 0;
        for id in stale {
            if self.rows.remove(&id).is_some() {
                tracing::info!(connection.id = %id, "Reaped expired connection");
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<RegistryStats, StoreError> {
        let now = Utc::now();
        let mut expired = 0;
        for row in self.rows.iter() {
            if row.value().is_expired(now) {
                expired += 1;
            }
        }
        Ok(RegistryStats {
            total: self.rows.len(),
            expired,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn connection(id: &str, user: &str, ttl_secs: u64) -> Connection {
        Connection::new(id, user, "wss://gw/test", Duration::from_secs(ttl_secs))
    }

    #[tokio::test]
    async fn put_get_remove() {
        let registry = MemoryRegistry::new();
        registry.put(connection("C1", "user-1", 3600)).await.unwrap();

        let row = registry.get("C1").await.unwrap().unwrap();
        assert_eq!(row.user_id, "user-1");

        assert!(registry.remove("C1").await.unwrap());
        assert!(!registry.remove("C1").await.unwrap());
        assert!(registry.get("C1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn touch_advances_last_seen() {
        let registry = MemoryRegistry::new();
        registry.put(connection("C1", "user-1", 3600)).await.unwrap();

        let before = registry.get("C1").await.unwrap().unwrap().last_seen;
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.touch("C1").await.unwrap();
        let after = registry.get("C1").await.unwrap().unwrap().last_seen;
        assert!(after > before);

        // Touching a missing row is not an error
        registry.touch("nope").await.unwrap();
    }

    #[tokio::test]
    async fn queries_by_user_and_tenant() {
        let registry = MemoryRegistry::new();
        registry.put(connection("C1", "alice", 3600)).await.unwrap();
        registry.put(connection("C2", "alice", 3600)).await.unwrap();
        registry
            .put(connection("C3", "bob", 3600).with_tenant("acme"))
            .await
            .unwrap();

        assert_eq!(registry.find_by_user("alice").await.unwrap().len(), 2);
        assert_eq!(registry.find_by_user("bob").await.unwrap().len(), 1);
        assert_eq!(registry.find_by_tenant("acme").await.unwrap().len(), 1);
        assert!(registry.find_by_tenant("other").await.unwrap().is_empty());
        assert_eq!(registry.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let registry = MemoryRegistry::new();
        registry.put(connection("C1", "alice", 0)).await.unwrap();
        registry.put(connection("C2", "alice", 3600)).await.unwrap();

        let removed = registry
            .purge_expired(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(registry.get("C1").await.unwrap().is_none());
        assert!(registry.get("C2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_counts_expired() {
        let registry = MemoryRegistry::new();
        registry.put(connection("C1", "alice", 0)).await.unwrap();
        registry.put(connection("C2", "alice", 3600)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.expired, 1);
    }
}
