//! Request Store
//!
//! Durable table of async requests. Every mutation is a conditional update
//! keyed on the current status; the state machine in
//! [`RequestStatus::can_transition_to`] is enforced here and nowhere else
//! writes rows. Committed mutations are published on the change feed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::feed::{ChangeEvent, FeedPublisher, DEFAULT_FEED_CAPACITY};
use crate::StoreError;
use yardproto::{AsyncRequest, RequestStatus};

/// Counts by status, in the shape of a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestStoreStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub retrying: usize,
}

/// Request store trait for pluggable storage backends.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new PENDING request. Rejects duplicate ids.
    async fn insert(&self, request: AsyncRequest) -> Result<(), StoreError>;

    async fn get(&self, request_id: &str) -> Result<Option<AsyncRequest>, StoreError>;

    /// Conditionally move `from` → PROCESSING and stamp
    /// `processing_started`. `from` is PENDING for a first claim, RETRYING
    /// for a re-entry. Returns `Conflict` when another worker won the row.
    async fn claim(
        &self,
        request_id: &str,
        from: RequestStatus,
    ) -> Result<AsyncRequest, StoreError>;

    /// PROCESSING → COMPLETED with `progress=100` and the result stored.
    async fn complete(
        &self,
        request_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<AsyncRequest, StoreError>;

    /// PROCESSING → FAILED with the last error recorded.
    async fn fail(&self, request_id: &str, error: &str) -> Result<AsyncRequest, StoreError>;

    /// Conditionally move `expected` → CANCELLED.
    async fn cancel(
        &self,
        request_id: &str,
        expected: RequestStatus,
    ) -> Result<AsyncRequest, StoreError>;

    /// PROCESSING → RETRYING: increments `retry_count`, records the error,
    /// and sets the earliest next-claim time.
    async fn schedule_retry(
        &self,
        request_id: &str,
        error: &str,
        retry_after: DateTime<Utc>,
    ) -> Result<AsyncRequest, StoreError>;

    /// Persist a progress flush. Only valid while PROCESSING. The stored
    /// percentage is a high-water mark; regressions update message/details
    /// but never lower it.
    async fn update_progress(
        &self,
        request_id: &str,
        progress: f64,
        message: Option<String>,
        details: Option<serde_json::Value>,
    ) -> Result<AsyncRequest, StoreError>;

    async fn find_by_status(&self, status: RequestStatus)
        -> Result<Vec<AsyncRequest>, StoreError>;

    async fn find_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<AsyncRequest>, StoreError>;

    /// RETRYING rows whose backoff delay has elapsed.
    async fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<AsyncRequest>, StoreError>;

    /// Remove rows whose TTL lapsed. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn stats(&self) -> Result<RequestStoreStats, StoreError>;

    /// Subscribe to the change feed.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// In-memory request store using DashMap plus a broadcast feed.
#[derive(Debug)]
pub struct MemoryRequestStore {
    rows: DashMap<String, AsyncRequest>,
    feed: FeedPublisher,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(capacity: usize) -> Self {
        Self {
            rows: DashMap::new(),
            feed: FeedPublisher::new(capacity),
        }
    }

    /// Create a new store wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Apply a checked mutation under the row lock and publish the change.
    /// Publishing before the lock drops keeps per-row feed order equal to
    /// mutation order.
    fn mutate<F>(&self, request_id: &str, op: F) -> Result<AsyncRequest, StoreError>
    where
        F: FnOnce(&mut AsyncRequest) -> Result<(), StoreError>,
    {
        let mut entry = self.rows.get_mut(request_id).ok_or_else(|| {
            StoreError::NotFound {
                id: request_id.to_string(),
            }
        })?;
        let before = entry.value().clone();
        op(entry.value_mut())?;
        let after = entry.value().clone();
        self.feed.publish(ChangeEvent::modify(before, after.clone()));
        Ok(after)
    }

    fn check_transition(
        row: &AsyncRequest,
        expected: RequestStatus,
        to: RequestStatus,
    ) -> Result<(), StoreError> {
        if row.status != expected {
            return Err(StoreError::Conflict {
                id: row.request_id.clone(),
                expected,
                actual: row.status,
            });
        }
        if !row.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: row.request_id.clone(),
                from: row.status,
                to,
            });
        }
        Ok(())
    }
}

impl Default for MemoryRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn insert(&self, request: AsyncRequest) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.rows.entry(request.request_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate {
                id: request.request_id,
            }),
            Entry::Vacant(slot) => {
                tracing::info!(
                    request.id = %request.request_id,
                    request.action = %request.action,
                    request.connection = %request.connection_id,
                    "Request enqueued"
                );
                // Publish under the shard lock so the insert event cannot
                // reorder against a racing first mutation
                let row = slot.insert(request);
                self.feed.publish(ChangeEvent::insert(row.clone()));
                Ok(())
            }
        }
    }

    async fn get(&self, request_id: &str) -> Result<Option<AsyncRequest>, StoreError> {
        Ok(self.rows.get(request_id).map(|r| r.value().clone()))
    }

    async fn claim(
        &self,
        request_id: &str,
        from: RequestStatus,
    ) -> Result<AsyncRequest, StoreError> {
        self.mutate(request_id, |row| {
            Self::check_transition(row, from, RequestStatus::Processing)?;
            row.mark_processing();
            Ok(())
        })
    }

    async fn complete(
        &self,
        request_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<AsyncRequest, StoreError> {
        self.mutate(request_id, |row| {
            Self::check_transition(row, RequestStatus::Processing, RequestStatus::Completed)?;
            row.mark_completed(result);
            Ok(())
        })
    }

    async fn fail(&self, request_id: &str, error: &str) -> Result<AsyncRequest, StoreError> {
        self.mutate(request_id, |row| {
            Self::check_transition(row, RequestStatus::Processing, RequestStatus::Failed)?;
            row.mark_failed(error);
            Ok(())
        })
    }

    async fn cancel(
        &self,
        request_id: &str,
        expected: RequestStatus,
    ) -> Result<AsyncRequest, StoreError> {
        self.mutate(request_id, |row| {
            Self::check_transition(row, expected, RequestStatus::Cancelled)?;
            row.mark_cancelled();
            Ok(())
        })
    }

    async fn schedule_retry(
        &self,
        request_id: &str,
        error: &str,
        retry_after: DateTime<Utc>,
    ) -> Result<AsyncRequest, StoreError> {
        self.mutate(request_id, |row| {
            Self::check_transition(row, RequestStatus::Processing, RequestStatus::Retrying)?;
            row.mark_retrying(error, retry_after);
            Ok(())
        })
    }

    async fn update_progress(
        &self,
        request_id: &str,
        progress: f64,
        message: Option<String>,
        details: Option<serde_json::Value>,
    ) -> Result<AsyncRequest, StoreError> {
        self.mutate(request_id, |row| {
            if row.status != RequestStatus::Processing {
                return Err(StoreError::Conflict {
                    id: row.request_id.clone(),
                    expected: RequestStatus::Processing,
                    actual: row.status,
                });
            }
            let clamped = progress.clamp(0.0, 100.0);
            if clamped > row.progress {
                row.progress = clamped;
            }
            if message.is_some() {
                row.progress_message = message;
            }
            if details.is_some() {
                row.progress_details = details;
            }
            Ok(())
        })
    }

    async fn find_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<AsyncRequest>, StoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.value().status == status)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn find_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<AsyncRequest>, StoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.value().connection_id == connection_id)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<AsyncRequest>, StoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| {
                let row = r.value();
                row.status == RequestStatus::Retrying
                    && row.retry_after.map(|t| t <= now).unwrap_or(true)
            })
            .map(|r| r.value().clone())
            .collect())
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
            if let Some((_, row)) = self.rows.remove(&id) {
                tracing::info!(request.id = %id, request.status = %row.status, "Reaped expired request");
                self.feed.publish(ChangeEvent::remove(row));
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<RequestStoreStats, StoreError> {
        let mut stats = RequestStoreStats::default();
        for row in self.rows.iter() {
            stats.total += 1;
            match row.value().status {
                RequestStatus::Pending => stats.pending += 1,
                RequestStatus::Processing => stats.processing += 1,
                RequestStatus::Completed => stats.completed += 1,
                RequestStatus::Failed => stats.failed += 1,
                RequestStatus::Cancelled => stats.cancelled += 1,
                RequestStatus::Retrying => stats.retrying += 1,
            }
        }
        Ok(stats)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ChangeKind;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn request(id: &str) -> AsyncRequest {
        AsyncRequest::new(
            id,
            "C1",
            "generate_report",
            None,
            "user-1",
            None,
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let store = MemoryRequestStore::new();
        store.insert(request("req-1")).await.unwrap();
        assert!(matches!(
            store.insert(request("req-1")).await,
            Err(StoreError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = MemoryRequestStore::new();
        store.insert(request("req-1")).await.unwrap();

        let claimed = store.claim("req-1", RequestStatus::Pending).await.unwrap();
        assert_eq!(claimed.status, RequestStatus::Processing);
        assert!(claimed.processing_started.is_some());

        // Second claim observes PROCESSING and loses
        let err = store.claim("req-1", RequestStatus::Pending).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: RequestStatus::Pending,
                actual: RequestStatus::Processing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn complete_stamps_terminal_fields() {
        let store = MemoryRequestStore::new();
        store.insert(request("req-1")).await.unwrap();
        store.claim("req-1", RequestStatus::Pending).await.unwrap();

        let done = store
            .complete("req-1", Some(serde_json::json!({"url": "s3://out"})))
            .await
            .unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        assert_eq!(done.progress, 100.0);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_is_sticky() {
        let store = MemoryRequestStore::new();
        store.insert(request("req-1")).await.unwrap();
        store.claim("req-1", RequestStatus::Pending).await.unwrap();
        store.complete("req-1", None).await.unwrap();

        assert!(store.claim("req-1", RequestStatus::Pending).await.is_err());
        assert!(store.fail("req-1", "nope").await.is_err());
        assert!(store
            .cancel("req-1", RequestStatus::Completed)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn retry_cycle() {
        let store = MemoryRequestStore::new();
        store.insert(request("req-1")).await.unwrap();
        store.claim("req-1", RequestStatus::Pending).await.unwrap();

        let retry_at = Utc::now() - chrono::Duration::seconds(1);
        let row = store
            .schedule_retry("req-1", "downstream 503", retry_at)
            .await
            .unwrap();
        assert_eq!(row.status, RequestStatus::Retrying);
        assert_eq!(row.retry_count, 1);

        let due = store.due_retries(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].request_id, "req-1");

        let reclaimed = store.claim("req-1", RequestStatus::Retrying).await.unwrap();
        assert_eq!(reclaimed.status, RequestStatus::Processing);
        assert!(store.due_retries(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn future_retry_is_not_due() {
        let store = MemoryRequestStore::new();
        store.insert(request("req-1")).await.unwrap();
        store.claim("req-1", RequestStatus::Pending).await.unwrap();
        store
            .schedule_retry("req-1", "x", Utc::now() + chrono::Duration::seconds(30))
            .await
            .unwrap();

        assert!(store.due_retries(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn progress_is_high_water() {
        let store = MemoryRequestStore::new();
        store.insert(request("req-1")).await.unwrap();
        store.claim("req-1", RequestStatus::Pending).await.unwrap();

        store
            .update_progress("req-1", 60.0, Some("over half".into()), None)
            .await
            .unwrap();
        let row = store
            .update_progress("req-1", 30.0, Some("late straggler".into()), None)
            .await
            .unwrap();
        assert_eq!(row.progress, 60.0);
        assert_eq!(row.progress_message.as_deref(), Some("late straggler"));

        let row = store
            .update_progress("req-1", 150.0, None, None)
            .await
            .unwrap();
        assert_eq!(row.progress, 100.0);
    }

    #[tokio::test]
    async fn progress_requires_processing() {
        let store = MemoryRequestStore::new();
        store.insert(request("req-1")).await.unwrap();

        assert!(matches!(
            store.update_progress("req-1", 10.0, None, None).await,
            Err(StoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_pending_and_processing() {
        let store = MemoryRequestStore::new();
        store.insert(request("req-1")).await.unwrap();
        let row = store.cancel("req-1", RequestStatus::Pending).await.unwrap();
        assert_eq!(row.status, RequestStatus::Cancelled);
        assert!(row.completed_at.is_some());

        store.insert(request("req-2")).await.unwrap();
        store.claim("req-2", RequestStatus::Pending).await.unwrap();
        let row = store
            .cancel("req-2", RequestStatus::Processing)
            .await
            .unwrap();
        assert_eq!(row.status, RequestStatus::Cancelled);
    }

    #[tokio::test]
    async fn feed_reports_lifecycle_in_order() {
        let store = MemoryRequestStore::new();
        let mut feed = store.subscribe();

        store.insert(request("req-1")).await.unwrap();
        store.claim("req-1", RequestStatus::Pending).await.unwrap();
        store.complete("req-1", None).await.unwrap();

        let insert = feed.recv().await.unwrap();
        assert_eq!(insert.kind, ChangeKind::Insert);
        assert_eq!(insert.after.unwrap().status, RequestStatus::Pending);

        let claim = feed.recv().await.unwrap();
        assert_eq!(claim.kind, ChangeKind::Modify);
        assert_eq!(claim.before.unwrap().status, RequestStatus::Pending);
        assert_eq!(claim.after.unwrap().status, RequestStatus::Processing);

        let done = feed.recv().await.unwrap();
        assert_eq!(done.after.unwrap().status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn purge_emits_remove() {
        let store = MemoryRequestStore::new();
        let mut feed = store.subscribe();

        let short_lived = AsyncRequest::new(
            "req-1",
            "C1",
            "echo",
            None,
            "user-1",
            None,
            Duration::from_secs(0),
        );
        store.insert(short_lived).await.unwrap();
        let _ = feed.recv().await.unwrap();

        let removed = store
            .purge_expired(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let event = feed.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Remove);
        assert!(event.after.is_none());
    }

    #[tokio::test]
    async fn stats_counts_by_status() {
        let store = MemoryRequestStore::new();
        store.insert(request("req-1")).await.unwrap();
        store.insert(request("req-2")).await.unwrap();
        store.claim("req-2", RequestStatus::Pending).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
    }

    #[tokio::test]
    async fn indexes_by_status_and_connection() {
        let store = MemoryRequestStore::new();
        store.insert(request("req-1")).await.unwrap();
        let mut other = request("req-2");
        other.connection_id = "C2".into();
        store.insert(other).await.unwrap();

        assert_eq!(
            store
                .find_by_status(RequestStatus::Pending)
                .await
                .unwrap()
                .len(),
            2
        );
        assert_eq!(store.find_by_connection("C2").await.unwrap().len(), 1);
    }
}
