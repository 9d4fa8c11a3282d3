//! SQLite-backed request store.
//!
//! Durable alternative to [`crate::MemoryRequestStore`] with identical
//! conditional-update semantics: every transition runs in an IMMEDIATE
//! transaction that re-reads the row, checks the expected status, and
//! writes the full image back. Connection-per-call with WAL mode and a
//! busy timeout, so concurrent executors on one host contend safely.
//!
//! The change feed is process-local: events are published after commit.
//! Rows written by another process are picked up by the periodic sweeps,
//! not the feed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::feed::{ChangeEvent, FeedPublisher, DEFAULT_FEED_CAPACITY};
use crate::requests::{RequestStore, RequestStoreStats};
use crate::StoreError;
use yardproto::{AsyncRequest, RequestStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS async_requests (
    request_id TEXT PRIMARY KEY,
    connection_id TEXT NOT NULL,
    action TEXT NOT NULL,
    payload JSON,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    processing_started TEXT,
    processing_ended TEXT,
    completed_at TEXT,
    progress REAL NOT NULL DEFAULT 0,
    progress_message TEXT,
    progress_details JSON,
    result JSON,
    error TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    retry_after TEXT,
    user_id TEXT NOT NULL,
    tenant_id TEXT,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_requests_status ON async_requests(status);
CREATE INDEX IF NOT EXISTS idx_requests_connection ON async_requests(connection_id);
"#;

const ALL_COLUMNS: &str = "request_id, connection_id, action, payload, status, created_at, \
     processing_started, processing_ended, completed_at, progress, progress_message, \
     progress_details, result, error, retry_count, max_retries, retry_after, user_id, \
     tenant_id, expires_at";

/// Request store persisted to a SQLite file.
pub struct SqliteRequestStore {
    path: PathBuf,
    feed: FeedPublisher,
}

impl SqliteRequestStore {
    /// Open (and initialize) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("create db directory: {e}")))?;
        }
        let store = Self {
            path,
            feed: FeedPublisher::new(DEFAULT_FEED_CAPACITY),
        };
        store.conn()?.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(store)
    }

    pub fn open_shared<P: AsRef<Path>>(path: P) -> Result<Arc<Self>, StoreError> {
        Ok(Arc::new(Self::open(path)?))
    }

    /// Connection with WAL mode and busy timeout.
    fn conn(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(db_err)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
        ",
        )
        .map_err(db_err)?;
        Ok(conn)
    }

    /// Re-read, check, mutate, write back, publish. The IMMEDIATE
    /// transaction holds the write lock across the read-modify-write, so
    /// conditional checks cannot race another writer.
    fn mutate<F>(&self, request_id: &str, op: F) -> Result<AsyncRequest, StoreError>
    where
        F: FnOnce(&mut AsyncRequest) -> Result<(), StoreError>,
    {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let before = fetch(&tx, request_id)?.ok_or_else(|| StoreError::NotFound {
            id: request_id.to_string(),
        })?;
        let mut after = before.clone();
        op(&mut after)?;
        write_row(&tx, &after)?;
        tx.commit().map_err(db_err)?;

        self.feed
            .publish(ChangeEvent::modify(before, after.clone()));
        Ok(after)
    }

    fn select_rows(&self, where_clause: &str, param: &str) -> Result<Vec<AsyncRequest>, StoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {ALL_COLUMNS} FROM async_requests WHERE {where_clause}");
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map([param], row_to_request)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
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

#[async_trait]
impl RequestStore for SqliteRequestStore {
    async fn insert(&self, request: AsyncRequest) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let result = conn.execute(
            &format!("INSERT INTO async_requests ({ALL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"),
            rusqlite::params_from_iter(row_values(&request)),
        );
        match result {
            Ok(_) => {
                tracing::info!(
                    request.id = %request.request_id,
                    request.action = %request.action,
                    "Request enqueued (sqlite)"
                );
                self.feed.publish(ChangeEvent::insert(request));
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate {
                    id: request.request_id,
                })
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get(&self, request_id: &str) -> Result<Option<AsyncRequest>, StoreError> {
        let conn = self.conn()?;
        fetch(&conn, request_id)
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
        self.select_rows("status = ?1", status.as_str())
    }

    async fn find_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<AsyncRequest>, StoreError> {
        self.select_rows("connection_id = ?1", connection_id)
    }

    async fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<AsyncRequest>, StoreError> {
        // Timestamp comparison happens on parsed values, not TEXT
        let retrying = self.select_rows("status = ?1", RequestStatus::Retrying.as_str())?;
        Ok(retrying
            .into_iter()
            .filter(|row| row.retry_after.map(|t| t <= now).unwrap_or(true))
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {ALL_COLUMNS} FROM async_requests");
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map([], row_to_request)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let mut removed = 0;
        for row in rows.into_iter().filter(|r| r.is_expired(now)) {
            let deleted = conn
                .execute(
                    "DELETE FROM async_requests WHERE request_id = ?1",
                    [&row.request_id],
                )
                .map_err(db_err)?;
            if deleted > 0 {
                tracing::info!(request.id = %row.request_id, "Reaped expired request (sqlite)");
                self.feed.publish(ChangeEvent::remove(row));
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<RequestStoreStats, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM async_requests GROUP BY status")
            .map_err(db_err)?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let mut stats = RequestStoreStats::default();
        for (status, count) in counts {
            let count = count as usize;
            stats.total += count;
            match status.parse::<RequestStatus>() {
                Ok(RequestStatus::Pending) => stats.pending = count,
                Ok(RequestStatus::Processing) => stats.processing = count,
                Ok(RequestStatus::Completed) => stats.completed = count,
                Ok(RequestStatus::Failed) => stats.failed = count,
                Ok(RequestStatus::Cancelled) => stats.cancelled = count,
                Ok(RequestStatus::Retrying) => stats.retrying = count,
                Err(e) => tracing::warn!(error = %e, "Unknown status in store"),
            }
        }
        Ok(stats)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn fetch(conn: &Connection, request_id: &str) -> Result<Option<AsyncRequest>, StoreError> {
    let sql = format!("SELECT {ALL_COLUMNS} FROM async_requests WHERE request_id = ?1");
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    match stmt.query_row([request_id], row_to_request) {
        Ok(row) => Ok(Some(row)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(db_err(e)),
    }
}

fn write_row(conn: &Connection, row: &AsyncRequest) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE async_requests SET connection_id = ?2, action = ?3, payload = ?4, status = ?5, \
         created_at = ?6, processing_started = ?7, processing_ended = ?8, completed_at = ?9, \
         progress = ?10, progress_message = ?11, progress_details = ?12, result = ?13, \
         error = ?14, retry_count = ?15, max_retries = ?16, retry_after = ?17, user_id = ?18, \
         tenant_id = ?19, expires_at = ?20 WHERE request_id = ?1",
        rusqlite::params_from_iter(row_values(row)),
    )
    .map_err(db_err)?;
    Ok(())
}

/// Owned parameter values in column order. Twenty columns is past the
/// tuple Params limit, so this goes through `params_from_iter`.
fn row_values(row: &AsyncRequest) -> Vec<rusqlite::types::Value> {
    use rusqlite::types::Value;

    fn text_opt(v: Option<String>) -> Value {
        v.map(Value::Text).unwrap_or(Value::Null)
    }

    vec![
        Value::Text(row.request_id.clone()),
        Value::Text(row.connection_id.clone()),
        Value::Text(row.action.clone()),
        text_opt(row.payload.as_ref().map(|v| v.to_string())),
        Value::Text(row.status.as_str().to_string()),
        Value::Text(row.created_at.to_rfc3339()),
        text_opt(row.processing_started.map(|t| t.to_rfc3339())),
        text_opt(row.processing_ended.map(|t| t.to_rfc3339())),
        text_opt(row.completed_at.map(|t| t.to_rfc3339())),
        Value::Real(row.progress),
        text_opt(row.progress_message.clone()),
        text_opt(row.progress_details.as_ref().map(|v| v.to_string())),
        text_opt(row.result.as_ref().map(|v| v.to_string())),
        text_opt(row.error.clone()),
        Value::Integer(row.retry_count as i64),
        Value::Integer(row.max_retries as i64),
        text_opt(row.retry_after.map(|t| t.to_rfc3339())),
        Value::Text(row.user_id.clone()),
        text_opt(row.tenant_id.clone()),
        Value::Text(row.expires_at.to_rfc3339()),
    ]
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<AsyncRequest> {
    Ok(AsyncRequest {
        request_id: row.get(0)?,
        connection_id: row.get(1)?,
        action: row.get(2)?,
        payload: parse_json(row.get::<_, Option<String>>(3)?),
        status: row
            .get::<_, String>(4)?
            .parse()
            .unwrap_or(RequestStatus::Failed),
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        processing_started: row.get::<_, Option<String>>(6)?.map(|s| parse_datetime(&s)),
        processing_ended: row.get::<_, Option<String>>(7)?.map(|s| parse_datetime(&s)),
        completed_at: row.get::<_, Option<String>>(8)?.map(|s| parse_datetime(&s)),
        progress: row.get(9)?,
        progress_message: row.get(10)?,
        progress_details: parse_json(row.get::<_, Option<String>>(11)?),
        result: parse_json(row.get::<_, Option<String>>(12)?),
        error: row.get(13)?,
        retry_count: row.get(14)?,
        max_retries: row.get(15)?,
        retry_after: row.get::<_, Option<String>>(16)?.map(|s| parse_datetime(&s)),
        user_id: row.get(17)?,
        tenant_id: row.get(18)?,
        expires_at: parse_datetime(&row.get::<_, String>(19)?),
    })
}

fn parse_json(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn parse_datetime(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ChangeKind;
    use std::time::Duration;

    fn request(id: &str) -> AsyncRequest {
        AsyncRequest::new(
            id,
            "C1",
            "generate_report",
            Some(serde_json::json!({"rows": 5})),
            "user-1",
            None,
            Duration::from_secs(3600),
        )
    }

    fn store() -> (tempfile::TempDir, SqliteRequestStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRequestStore::open(dir.path().join("requests.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn insert_get_roundtrip() {
        let (_dir, store) = store();
        let original = request("req-1");
        store.insert(original.clone()).await.unwrap();

        let read = store.get("req-1").await.unwrap().unwrap();
        assert_eq!(read.request_id, original.request_id);
        assert_eq!(read.action, original.action);
        assert_eq!(read.payload, original.payload);
        assert_eq!(read.status, RequestStatus::Pending);
        assert_eq!(read.max_retries, original.max_retries);
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let (_dir, store) = store();
        store.insert(request("req-1")).await.unwrap();
        assert!(matches!(
            store.insert(request("req-1")).await,
            Err(StoreError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.db");

        {
            let store = SqliteRequestStore::open(&path).unwrap();
            store.insert(request("req-1")).await.unwrap();
            store.claim("req-1", RequestStatus::Pending).await.unwrap();
        }

        let store = SqliteRequestStore::open(&path).unwrap();
        let row = store.get("req-1").await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Processing);
        assert!(row.processing_started.is_some());
    }

    #[tokio::test]
    async fn claim_is_conditional() {
        let (_dir, store) = store();
        store.insert(request("req-1")).await.unwrap();
        store.claim("req-1", RequestStatus::Pending).await.unwrap();

        let err = store
            .claim("req-1", RequestStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                actual: RequestStatus::Processing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn retry_cycle_and_due_query() {
        let (_dir, store) = store();
        store.insert(request("req-1")).await.unwrap();
        store.claim("req-1", RequestStatus::Pending).await.unwrap();
        store
            .schedule_retry("req-1", "flaky", Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();

        let due = store.due_retries(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].retry_count, 1);

        store.claim("req-1", RequestStatus::Retrying).await.unwrap();
        store
            .complete("req-1", Some(serde_json::json!({"ok": true})))
            .await
            .unwrap();

        let row = store.get("req-1").await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Completed);
        assert_eq!(row.progress, 100.0);
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn progress_high_water() {
        let (_dir, store) = store();
        store.insert(request("req-1")).await.unwrap();
        store.claim("req-1", RequestStatus::Pending).await.unwrap();

        store
            .update_progress("req-1", 70.0, Some("deep in".into()), None)
            .await
            .unwrap();
        let row = store
            .update_progress("req-1", 40.0, None, None)
            .await
            .unwrap();
        assert_eq!(row.progress, 70.0);
    }

    #[tokio::test]
    async fn indexes_and_stats() {
        let (_dir, store) = store();
        store.insert(request("req-1")).await.unwrap();
        store.insert(request("req-2")).await.unwrap();
        store.claim("req-2", RequestStatus::Pending).await.unwrap();

        assert_eq!(
            store
                .find_by_status(RequestStatus::Pending)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(store.find_by_connection("C1").await.unwrap().len(), 2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
    }

    #[tokio::test]
    async fn feed_publishes_after_commit() {
        let (_dir, store) = store();
        let mut feed = store.subscribe();

        store.insert(request("req-1")).await.unwrap();
        store.claim("req-1", RequestStatus::Pending).await.unwrap();

        assert_eq!(feed.recv().await.unwrap().kind, ChangeKind::Insert);
        let claim = feed.recv().await.unwrap();
        assert_eq!(claim.kind, ChangeKind::Modify);
        assert_eq!(claim.before.unwrap().status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn purge_expired_rows() {
        let (_dir, store) = store();
        let doomed = AsyncRequest::new(
            "req-1",
            "C1",
            "echo",
            None,
            "user-1",
            None,
            Duration::from_secs(0),
        );
        store.insert(doomed).await.unwrap();
        store.insert(request("req-2")).await.unwrap();

        let removed = store
            .purge_expired(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("req-1").await.unwrap().is_none());
        assert!(store.get("req-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn terminal_is_sticky() {
        let (_dir, store) = store();
        store.insert(request("req-1")).await.unwrap();
        store.claim("req-1", RequestStatus::Pending).await.unwrap();
        store.fail("req-1", "gave up").await.unwrap();

        assert!(store.claim("req-1", RequestStatus::Pending).await.is_err());
        assert!(store.complete("req-1", None).await.is_err());
        assert!(store
            .cancel("req-1", RequestStatus::Failed)
            .await
            .is_err());
    }
}
