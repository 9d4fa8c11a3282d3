//! Durable domain records: connections and async requests.
//!
//! The Connection Registry exclusively owns `Connection` rows and the
//! Request Store exclusively owns `AsyncRequest` rows. Everything else holds
//! ids and reads through. Status transitions go through
//! [`RequestStatus::can_transition_to`]; the store's transition operations
//! are the only writer.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default retry budget for an async request.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle status of an async request.
///
/// ```text
/// PENDING ──claim──► PROCESSING ──ok──► COMPLETED (terminal)
///                        │
///                        ├─ validation ─► FAILED (terminal)
///                        ├─ transient  ─► RETRYING ──delay──► PROCESSING
///                        ├─ retries exhausted ─► FAILED (terminal)
///                        └─ cancel    ──► CANCELLED (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Enqueued, not yet claimed by an executor.
    Pending,
    /// Claimed; a handler is running.
    Processing,
    /// Handler succeeded. Terminal.
    Completed,
    /// Handler failed permanently or retries exhausted. Terminal.
    Failed,
    /// Cancelled by the owner. Terminal.
    Cancelled,
    /// Waiting out a backoff delay before the next processing episode.
    Retrying,
}

impl RequestStatus {
    /// Terminal statuses are sticky: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        match (self, next) {
            (Pending, Processing) | (Pending, Cancelled) => true,
            (Processing, Completed)
            | (Processing, Failed)
            | (Processing, Retrying)
            | (Processing, Cancelled) => true,
            (Retrying, Processing) | (Retrying, Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Processing => "PROCESSING",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
            RequestStatus::Cancelled => "CANCELLED",
            RequestStatus::Retrying => "RETRYING",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RequestStatus::Pending),
            "PROCESSING" => Ok(RequestStatus::Processing),
            "COMPLETED" => Ok(RequestStatus::Completed),
            "FAILED" => Ok(RequestStatus::Failed),
            "CANCELLED" => Ok(RequestStatus::Cancelled),
            "RETRYING" => Ok(RequestStatus::Retrying),
            other => Err(format!("unknown request status: {other}")),
        }
    }
}

/// A live socket known to the gateway.
///
/// A row exists iff the gateway considers the socket live, with eventual
/// consistency on disconnect. Only `last_seen` mutates after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Opaque gateway connection id. Unique.
    pub connection_id: String,
    /// Owning principal.
    pub user_id: String,
    pub tenant_id: Option<String>,
    /// Gateway callback endpoint for server-to-client delivery.
    pub endpoint: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Opaque connect-time metadata (source ip, user agent).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Absolute expiry; the registry reaps the row after this.
    pub expires_at: DateTime<Utc>,
}

impl Connection {
    /// Create a row for a freshly opened socket with the given TTL.
    pub fn new(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        endpoint: impl Into<String>,
        ttl: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            tenant_id: None,
            endpoint: endpoint.into(),
            connected_at: now,
            last_seen: now,
            metadata: HashMap::new(),
            expires_at: now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::hours(24)),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Record activity on the socket.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time since the last observed activity.
    pub fn idle(&self, now: DateTime<Utc>) -> ChronoDuration {
        now - self.last_seen
    }
}

/// A durably queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncRequest {
    /// Globally unique id, client-supplied or server-generated.
    pub request_id: String,
    /// Connection the request arrived on.
    pub connection_id: String,
    /// Declared action; resolves to a handler.
    pub action: String,
    /// Opaque handler input.
    pub payload: Option<serde_json::Value>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    /// Start of the current (or last) processing episode.
    pub processing_started: Option<DateTime<Utc>>,
    /// End of the last processing episode.
    pub processing_ended: Option<DateTime<Utc>>,
    /// Set exactly once, when the status moves to a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Percent complete in [0, 100]. Non-decreasing while PROCESSING.
    pub progress: f64,
    pub progress_message: Option<String>,
    pub progress_details: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest time the next processing episode may start.
    pub retry_after: Option<DateTime<Utc>>,
    /// Owning principal, stamped from the originating connection.
    pub user_id: String,
    pub tenant_id: Option<String>,
    /// Absolute expiry; the store reaps the row after this.
    pub expires_at: DateTime<Utc>,
}

impl AsyncRequest {
    /// Build a PENDING request for a validated submission.
    pub fn new(
        request_id: impl Into<String>,
        connection_id: impl Into<String>,
        action: impl Into<String>,
        payload: Option<serde_json::Value>,
        user_id: impl Into<String>,
        tenant_id: Option<String>,
        ttl: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: request_id.into(),
            connection_id: connection_id.into(),
            action: action.into(),
            payload,
            status: RequestStatus::Pending,
            created_at: now,
            processing_started: None,
            processing_ended: None,
            completed_at: None,
            progress: 0.0,
            progress_message: None,
            progress_details: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_after: None,
            user_id: user_id.into(),
            tenant_id,
            expires_at: now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::days(7)),
        }
    }

    /// Generate a server-side request id.
    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the retry budget permits another processing episode.
    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    // The mark_* helpers mutate timestamps alongside status. They do not
    // check the state machine; the store's transition ops are the only
    // callers and run the check under their own locks first.

    pub fn mark_processing(&mut self) {
        self.status = RequestStatus::Processing;
        self.processing_started = Some(Utc::now());
        self.retry_after = None;
    }

    pub fn mark_completed(&mut self, result: Option<serde_json::Value>) {
        let now = Utc::now();
        self.status = RequestStatus::Completed;
        self.progress = 100.0;
        self.result = result;
        self.processing_ended = Some(now);
        self.completed_at = Some(now);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        self.status = RequestStatus::Failed;
        self.error = Some(error.into());
        self.processing_ended = Some(now);
        self.completed_at = Some(now);
    }

    pub fn mark_cancelled(&mut self) {
        let now = Utc::now();
        self.status = RequestStatus::Cancelled;
        if self.processing_started.is_some() && self.processing_ended.is_none() {
            self.processing_ended = Some(now);
        }
        self.completed_at = Some(now);
    }

    pub fn mark_retrying(&mut self, error: impl Into<String>, retry_after: DateTime<Utc>) {
        self.status = RequestStatus::Retrying;
        self.error = Some(error.into());
        self.retry_count += 1;
        self.retry_after = Some(retry_after);
        self.processing_ended = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn terminal_statuses() {
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::Processing.is_terminal());
        assert!(!RequestStatus::Retrying.is_terminal());
    }

    #[test]
    fn state_machine_edges() {
        use RequestStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));

        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Retrying));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(!Processing.can_transition_to(Pending));

        assert!(Retrying.can_transition_to(Processing));
        assert!(Retrying.can_transition_to(Cancelled));
        assert!(!Retrying.can_transition_to(Completed));
    }

    #[test]
    fn terminal_is_sticky() {
        use RequestStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Processing, Completed, Failed, Cancelled, Retrying] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&RequestStatus::Processing).unwrap();
        assert_eq!(json, r#""PROCESSING""#);
        let back: RequestStatus = serde_json::from_str(r#""RETRYING""#).unwrap();
        assert_eq!(back, RequestStatus::Retrying);
    }

    #[test]
    fn connection_expiry() {
        let conn = Connection::new("C1", "user-1", "wss://gw/prod", Duration::from_secs(0));
        assert!(conn.is_expired(Utc::now() + ChronoDuration::seconds(1)));

        let conn = Connection::new("C2", "user-1", "wss://gw/prod", Duration::from_secs(3600));
        assert!(!conn.is_expired(Utc::now()));
    }

    #[test]
    fn new_request_is_pending() {
        let req = AsyncRequest::new(
            "req-1",
            "C1",
            "generate_report",
            Some(serde_json::json!({"rows": 10})),
            "user-1",
            None,
            Duration::from_secs(7 * 24 * 3600),
        );
        assert_eq!(req.status, RequestStatus::Pending);
        assert_eq!(req.progress, 0.0);
        assert_eq!(req.retry_count, 0);
        assert_eq!(req.max_retries, DEFAULT_MAX_RETRIES);
        assert!(req.completed_at.is_none());
    }

    #[test]
    fn mark_completed_stamps_terminal_fields() {
        let mut req = AsyncRequest::new(
            "req-1",
            "C1",
            "echo",
            None,
            "user-1",
            None,
            Duration::from_secs(60),
        );
        req.mark_processing();
        assert!(req.processing_started.is_some());

        req.mark_completed(Some(serde_json::json!({"ok": true})));
        assert_eq!(req.status, RequestStatus::Completed);
        assert_eq!(req.progress, 100.0);
        assert!(req.completed_at.is_some());
        assert!(req.processing_ended.is_some());
    }

    #[test]
    fn mark_retrying_increments_count() {
        let mut req = AsyncRequest::new(
            "req-1",
            "C1",
            "flaky",
            None,
            "user-1",
            None,
            Duration::from_secs(60),
        );
        req.mark_processing();
        req.mark_retrying("downstream 503", Utc::now() + ChronoDuration::seconds(2));
        assert_eq!(req.status, RequestStatus::Retrying);
        assert_eq!(req.retry_count, 1);
        assert!(req.retry_after.is_some());
        assert!(req.completed_at.is_none());
    }
}
