//! Router
//!
//! Inspects every inbound frame and decides its fate: parse, resolve the
//! handler, validate, then execute inline (estimate at or below the async
//! threshold) or durably enqueue and acknowledge. The threshold is a policy
//! decision, not a prediction — the handler's declared estimate is trusted.
//!
//! A few actions are served by the Router itself rather than user handlers:
//! `ping`, `request_status`, and `request_cancel`.
//!
//! Frames from one connection are handled sequentially by the caller, and
//! every dispatcher send here is awaited before the next, so
//! acknowledgments and inline responses leave in submission order.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use yardconf::SwitchyardConfig;
use yardproto::{AsyncRequest, ClientRequest, Connection, ErrorCode, ServerFrame};
use yardstore::{ConnectionRegistry, RequestStore, StoreError};

use crate::dispatch::Dispatcher;
use crate::executor::CancelRegistry;
use crate::handler::{HandlerRegistry, RequestContext};

/// Metadata key through which a submission overrides the retry budget.
pub const META_MAX_RETRIES: &str = "max_retries";

/// Actions the Router serves itself.
pub const ACTION_PING: &str = "ping";
pub const ACTION_REQUEST_STATUS: &str = "request_status";
pub const ACTION_REQUEST_CANCEL: &str = "request_cancel";

pub struct Router {
    handlers: Arc<HandlerRegistry>,
    registry: Arc<dyn ConnectionRegistry>,
    store: Arc<dyn RequestStore>,
    dispatcher: Arc<Dispatcher>,
    cancels: Arc<CancelRegistry>,
    async_threshold: Duration,
    request_ttl: Duration,
    default_max_retries: u32,
}

impl Router {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        registry: Arc<dyn ConnectionRegistry>,
        store: Arc<dyn RequestStore>,
        dispatcher: Arc<Dispatcher>,
        cancels: Arc<CancelRegistry>,
        config: &SwitchyardConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            handlers,
            registry,
            store,
            dispatcher,
            cancels,
            async_threshold: config.router.async_threshold(),
            request_ttl: config.ttl.request_ttl(),
            default_max_retries: config.executor.max_retries,
        })
    }

    /// Whether an action would run inline. Exposed for observability; the
    /// decision itself happens in [`Self::handle_frame`].
    pub fn decides_sync(&self, action: &str) -> Option<bool> {
        self.handlers
            .get(action)
            .map(|h| h.estimated_duration() <= self.async_threshold)
    }

    /// Process one inbound transport frame. All outcomes leave as frames on
    /// the originating connection; an unregistered connection is
    /// unaddressable and the frame is dropped with a log line.
    pub async fn handle_frame(&self, connection_id: &str, body: &[u8]) {
        let session = match self.registry.get(connection_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::warn!(connection.id = %connection_id, "Frame from unregistered connection dropped");
                return;
            }
            Err(e) => {
                tracing::warn!(connection.id = %connection_id, error = %e, "Session lookup failed");
                return;
            }
        };

        let request = match ClientRequest::from_bytes(body) {
            Ok(request) => request,
            Err(e) => {
                self.send_error(
                    connection_id,
                    None,
                    ErrorCode::ValidationError,
                    e.to_string(),
                )
                .await;
                return;
            }
        };

        match request.action.as_str() {
            ACTION_PING => self.builtin_ping(connection_id, &request).await,
            ACTION_REQUEST_STATUS => {
                self.builtin_status(connection_id, &session, &request).await
            }
            ACTION_REQUEST_CANCEL => {
                self.builtin_cancel(connection_id, &session, &request).await
            }
            action => {
                let Some(handler) = self.handlers.get(action) else {
                    self.send_error(
                        connection_id,
                        request.id.clone(),
                        ErrorCode::InvalidAction,
                        format!("no handler for action '{action}'"),
                    )
                    .await;
                    return;
                };

                if let Err(message) = handler.validate(&request) {
                    self.send_error(
                        connection_id,
                        request.id.clone(),
                        ErrorCode::ValidationError,
                        message,
                    )
                    .await;
                    return;
                }

                // The dispatch decision: at or below the threshold runs
                // inline, above it is queued.
                if handler.estimated_duration() <= self.async_threshold {
                    self.run_inline(connection_id, &session, handler, &request)
                        .await;
                } else {
                    self.enqueue(connection_id, &session, &request).await;
                }
            }
        }
    }

    async fn run_inline(
        &self,
        connection_id: &str,
        session: &Connection,
        handler: Arc<dyn crate::handler::Handler>,
        request: &ClientRequest,
    ) {
        let request_id = request
            .id
            .clone()
            .unwrap_or_else(AsyncRequest::generate_id);
        let ctx = RequestContext::new(
            request_id.clone(),
            connection_id,
            session.user_id.clone(),
            session.tenant_id.clone(),
            CancellationToken::new(),
        );

        let frame = match handler.process(&ctx, request).await {
            Ok(data) => ServerFrame::response(request_id, Some(data)),
            Err(e) => {
                tracing::info!(
                    request.id = %request_id,
                    request.action = %request.action,
                    error = %e,
                    "Inline handler failed"
                );
                ServerFrame::error(
                    Some(request_id),
                    ErrorCode::ProcessingFailed,
                    e.to_string(),
                )
            }
        };

        // Best effort: the requester may be gone by now
        if let Err(e) = self.dispatcher.send(connection_id, &frame).await {
            tracing::debug!(connection.id = %connection_id, error = %e, "Inline result undeliverable");
        }
    }

    async fn enqueue(&self, connection_id: &str, session: &Connection, request: &ClientRequest) {
        let request_id = request
            .id
            .clone()
            .unwrap_or_else(AsyncRequest::generate_id);

        let max_retries = request
            .metadata
            .as_ref()
            .and_then(|m| m.get(META_MAX_RETRIES))
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(self.default_max_retries);

        let row = AsyncRequest::new(
            request_id.clone(),
            connection_id,
            request.action.clone(),
            request.payload.clone(),
            session.user_id.clone(),
            session.tenant_id.clone(),
            self.request_ttl,
        )
        .with_max_retries(max_retries);

        match self.store.insert(row).await {
            Ok(()) => {
                // Ack only after the row is durable
                let ack = ServerFrame::queued(&request_id);
                if let Err(e) = self.dispatcher.send(connection_id, &ack).await {
                    tracing::warn!(
                        request.id = %request_id,
                        error = %e,
                        "Acknowledgment undeliverable; request stays queued"
                    );
                }
            }
            Err(StoreError::Duplicate { .. }) => {
                self.send_error(
                    connection_id,
                    Some(request_id.clone()),
                    ErrorCode::ValidationError,
                    format!("request id '{request_id}' already exists"),
                )
                .await;
            }
            Err(e) => {
                tracing::error!(
                    request.id = %request_id,
                    error = %e,
                    "Request persistence failed"
                );
                self.send_error(
                    connection_id,
                    Some(request_id),
                    ErrorCode::InternalError,
                    "failed to queue request",
                )
                .await;
            }
        }
    }

    async fn builtin_ping(&self, connection_id: &str, request: &ClientRequest) {
        let request_id = request
            .id
            .clone()
            .unwrap_or_else(AsyncRequest::generate_id);
        let frame = ServerFrame::response(
            request_id,
            Some(serde_json::json!({
                "pong": true,
                "server_time": Utc::now().to_rfc3339(),
            })),
        );
        if let Err(e) = self.dispatcher.send(connection_id, &frame).await {
            tracing::debug!(connection.id = %connection_id, error = %e, "Pong undeliverable");
        }
    }

    /// Look up one of the caller's async requests. Requests owned by other
    /// users answer NOT_FOUND; existence is not leaked.
    async fn builtin_status(
        &self,
        connection_id: &str,
        session: &Connection,
        request: &ClientRequest,
    ) {
        let Some(target) = Self::payload_request_id(request) else {
            self.send_error(
                connection_id,
                request.id.clone(),
                ErrorCode::ValidationError,
                "payload.request_id required",
            )
            .await;
            return;
        };

        let row = match self.store.get(&target).await {
            Ok(Some(row)) if row.user_id == session.user_id => row,
            Ok(_) => {
                self.send_error(
                    connection_id,
                    request.id.clone(),
                    ErrorCode::NotFound,
                    format!("request '{target}' not found"),
                )
                .await;
                return;
            }
            Err(e) => {
                tracing::warn!(request.id = %target, error = %e, "Status lookup failed");
                self.send_error(
                    connection_id,
                    request.id.clone(),
                    ErrorCode::InternalError,
                    "status lookup failed",
                )
                .await;
                return;
            }
        };

        let frame = ServerFrame::response(
            request.id.clone().unwrap_or_else(AsyncRequest::generate_id),
            Some(Self::status_snapshot(&row)),
        );
        if let Err(e) = self.dispatcher.send(connection_id, &frame).await {
            tracing::debug!(connection.id = %connection_id, error = %e, "Status undeliverable");
        }
    }

    /// Cancel one of the caller's requests. PENDING/RETRYING rows cancel
    /// directly; PROCESSING rows get their executor-side cancel token
    /// fired and reach CANCELLED cooperatively. Terminal rows answer with
    /// their unchanged status.
    async fn builtin_cancel(
        &self,
        connection_id: &str,
        session: &Connection,
        request: &ClientRequest,
    ) {
        use yardproto::RequestStatus::*;

        let Some(target) = Self::payload_request_id(request) else {
            self.send_error(
                connection_id,
                request.id.clone(),
                ErrorCode::ValidationError,
                "payload.request_id required",
            )
            .await;
            return;
        };

        let row = match self.store.get(&target).await {
            Ok(Some(row)) if row.user_id == session.user_id => row,
            Ok(_) => {
                self.send_error(
                    connection_id,
                    request.id.clone(),
                    ErrorCode::NotFound,
                    format!("request '{target}' not found"),
                )
                .await;
                return;
            }
            Err(e) => {
                tracing::warn!(request.id = %target, error = %e, "Cancel lookup failed");
                self.send_error(
                    connection_id,
                    request.id.clone(),
                    ErrorCode::InternalError,
                    "cancel lookup failed",
                )
                .await;
                return;
            }
        };

        let data = match row.status {
            Pending | Retrying => match self.store.cancel(&target, row.status).await {
                Ok(cancelled) => serde_json::json!({
                    "request_id": target,
                    "status": cancelled.status,
                }),
                // Lost the race with a claim; report the status we now see
                Err(StoreError::Conflict { actual, .. }) => serde_json::json!({
                    "request_id": target,
                    "status": actual,
                    "cancel_requested": true,
                }),
                Err(e) => {
                    tracing::warn!(request.id = %target, error = %e, "Cancel failed");
                    self.send_error(
                        connection_id,
                        request.id.clone(),
                        ErrorCode::InternalError,
                        "cancel failed",
                    )
                    .await;
                    return;
                }
            },
            Processing => {
                let fired = self.cancels.cancel(&target);
                if !fired {
                    tracing::warn!(request.id = %target, "No cancel token for processing request");
                }
                serde_json::json!({
                    "request_id": target,
                    "status": row.status,
                    "cancel_requested": true,
                })
            }
            // Terminal is sticky; report it unchanged
            Completed | Failed | Cancelled => serde_json::json!({
                "request_id": target,
                "status": row.status,
            }),
        };

        let frame = ServerFrame::response(
            request.id.clone().unwrap_or_else(AsyncRequest::generate_id),
            Some(data),
        );
        if let Err(e) = self.dispatcher.send(connection_id, &frame).await {
            tracing::debug!(connection.id = %connection_id, error = %e, "Cancel response undeliverable");
        }
    }

    fn payload_request_id(request: &ClientRequest) -> Option<String> {
        request
            .payload
            .as_ref()
            .and_then(|p| p.get("request_id"))
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    fn status_snapshot(row: &AsyncRequest) -> serde_json::Value {
        serde_json::json!({
            "request_id": row.request_id,
            "action": row.action,
            "status": row.status,
            "progress": row.progress,
            "progress_message": row.progress_message,
            "result": row.result,
            "error": row.error,
            "retry_count": row.retry_count,
            "created_at": row.created_at.to_rfc3339(),
            "completed_at": row.completed_at.map(|t| t.to_rfc3339()),
        })
    }

    async fn send_error(
        &self,
        connection_id: &str,
        request_id: Option<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) {
        let frame = ServerFrame::error(request_id, code, message);
        if let Err(e) = self.dispatcher.send(connection_id, &frame).await {
            tracing::debug!(connection.id = %connection_id, error = %e, "Error frame undeliverable");
        }
    }
}
