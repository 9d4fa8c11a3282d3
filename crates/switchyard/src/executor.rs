//! Async Executor
//!
//! Consumes the request store's change feed and drives every queued request
//! through its state machine: conditional claim, handler invocation under a
//! per-action timeout, then completion, retry scheduling, or failure.
//! RETRYING rows re-enter after their backoff via a delayed re-claim; a
//! periodic sweep reconciles anything a lagged feed missed.
//!
//! The claim is the concurrency guard: PENDING → PROCESSING is a
//! conditional update, so when several executors race over one row exactly
//! one wins and the rest observe a conflict and move on.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;

use yardconf::{ExecutorConfig, ProgressConfig, HANDLER_TIMEOUT_CEILING};
use yardproto::{AsyncRequest, ClientRequest, ErrorBody, ErrorCode, RequestStatus, ServerFrame};
use yardstore::{ChangeEvent, ChangeKind, RequestStore, StoreError};

use crate::dispatch::Dispatcher;
use crate::handler::{HandlerError, HandlerRegistry, RequestContext};
use crate::progress::ProgressReporter;

/// Cancel tokens for in-flight requests, keyed by request id. The Router's
/// `request_cancel` action reaches PROCESSING handlers through here.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: DashMap<String, CancellationToken>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn register(&self, request_id: impl Into<String>, token: CancellationToken) {
        self.tokens.insert(request_id.into(), token);
    }

    pub fn remove(&self, request_id: &str) {
        self.tokens.remove(request_id);
    }

    /// Fire a request's cancel token. Returns whether one was registered.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.tokens.get(request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

enum Outcome {
    Done(Result<serde_json::Value, HandlerError>),
    TimedOut,
    Cancelled,
    ShutDown,
}

pub struct Executor {
    store: Arc<dyn RequestStore>,
    handlers: Arc<HandlerRegistry>,
    dispatcher: Arc<Dispatcher>,
    cancels: Arc<CancelRegistry>,
    config: ExecutorConfig,
    progress: ProgressConfig,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    shutdown: CancellationToken,
}

impl Executor {
    pub fn new(
        store: Arc<dyn RequestStore>,
        handlers: Arc<HandlerRegistry>,
        dispatcher: Arc<Dispatcher>,
        cancels: Arc<CancelRegistry>,
        config: &ExecutorConfig,
        progress: &ProgressConfig,
    ) -> Arc<Self> {
        let max_concurrent = config.max_concurrent.max(1);
        Arc::new(Self {
            store,
            handlers,
            dispatcher,
            cancels,
            config: config.clone(),
            progress: progress.clone(),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the feed loop (and its sweeper) on the runtime.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(this.run())
    }

    /// Stop consuming the feed and wait for in-flight executions to wind
    /// down. Their contexts are cancelled; unfinished requests are parked
    /// as RETRYING for the next process. Returns whether everything wound
    /// down before the deadline.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        self.shutdown.cancel();
        let gave_up_at = tokio::time::Instant::now() + deadline;
        while self.permits.available_permits() < self.max_concurrent {
            if tokio::time::Instant::now() >= gave_up_at {
                tracing::warn!(
                    active = self.max_concurrent - self.permits.available_permits(),
                    "Executor shutdown deadline elapsed with requests in flight"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tracing::info!("Executor drained");
        true
    }

    async fn run(self: Arc<Self>) {
        let mut feed = self.store.subscribe();
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            max_concurrent = self.max_concurrent,
            "Executor consuming change feed"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = feed.recv() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed = missed, "Change feed lagged; sweep will reconcile");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = sweep.tick() => self.sweep().await,
            }
        }
        tracing::info!("Executor stopped");
    }

    fn handle_event(self: &Arc<Self>, event: ChangeEvent) {
        match event.kind {
            ChangeKind::Insert => {
                if let Some(after) = event.after {
                    if after.status == RequestStatus::Pending {
                        self.spawn_execution(after.request_id, RequestStatus::Pending);
                    }
                }
            }
            ChangeKind::Modify => {
                if let Some(after) = event.after {
                    if after.status == RequestStatus::Retrying {
                        self.spawn_delayed_retry(after.request_id, after.retry_after);
                    }
                }
            }
            ChangeKind::Remove => {}
        }
    }

    fn spawn_execution(self: &Arc<Self>, request_id: String, from: RequestStatus) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.execute(request_id, from).await;
        });
    }

    /// Wait out the backoff, then re-claim. The sweep covers this too;
    /// whichever path claims first wins and the other sees a conflict.
    fn spawn_delayed_retry(self: &Arc<Self>, request_id: String, retry_after: Option<DateTime<Utc>>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(at) = retry_after {
                let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = this.shutdown.cancelled() => return,
                }
            }
            this.execute(request_id, RequestStatus::Retrying).await;
        });
    }

    /// Reconcile missed feed events: due retries and PENDING rows old
    /// enough that their insert event must have been lost.
    async fn sweep(self: &Arc<Self>) {
        let now = Utc::now();

        match self.store.due_retries(now).await {
            Ok(due) => {
                for row in due {
                    self.spawn_execution(row.request_id, RequestStatus::Retrying);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Retry sweep failed"),
        }

        let sweep_interval = ChronoDuration::from_std(self.config.sweep_interval())
            .unwrap_or_else(|_| ChronoDuration::seconds(1));
        let cutoff = now - sweep_interval * 2;
        match self.store.find_by_status(RequestStatus::Pending).await {
            Ok(rows) => {
                for row in rows {
                    if row.created_at <= cutoff {
                        tracing::debug!(request.id = %row.request_id, "Sweep found unclaimed request");
                        self.spawn_execution(row.request_id, RequestStatus::Pending);
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Pending sweep failed"),
        }
    }

    async fn execute(self: Arc<Self>, request_id: String, from: RequestStatus) {
        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = self.shutdown.cancelled() => return,
        };

        let row = match self.store.claim(&request_id, from).await {
            Ok(row) => row,
            Err(StoreError::Conflict { actual, .. }) => {
                tracing::trace!(
                    request.id = %request_id,
                    status = %actual,
                    "Claim lost, another worker owns the row"
                );
                return;
            }
            Err(StoreError::NotFound { .. }) => return,
            Err(e) => {
                tracing::warn!(request.id = %request_id, error = %e, "Claim failed");
                return;
            }
        };

        let Some(handler) = self.handlers.get(&row.action) else {
            tracing::error!(
                request.id = %request_id,
                request.action = %row.action,
                "No handler registered for queued action"
            );
            match self
                .store
                .fail(&request_id, "no handler registered for action")
                .await
            {
                Ok(failed) => {
                    self.send_terminal_error(
                        &failed,
                        ErrorCode::InvalidAction,
                        "no handler registered for action",
                        false,
                    )
                    .await;
                }
                Err(e) => tracing::warn!(request.id = %request_id, error = %e, "Failure persist failed"),
            }
            return;
        };

        tracing::info!(
            request.id = %request_id,
            request.action = %row.action,
            retry_count = row.retry_count,
            "Request claimed"
        );

        let cancel = CancellationToken::new();
        self.cancels.register(&request_id, cancel.clone());

        let reporter = ProgressReporter::new(
            &request_id,
            &row.connection_id,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.store),
            &self.progress,
        );
        let ctx = RequestContext::new(
            &request_id,
            &row.connection_id,
            &row.user_id,
            row.tenant_id.clone(),
            cancel.clone(),
        );
        let request = ClientRequest {
            id: Some(row.request_id.clone()),
            action: row.action.clone(),
            payload: row.payload.clone(),
            metadata: None,
        };
        let timeout = self.config.handler_timeout().min(HANDLER_TIMEOUT_CEILING);

        // biased: a fired cancel token must win over a handler future that
        // resolves in the same wakeup, or cancellation could race into a
        // retry
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = self.shutdown.cancelled() => Outcome::ShutDown,
            result = tokio::time::timeout(
                timeout,
                handler.process_with_progress(&ctx, &request, &reporter),
            ) => match result {
                Ok(inner) => Outcome::Done(inner),
                Err(_) => Outcome::TimedOut,
            },
        };

        // Drain pending progress before any terminal frame so the client
        // sees them in order
        reporter.finish().await;
        self.cancels.remove(&request_id);

        match outcome {
            Outcome::Done(Ok(result)) => {
                match self.store.complete(&request_id, Some(result)).await {
                    Ok(completed) => {
                        tracing::info!(request.id = %request_id, "Request completed");
                        self.send_complete(&completed).await;
                    }
                    Err(e) => {
                        // Row left PROCESSING; the feed/sweep cannot help a
                        // row we cannot write, so this is loud
                        tracing::error!(request.id = %request_id, error = %e, "Completion persist failed");
                    }
                }
            }
            Outcome::Done(Err(e)) if !e.is_retryable() => {
                tracing::info!(request.id = %request_id, error = %e, "Request failed permanently");
                match self.store.fail(&request_id, &e.to_string()).await {
                    Ok(failed) => {
                        self.send_terminal_error(&failed, e.error_code(), e.to_string(), false)
                            .await;
                    }
                    Err(persist) => {
                        tracing::error!(request.id = %request_id, error = %persist, "Failure persist failed");
                    }
                }
            }
            Outcome::Done(Err(e)) => {
                self.retry_or_fail(&row, e.to_string(), ErrorCode::ProcessingFailed)
                    .await;
            }
            Outcome::TimedOut => {
                cancel.cancel();
                let reason = format!("timeout after {}ms", timeout.as_millis());
                tracing::warn!(request.id = %request_id, "Handler timed out");
                self.retry_or_fail(&row, reason, ErrorCode::Timeout).await;
            }
            Outcome::Cancelled => {
                match self.store.cancel(&request_id, RequestStatus::Processing).await {
                    Ok(cancelled) => {
                        tracing::info!(request.id = %request_id, "Request cancelled");
                        self.send_terminal_error(
                            &cancelled,
                            ErrorCode::ProcessingFailed,
                            "request cancelled",
                            true,
                        )
                        .await;
                    }
                    Err(e) => {
                        tracing::warn!(request.id = %request_id, error = %e, "Cancel persist failed");
                    }
                }
            }
            Outcome::ShutDown => {
                // Park the request; the next process's sweep re-runs it
                self.retry_or_fail(&row, "executor shutting down".to_string(), ErrorCode::ServiceUnavailable)
                    .await;
            }
        }
    }

    /// Apply the retry policy after a retryable failure. `row` is the image
    /// taken at claim time, so `retry_count` reflects prior episodes.
    async fn retry_or_fail(&self, row: &AsyncRequest, error: String, final_code: ErrorCode) {
        let next_count = row.retry_count + 1;
        if next_count <= row.max_retries {
            let delay = self.retry_delay(next_count);
            let retry_after =
                Utc::now() + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(1));
            match self
                .store
                .schedule_retry(&row.request_id, &error, retry_after)
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        request.id = %row.request_id,
                        attempt = next_count,
                        max_retries = row.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retry scheduled"
                    );
                }
                Err(e) => {
                    tracing::error!(request.id = %row.request_id, error = %e, "Retry persist failed");
                }
            }
        } else {
            tracing::warn!(
                request.id = %row.request_id,
                retries = row.retry_count,
                error = %error,
                "Retries exhausted"
            );
            match self.store.fail(&row.request_id, &error).await {
                Ok(failed) => {
                    self.send_terminal_error(&failed, final_code, error, false).await;
                }
                Err(e) => {
                    tracing::error!(request.id = %row.request_id, error = %e, "Failure persist failed");
                }
            }
        }
    }

    /// 2^n * base, capped.
    fn retry_delay(&self, retry_count: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(retry_count.min(16));
        std::cmp::min(
            self.config.retry_base().saturating_mul(multiplier),
            self.config.retry_cap(),
        )
    }

    async fn send_complete(&self, row: &AsyncRequest) {
        let frame = ServerFrame::complete(&row.request_id, row.result.clone());
        if let Err(e) = self.dispatcher.send(&row.connection_id, &frame).await {
            tracing::debug!(
                request.id = %row.request_id,
                connection.id = %row.connection_id,
                error = %e,
                "Complete frame undeliverable"
            );
        }
    }

    async fn send_terminal_error(
        &self,
        row: &AsyncRequest,
        code: ErrorCode,
        message: impl Into<String>,
        cancelled: bool,
    ) {
        let mut body = ErrorBody::new(code, message);
        if cancelled {
            body = body.with_details(serde_json::json!({ "cancelled": true }));
        }
        let frame = ServerFrame::error_body(Some(row.request_id.clone()), body);
        if let Err(e) = self.dispatcher.send(&row.connection_id, &frame).await {
            tracing::debug!(
                request.id = %row.request_id,
                connection.id = %row.connection_id,
                error = %e,
                "Error frame undeliverable"
            );
        }
    }
}
