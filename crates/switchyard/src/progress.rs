//! Progress Reporter
//!
//! Per-request handle through which handlers emit progress. Updates flow
//! over a channel into a flush task that coalesces them (keep-newest) and
//! emits at a bounded rate. Updates at or above the force threshold, and
//! terminal updates, bypass batching. Every flush persists to the request
//! store; delivery to the socket stops permanently once the dispatcher
//! reports the connection dead, while persistence continues (store-only
//! mode).
//!
//! Emitted frames carry a per-request sequence number and leave here in
//! order; the dispatcher preserves that order to the socket because
//! [`flush`](FlushTask::flush) awaits each send before the next.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use yardconf::ProgressConfig;
use yardproto::ServerFrame;
use yardstore::RequestStore;

use crate::dispatch::Dispatcher;

enum Command {
    Report { percentage: f64, message: String },
    SetMetadata { key: String, value: String },
}

/// Handle given to a handler for one request's lifetime. Dropping it (or
/// calling [`Self::finish`]) flushes anything pending and stops the task.
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn new(
        request_id: impl Into<String>,
        connection_id: impl Into<String>,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn RequestStore>,
        config: &ProgressConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = FlushTask {
            request_id: request_id.into(),
            connection_id: connection_id.into(),
            dispatcher,
            store,
            flush_interval: config.flush_interval(),
            max_batch: config.max_batch.max(1),
            force_threshold: config.force_threshold,
            pending: None,
            metadata: HashMap::new(),
            last_emitted: None,
            sequence: 0,
            store_only: false,
        };
        let task = tokio::spawn(task.run(rx));
        Self { tx, task }
    }

    /// Record a progress update. Non-blocking; coalescing and delivery
    /// happen in the flush task.
    pub fn report(&self, percentage: f64, message: impl Into<String>) {
        let _ = self.tx.send(Command::Report {
            percentage,
            message: message.into(),
        });
    }

    /// Attach a key/value carried by subsequent progress frames.
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self.tx.send(Command::SetMetadata {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Flush anything pending and stop. The executor calls this before
    /// emitting the terminal frame so progress and completion stay ordered.
    pub async fn finish(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

/// One coalesced update awaiting flush.
struct Pending {
    percentage: f64,
    message: String,
    /// Updates merged into this one since the last flush.
    merged: usize,
}

struct FlushTask {
    request_id: String,
    connection_id: String,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn RequestStore>,
    flush_interval: std::time::Duration,
    max_batch: usize,
    force_threshold: f64,
    pending: Option<Pending>,
    metadata: HashMap<String, String>,
    /// High-water mark of emitted percentages. Lower reports persist but
    /// are not re-emitted.
    last_emitted: Option<f64>,
    sequence: u64,
    store_only: bool,
}

impl FlushTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        // interval_at: the first tick fires one interval out, not
        // immediately, so early reports actually batch
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.flush_interval,
            self.flush_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Report { percentage, message }) => {
                        let percentage = percentage.clamp(0.0, 100.0);
                        let force = percentage >= self.force_threshold;
                        let merged = match self.pending.take() {
                            Some(prev) => prev.merged + 1,
                            None => 1,
                        };
                        self.pending = Some(Pending {
                            percentage,
                            message,
                            merged,
                        });
                        if force || merged >= self.max_batch {
                            self.flush().await;
                        }
                    }
                    Some(Command::SetMetadata { key, value }) => {
                        self.metadata.insert(key, value);
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if self.pending.is_some() {
                        self.flush().await;
                    }
                }
            }
        }
    }

    async fn flush(&mut self) {
        let Some(update) = self.pending.take() else {
            return;
        };

        // Persist first; store failures are logged, never propagated.
        if let Err(e) = self
            .store
            .update_progress(
                &self.request_id,
                update.percentage,
                Some(update.message.clone()),
                None,
            )
            .await
        {
            tracing::debug!(
                request.id = %self.request_id,
                error = %e,
                "Progress persistence failed"
            );
        }

        if self.store_only {
            return;
        }

        // Regressions are accepted but not re-emitted.
        if let Some(last) = self.last_emitted {
            if update.percentage < last {
                return;
            }
        }

        self.sequence += 1;
        let frame = ServerFrame::Progress {
            request_id: self.request_id.clone(),
            percentage: update.percentage,
            message: update.message,
            metadata: if self.metadata.is_empty() {
                None
            } else {
                Some(self.metadata.clone())
            },
            sequence: self.sequence,
        };

        match self.dispatcher.send(&self.connection_id, &frame).await {
            Ok(()) => {
                self.last_emitted = Some(update.percentage);
            }
            Err(e) if e.is_connection_dead() => {
                tracing::info!(
                    request.id = %self.request_id,
                    connection.id = %self.connection_id,
                    "Connection dead, demoting reporter to store-only"
                );
                self.store_only = true;
            }
            Err(e) => {
                tracing::debug!(
                    request.id = %self.request_id,
                    error = %e,
                    "Progress frame delivery failed"
                );
            }
        }
    }
}
