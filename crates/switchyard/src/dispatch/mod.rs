//! Connection Dispatcher
//!
//! The delivery layer from server to socket: send one frame, broadcast to
//! many, check liveness, expose metrics, drain on shutdown. Policy lives
//! here — retry with truncated exponential backoff, per-connection circuit
//! breakers, stale-socket cleanup, bounded broadcast fan-out — so callers
//! (Router, Progress Reporter, Executor) just hand frames over.
//!
//! The dispatcher is safe under arbitrary concurrent callers. Per-connection
//! sends do not serialize against each other; callers needing ordering await
//! each send before issuing the next. The broadcast worker-pool semaphore is
//! the only cross-send synchronization.

pub mod breaker;
pub mod metrics;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerMap};
pub use metrics::{DispatcherMetrics, MetricsSnapshot};
pub use retry::BackoffPolicy;

use bytes::Bytes;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use yardconf::DispatcherConfig;
use yardproto::ServerFrame;
use yardstore::ConnectionRegistry;

use crate::error::DispatchError;
use crate::transport::{GatewayTransport, TransportError};

/// Idle time after which `is_active` pings the transport instead of
/// trusting `last_seen`.
const STALE_PROBE_AFTER: Duration = Duration::from_secs(60);

/// Budget for the background `last_seen` touch after a successful send.
const TOUCH_TIMEOUT: Duration = Duration::from_secs(1);

/// One failed broadcast target.
#[derive(Debug)]
pub struct BroadcastFailure {
    pub connection_id: String,
    pub error: DispatchError,
}

/// Aggregate outcome of a broadcast.
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    pub total: usize,
    pub delivered: usize,
    pub failures: Vec<BroadcastFailure>,
}

impl BroadcastOutcome {
    pub fn all_delivered(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The delivery layer. Shared behind an `Arc`; broadcast spawns workers off
/// clones of it.
pub struct Dispatcher {
    transport: Arc<dyn GatewayTransport>,
    registry: Arc<dyn ConnectionRegistry>,
    backoff: BackoffPolicy,
    breakers: BreakerMap,
    metrics: Arc<DispatcherMetrics>,
    pool: Arc<Semaphore>,
    pool_size: usize,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn GatewayTransport>,
        registry: Arc<dyn ConnectionRegistry>,
        config: &DispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            registry,
            backoff: BackoffPolicy::new(
                config.retry_base(),
                config.retry_cap(),
                config.retry_attempts,
            ),
            breakers: BreakerMap::new(BreakerConfig {
                threshold: config.circuit_open_threshold,
                open_duration: config.circuit_open_duration(),
            }),
            metrics: Arc::new(DispatcherMetrics::new()),
            pool: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            pool_size: config.worker_pool_size.max(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Serialize `frame` and deliver it to `connection_id`. Suspends while
    /// retrying; returns once delivered or failed for good.
    pub async fn send(
        &self,
        connection_id: &str,
        frame: &ServerFrame,
    ) -> Result<(), DispatchError> {
        self.send_with_cancel(connection_id, frame, &CancellationToken::new())
            .await
    }

    /// Like [`Self::send`], but the caller's token aborts retries early.
    pub async fn send_with_cancel(
        &self,
        connection_id: &str,
        frame: &ServerFrame,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let body = self.marshal(frame)?;
        let result = self.deliver(connection_id, body, cancel).await;
        if let Err(e) = &result {
            self.metrics.record_error(e.kind());
        }
        result
    }

    /// Fan out one frame to many connections with bounded parallelism.
    /// Completes when every target finishes; the outcome names each failed
    /// target. Errors out only when the frame itself cannot be marshalled
    /// or the dispatcher is draining.
    pub async fn broadcast(
        self: &Arc<Self>,
        connection_ids: &[String],
        frame: &ServerFrame,
    ) -> Result<BroadcastOutcome, DispatchError> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }
        let body = self.marshal(frame)?;

        let start = Instant::now();
        let mut outcome = BroadcastOutcome {
            total: connection_ids.len(),
            ..BroadcastOutcome::default()
        };
        if connection_ids.is_empty() {
            return Ok(outcome);
        }

        // Job queue the workers drain. Never more workers than targets.
        let jobs: Arc<Mutex<VecDeque<String>>> =
            Arc::new(Mutex::new(connection_ids.iter().cloned().collect()));
        let workers = self.pool_size.min(connection_ids.len());

        let mut set: JoinSet<Vec<(String, Result<(), DispatchError>)>> = JoinSet::new();
        for _ in 0..workers {
            let this = Arc::clone(self);
            let jobs = Arc::clone(&jobs);
            let body = body.clone();

            set.spawn(async move {
                let mut results = Vec::new();
                // Each worker holds one pool slot for its lifetime, so
                // concurrent transport calls stay bounded even across
                // overlapping broadcasts.
                let Ok(_permit) = this.pool.acquire().await else {
                    return results;
                };
                loop {
                    let job = jobs.lock().unwrap().pop_front();
                    let Some(connection_id) = job else { break };

                    if this.shutdown.is_cancelled() {
                        results.push((connection_id, Err(DispatchError::ShuttingDown)));
                        continue;
                    }
                    let result = this
                        .deliver(&connection_id, body.clone(), &this.shutdown)
                        .await;
                    results.push((connection_id, result));
                }
                results
            });
        }

        while let Some(joined) = set.join_next().await {
            let worker_results = joined.unwrap_or_default();
            for (connection_id, result) in worker_results {
                match result {
                    Ok(()) => outcome.delivered += 1,
                    Err(error) => {
                        self.metrics.record_error(error.kind());
                        outcome.failures.push(BroadcastFailure {
                            connection_id,
                            error,
                        });
                    }
                }
            }
        }

        self.metrics.record_broadcast(start.elapsed());
        tracing::debug!(
            total = outcome.total,
            delivered = outcome.delivered,
            failed = outcome.failures.len(),
            "Broadcast finished"
        );
        Ok(outcome)
    }

    /// Cheap liveness check: registry lookup, plus a transport ping when
    /// `last_seen` is stale.
    pub async fn is_active(&self, connection_id: &str) -> bool {
        let row = match self.registry.get(connection_id).await {
            Ok(Some(row)) => row,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(connection.id = %connection_id, error = %e, "Registry lookup failed");
                return false;
            }
        };

        let idle = (Utc::now() - row.last_seen)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if idle < STALE_PROBE_AFTER {
            return true;
        }

        match self.transport.connection_status(connection_id).await {
            Ok(_) => {
                self.spawn_touch(connection_id);
                true
            }
            Err(TransportError::Gone { .. }) => {
                self.spawn_stale_cleanup(connection_id);
                false
            }
            Err(e) => {
                tracing::debug!(connection.id = %connection_id, error = %e, "Liveness probe failed");
                false
            }
        }
    }

    /// Snapshot of counters and latency percentiles.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.breakers.open_count())
    }

    /// Stop accepting work and wait for in-flight sends to drain. Returns
    /// whether the drain finished before the deadline.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        self.shutdown.cancel();
        let gave_up_at = Instant::now() + deadline;
        while self.metrics.in_flight() > 0 {
            if Instant::now() >= gave_up_at {
                tracing::warn!(
                    in_flight = self.metrics.in_flight(),
                    "Shutdown deadline elapsed with sends in flight"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tracing::info!("Dispatcher drained");
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn marshal(&self, frame: &ServerFrame) -> Result<Bytes, DispatchError> {
        frame
            .to_bytes()
            .map_err(|e| DispatchError::Marshal(e.to_string()))
    }

    /// Deliver one pre-encoded body: registry lookup, breaker gate, retry
    /// loop, success bookkeeping.
    async fn deliver(
        &self,
        connection_id: &str,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }

        self.registry
            .get(connection_id)
            .await?
            .ok_or_else(|| DispatchError::ConnectionNotFound(connection_id.to_string()))?;

        if self.breakers.is_open(connection_id) {
            return Err(DispatchError::CircuitOpen(connection_id.to_string()));
        }

        self.metrics.send_started();
        let result = self.deliver_with_retry(connection_id, body, cancel).await;
        self.metrics.send_finished();

        match &result {
            Ok(latency) => {
                self.breakers.record_success(connection_id);
                self.metrics.record_send(*latency);
                self.spawn_touch(connection_id);
            }
            Err(DispatchError::ConnectionStale(_)) => {
                self.spawn_stale_cleanup(connection_id);
            }
            Err(DispatchError::Transport { .. }) => {
                self.breakers.record_failure(connection_id);
            }
            Err(_) => {}
        }
        result.map(|_| ())
    }

    async fn deliver_with_retry(
        &self,
        connection_id: &str,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Duration, DispatchError> {
        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self
                .transport
                .post_to_connection(connection_id, body.clone())
                .await
            {
                Ok(()) => return Ok(start.elapsed()),
                Err(TransportError::Gone { .. }) => {
                    return Err(DispatchError::ConnectionStale(connection_id.to_string()));
                }
                Err(e) if e.is_retryable() && attempt < self.backoff.attempts => {
                    let delay = self.backoff.delay_for_attempt(attempt + 1);
                    tracing::debug!(
                        connection.id = %connection_id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transport attempt failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                        _ = self.shutdown.cancelled() => return Err(DispatchError::ShuttingDown),
                    }
                }
                Err(e) => {
                    return Err(DispatchError::Transport {
                        connection_id: connection_id.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    /// Background `last_seen` touch. Failures are logged and never affect
    /// the caller.
    fn spawn_touch(&self, connection_id: &str) {
        let registry = Arc::clone(&self.registry);
        let connection_id = connection_id.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(TOUCH_TIMEOUT, registry.touch(&connection_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(connection.id = %connection_id, error = %e, "Activity touch failed");
                }
                Err(_) => {
                    tracing::debug!(connection.id = %connection_id, "Activity touch timed out");
                }
            }
        });
    }

    /// Best-effort removal of a gone connection's registry row and breaker
    /// state.
    fn spawn_stale_cleanup(&self, connection_id: &str) {
        let registry = Arc::clone(&self.registry);
        let connection_id = connection_id.to_string();
        self.breakers.remove(&connection_id);
        tokio::spawn(async move {
            match registry.remove(&connection_id).await {
                Ok(removed) => {
                    if removed {
                        tracing::info!(connection.id = %connection_id, "Stale connection cleaned up");
                    }
                }
                Err(e) => {
                    tracing::warn!(connection.id = %connection_id, error = %e, "Stale cleanup failed");
                }
            }
        });
    }
}
