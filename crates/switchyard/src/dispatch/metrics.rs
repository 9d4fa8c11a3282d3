//! Dispatcher metrics.
//!
//! Latency percentiles over a sliding window of recent samples, error
//! counters by kind, and an in-flight gauge. Snapshots are cheap clones;
//! recording never blocks readers for long (the window lock is held only
//! for a push/pop).

use dashmap::DashMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Samples kept per latency window.
pub const WINDOW_SIZE: usize = 1_000;

/// Sliding window of latency samples in milliseconds.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: Mutex<VecDeque<f64>>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, latency: Duration) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency.as_secs_f64() * 1_000.0);
    }

    /// Nearest-rank percentile over the current window. `None` when empty.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let idx = rank.clamp(1, sorted.len()) - 1;
        Some(sorted[idx])
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(WINDOW_SIZE)
    }
}

/// Counters and windows owned by the Dispatcher.
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    pub send_latency: LatencyWindow,
    pub broadcast_latency: LatencyWindow,
    sends_total: AtomicU64,
    sends_failed: AtomicU64,
    broadcasts_total: AtomicU64,
    errors_by_kind: DashMap<&'static str, AtomicU64>,
    in_flight: AtomicU64,
}

impl DispatcherMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_send(&self, latency: Duration) {
        self.sends_total.fetch_add(1, Ordering::Relaxed);
        self.send_latency.record(latency);
    }

    pub fn record_broadcast(&self, latency: Duration) {
        self.broadcasts_total.fetch_add(1, Ordering::Relaxed);
        self.broadcast_latency.record(latency);
    }

    pub fn record_error(&self, kind: &'static str) {
        self.sends_failed.fetch_add(1, Ordering::Relaxed);
        self.errors_by_kind
            .entry(kind)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Snapshot for the metrics surface. `open_breakers` is supplied by the
    /// caller since the breaker map lives beside this struct.
    pub fn snapshot(&self, open_breakers: usize) -> MetricsSnapshot {
        let errors = self
            .errors_by_kind
            .iter()
            .map(|e| (e.key().to_string(), e.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            sends_total: self.sends_total.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
            broadcasts_total: self.broadcasts_total.load(Ordering::Relaxed),
            send_p50_ms: self.send_latency.percentile(50.0),
            send_p99_ms: self.send_latency.percentile(99.0),
            broadcast_p50_ms: self.broadcast_latency.percentile(50.0),
            broadcast_p99_ms: self.broadcast_latency.percentile(99.0),
            errors_by_kind: errors,
            in_flight: self.in_flight(),
            open_breakers,
        }
    }
}

/// Point-in-time view of dispatcher health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub sends_total: u64,
    pub sends_failed: u64,
    pub broadcasts_total: u64,
    pub send_p50_ms: Option<f64>,
    pub send_p99_ms: Option<f64>,
    pub broadcast_p50_ms: Option<f64>,
    pub broadcast_p99_ms: Option<f64>,
    pub errors_by_kind: HashMap<String, u64>,
    pub in_flight: u64,
    pub open_breakers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_has_no_percentiles() {
        let window = LatencyWindow::default();
        assert!(window.percentile(50.0).is_none());
    }

    #[test]
    fn percentiles_over_known_samples() {
        let window = LatencyWindow::new(100);
        for ms in 1..=100u64 {
            window.record(Duration::from_millis(ms));
        }
        assert_eq!(window.percentile(50.0), Some(50.0));
        assert_eq!(window.percentile(99.0), Some(99.0));
        assert_eq!(window.percentile(100.0), Some(100.0));
    }

    #[test]
    fn window_slides() {
        let window = LatencyWindow::new(10);
        for ms in 1..=20u64 {
            window.record(Duration::from_millis(ms));
        }
        assert_eq!(window.len(), 10);
        // Only 11..=20 remain
        assert_eq!(window.percentile(50.0), Some(15.0));
    }

    #[test]
    fn snapshot_collects_counters() {
        let metrics = DispatcherMetrics::new();
        metrics.record_send(Duration::from_millis(5));
        metrics.record_send(Duration::from_millis(15));
        metrics.record_error("transport");
        metrics.record_error("transport");
        metrics.record_error("circuit_open");
        metrics.send_started();

        let snap = metrics.snapshot(2);
        assert_eq!(snap.sends_total, 2);
        assert_eq!(snap.sends_failed, 3);
        assert_eq!(snap.errors_by_kind["transport"], 2);
        assert_eq!(snap.errors_by_kind["circuit_open"], 1);
        assert_eq!(snap.in_flight, 1);
        assert_eq!(snap.open_breakers, 2);

        metrics.send_finished();
        assert_eq!(metrics.in_flight(), 0);
    }
}
