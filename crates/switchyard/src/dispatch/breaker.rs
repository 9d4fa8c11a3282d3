//! Per-connection circuit breakers.
//!
//! A breaker opens after `threshold` consecutive send failures; while open,
//! every send to that connection short-circuits without touching the
//! transport. The window expiring admits the next send as a probe; one
//! success closes the breaker and clears all counters.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures required to open.
    pub threshold: u32,
    /// How long an open breaker short-circuits sends.
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Breaker state for one connection. Atomics only; readers never block
/// writers.
#[derive(Debug)]
struct Breaker {
    consecutive_failures: AtomicU32,
    /// Millis since the map epoch when the window opened; 0 = not open.
    opened_at_ms: AtomicU64,
}

impl Breaker {
    fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
        }
    }
}

/// All breakers, keyed by connection id.
#[derive(Debug)]
pub struct BreakerMap {
    breakers: DashMap<String, Breaker>,
    config: BreakerConfig,
    epoch: Instant,
}

impl BreakerMap {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        // +1 so an opened_at of 0 always means "never opened"
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    /// Whether sends to this connection are currently short-circuited.
    pub fn is_open(&self, connection_id: &str) -> bool {
        let Some(breaker) = self.breakers.get(connection_id) else {
            return false;
        };
        let opened_at = breaker.opened_at_ms.load(Ordering::Acquire);
        if opened_at == 0 {
            return false;
        }
        let elapsed = self.now_ms().saturating_sub(opened_at);
        elapsed < self.config.open_duration.as_millis() as u64
    }

    /// Record a failed send. Opens (or re-opens) the window once the
    /// consecutive count reaches the threshold.
    pub fn record_failure(&self, connection_id: &str) {
        let breaker = self
            .breakers
            .entry(connection_id.to_string())
            .or_insert_with(Breaker::new);
        let count = breaker.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= self.config.threshold {
            breaker.opened_at_ms.store(self.now_ms(), Ordering::Release);
            tracing::warn!(
                connection.id = %connection_id,
                failures = count,
                "Circuit opened"
            );
        }
    }

    /// Record a successful send: closes the breaker immediately and clears
    /// counters.
    pub fn record_success(&self, connection_id: &str) {
        if let Some(breaker) = self.breakers.get(connection_id) {
            let was_open = breaker.opened_at_ms.swap(0, Ordering::AcqRel) != 0;
            breaker.consecutive_failures.store(0, Ordering::Release);
            if was_open {
                tracing::info!(connection.id = %connection_id, "Circuit closed");
            }
        }
    }

    /// Forget a connection's breaker entirely (socket cleanup).
    pub fn remove(&self, connection_id: &str) {
        self.breakers.remove(connection_id);
    }

    /// Number of breakers currently open.
    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|entry| {
                let opened_at = entry.value().opened_at_ms.load(Ordering::Acquire);
                if opened_at == 0 {
                    return false;
                }
                let elapsed = self.now_ms().saturating_sub(opened_at);
                elapsed < self.config.open_duration.as_millis() as u64
            })
            .count()
    }
}

impl Default for BreakerMap {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_map(threshold: u32, open_ms: u64) -> BreakerMap {
        BreakerMap::new(BreakerConfig {
            threshold,
            open_duration: Duration::from_millis(open_ms),
        })
    }

    #[test]
    fn closed_until_threshold() {
        let map = fast_map(3, 30_000);
        map.record_failure("C1");
        map.record_failure("C1");
        assert!(!map.is_open("C1"));

        map.record_failure("C1");
        assert!(map.is_open("C1"));
        assert_eq!(map.open_count(), 1);
    }

    #[test]
    fn success_closes_immediately() {
        let map = fast_map(3, 30_000);
        for _ in 0..3 {
            map.record_failure("C1");
        }
        assert!(map.is_open("C1"));

        map.record_success("C1");
        assert!(!map.is_open("C1"));
        assert_eq!(map.open_count(), 0);

        // Counters cleared: takes three fresh failures to reopen
        map.record_failure("C1");
        map.record_failure("C1");
        assert!(!map.is_open("C1"));
    }

    #[test]
    fn window_expires() {
        let map = fast_map(3, 20);
        for _ in 0..3 {
            map.record_failure("C1");
        }
        assert!(map.is_open("C1"));

        std::thread::sleep(Duration::from_millis(30));
        assert!(!map.is_open("C1"));

        // Next failure reopens a fresh window: the count is already past
        // threshold
        map.record_failure("C1");
        assert!(map.is_open("C1"));
    }

    #[test]
    fn breakers_are_per_connection() {
        let map = fast_map(3, 30_000);
        for _ in 0..3 {
            map.record_failure("C1");
        }
        assert!(map.is_open("C1"));
        assert!(!map.is_open("C2"));
    }

    #[test]
    fn remove_forgets_state() {
        let map = fast_map(3, 30_000);
        for _ in 0..3 {
            map.record_failure("C1");
        }
        map.remove("C1");
        assert!(!map.is_open("C1"));
    }
}
