//! Truncated exponential backoff for transport retries.
//!
//! attempt 1: base, attempt 2: base * 2, attempt n: min(base * 2^(n-1), cap),
//! each with ±25% jitter so synchronized failures don't retry in lockstep.

use std::time::{Duration, Instant};

/// Backoff schedule for one send.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Total delivery attempts, first try included.
    pub attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, attempts: u32) -> Self {
        Self {
            base,
            cap,
            attempts: attempts.max(1),
        }
    }

    /// Delay before the given attempt (1-based; attempt 1 has no delay).
    /// Exponential growth capped at `cap`, then jittered by ±25%.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(2));
        let flat = std::cmp::min(self.base.saturating_mul(multiplier), self.cap);
        jittered(flat)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            attempts: 3,
        }
    }
}

/// Apply ±25% jitter to a delay.
///
/// Uses modular arithmetic on clock nanos as cheap entropy; backoff jitter
/// does not need a real RNG.
fn jittered(delay: Duration) -> Duration {
    let delay_ms = delay.as_millis() as u64;
    if delay_ms == 0 {
        return delay;
    }
    let span = delay_ms / 2; // full jitter range: 50% of the delay
    if span == 0 {
        return delay;
    }
    let nanos = Instant::now().elapsed().subsec_nanos() as u64;
    let ts_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let offset = (nanos ^ ts_nanos) % (span + 1);
    // delay - 25% + offset lands in [0.75 * delay, 1.25 * delay]
    Duration::from_millis(delay_ms - span / 2 + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_has_no_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn grows_exponentially_within_jitter() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5), 5);

        // attempt 2 → ~100ms, attempt 3 → ~200ms, attempt 4 → ~400ms
        for (attempt, flat_ms) in [(2u32, 100u64), (3, 200), (4, 400)] {
            let delay = policy.delay_for_attempt(attempt).as_millis() as u64;
            let low = flat_ms * 3 / 4;
            let high = flat_ms * 5 / 4;
            assert!(
                (low..=high).contains(&delay),
                "attempt {attempt}: {delay}ms outside [{low}, {high}]"
            );
        }
    }

    #[test]
    fn caps_at_maximum() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(500), 16);
        let delay = policy.delay_for_attempt(12);
        assert!(delay <= Duration::from_millis(500 * 5 / 4));
    }

    #[test]
    fn at_least_one_attempt() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5), 0);
        assert_eq!(policy.attempts, 1);
    }
}
