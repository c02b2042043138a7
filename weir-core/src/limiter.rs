//! Keyed in-memory token-bucket rate limiter.
//!
//! Admission control primitive used for overflow detection (a denied key is
//! routed to the overflow topic) and for warning-log throttling (a denial is
//! the coalescing signal). Buckets are process-local: exact global limiting
//! is not required for overflow detection, so each worker keeps its own view.

use dashmap::DashMap;

/// One bucket per key. Refill is lazy: computed on access, never on a timer.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
}

/// Keyed token-bucket limiter.
///
/// `consume` serializes access per key; calls for different keys do not
/// block each other.
#[derive(Debug)]
pub struct MemoryRateLimiter {
    buckets: DashMap<String, Bucket>,
    capacity: f64,
    refill_per_sec: f64,
}

impl MemoryRateLimiter {
    /// Create a limiter with the given bucket capacity and refill rate
    /// (tokens per second).
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity,
            refill_per_sec,
        }
    }

    /// Attempt to consume `amount` tokens from the bucket for `key` at time
    /// `at_ms`. Returns `true` when admitted. A denial leaves the bucket's
    /// token balance untouched.
    pub fn consume(&self, key: &str, amount: f64, at_ms: u64) -> bool {
        let mut entry = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill_ms: at_ms,
        });

        let bucket = entry.value_mut();

        // Ignore timestamps older than the last refill; out-of-order batch
        // timestamps must not rewind the bucket.
        if at_ms > bucket.last_refill_ms {
            let elapsed_s = (at_ms - bucket.last_refill_ms) as f64 / 1000.0;
            bucket.tokens = (bucket.tokens + elapsed_s * self.refill_per_sec).min(self.capacity);
            bucket.last_refill_ms = at_ms;
        }

        if bucket.tokens >= amount {
            bucket.tokens -= amount;
            true
        } else {
            false
        }
    }

    /// Current token balance for a key, if a bucket exists
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|b| b.tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_capacity() {
        let limiter = MemoryRateLimiter::new(10.0, 1.0);

        assert!(limiter.consume("k", 4.0, 0));
        assert!(limiter.consume("k", 6.0, 0));
        assert!(!limiter.consume("k", 1.0, 0));
    }

    #[test]
    fn test_denial_does_not_mutate_tokens() {
        let limiter = MemoryRateLimiter::new(10.0, 1.0);

        assert!(limiter.consume("k", 8.0, 0));
        assert!(!limiter.consume("k", 5.0, 0));
        // The remaining 2 tokens survived the denial.
        assert!(limiter.consume("k", 2.0, 0));
    }

    #[test]
    fn test_lazy_refill_capped_at_capacity() {
        let limiter = MemoryRateLimiter::new(10.0, 2.0);

        assert!(limiter.consume("k", 10.0, 0));
        assert!(!limiter.consume("k", 1.0, 0));

        // 2 tokens/s for 3 seconds refills 6.
        assert!(limiter.consume("k", 6.0, 3_000));
        assert!(!limiter.consume("k", 1.0, 3_000));

        // A long idle period refills to capacity, never beyond.
        assert!(!limiter.consume("k", 11.0, 1_000_000));
        assert!(limiter.consume("k", 10.0, 1_000_000));
    }

    #[test]
    fn test_no_token_creation_beyond_refill() {
        let limiter = MemoryRateLimiter::new(100.0, 10.0);
        let window_ms = 5_000u64;

        let mut admitted = 0.0;
        for ms in (0..window_ms).step_by(50) {
            if limiter.consume("k", 3.0, ms) {
                admitted += 3.0;
            }
        }

        let max_allowed = 100.0 + (window_ms as f64 / 1000.0) * 10.0;
        assert!(admitted <= max_allowed, "{admitted} > {max_allowed}");
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = MemoryRateLimiter::new(5.0, 0.0);

        assert!(limiter.consume("a", 5.0, 0));
        assert!(!limiter.consume("a", 1.0, 0));
        assert!(limiter.consume("b", 5.0, 0));
    }

    #[test]
    fn test_out_of_order_timestamps_do_not_rewind() {
        let limiter = MemoryRateLimiter::new(10.0, 1.0);

        assert!(limiter.consume("k", 5.0, 10_000));
        // An older timestamp must not produce a negative elapsed refill.
        assert!(limiter.consume("k", 5.0, 1_000));
        assert!(!limiter.consume("k", 1.0, 1_000));
    }
}
