//! Controllable time source.
//!
//! Token refill and lock expiry are computed lazily from elapsed wall time,
//! so tests need a clock they can advance deterministically instead of the
//! system clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

/// Clock trait
///
/// Abstraction over wall time in milliseconds that allows mocking for tests.
pub trait Clock: Send + Sync {
    /// Current wall clock time in milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;
}

/// Real clock backed by the system time
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};

        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Mock clock for deterministic tests
///
/// Uses an atomic counter so clones observe the same time.
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<AtomicU64>,
}

impl MockClock {
    /// Create a mock clock at a specific starting time
    pub fn at(now_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(now_ms)),
        }
    }

    /// Advance the clock by a duration
    pub fn advance(&self, duration: Duration) {
        self.now
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Set the clock to an absolute time
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::at(0)
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// `YYYY-MM-DD` (UTC) for a millisecond Unix timestamp
pub fn format_date(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// RFC 3339 UTC timestamp with millisecond precision
pub fn format_rfc3339(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_returns_nonzero() {
        assert!(SystemClock.now_ms() > 0);
    }

    #[test]
    fn test_mock_clock_advance_and_set() {
        let clock = MockClock::at(1_000);
        assert_eq!(clock.now_ms(), 1_000);

        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now_ms(), 1_500);

        clock.set(10_000);
        assert_eq!(clock.now_ms(), 10_000);
    }

    #[test]
    fn test_format_date() {
        assert_eq!(format_date(0), "1970-01-01");
        // 2024-07-03 09:46:40 UTC
        assert_eq!(format_date(1_720_000_000_000), "2024-07-03");
        // Leap day.
        assert_eq!(format_date(1_709_164_800_000), "2024-02-29");
    }

    #[test]
    fn test_format_rfc3339() {
        assert_eq!(format_rfc3339(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(
            format_rfc3339(1_720_000_000_123),
            "2024-07-03T09:46:40.123Z"
        );
    }

    #[test]
    fn test_mock_clock_clones_share_time() {
        let clock = MockClock::at(0);
        let clone = clock.clone();

        clone.advance(Duration::from_millis(100));
        assert_eq!(clock.now_ms(), 100);
    }
}
