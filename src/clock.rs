//! Deterministic clock abstraction for testable time-dependent logic.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};

/// Clock trait for deterministic time in tests.
pub trait Clock: Send + Sync {
    /// Get the current UTC time.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Get the current wall-clock time at the given offset, without zone.
    ///
    /// Key expiry dates are stored as naive local dates, so they are
    /// compared against this value rather than against UTC.
    fn now_local(&self, offset: FixedOffset) -> NaiveDateTime {
        self.now_utc().with_timezone(&offset).naive_local()
    }
}

/// System clock using actual wall time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mock clock for deterministic testing.
///
/// The instant sits behind a mutex so a clock shared through an `Arc`
/// can still be advanced by the test that owns it.
#[cfg(any(test, feature = "test-seams"))]
#[derive(Debug)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(any(test, feature = "test-seams"))]
impl MockClock {
    /// Create a mock clock frozen at the given time.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    /// Create a mock clock from an RFC 3339 string.
    pub fn from_rfc3339(s: &str) -> Self {
        Self::new(
            DateTime::parse_from_rfc3339(s)
                .expect("valid RFC 3339")
                .with_timezone(&Utc),
        )
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += duration;
    }
}

#[cfg(any(test, feature = "test-seams"))]
impl Clock for MockClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn system_clock_returns_time() {
        let clock = SystemClock;
        let now = clock.now_utc();
        assert!(now.year() >= 2024);
    }

    #[test]
    fn mock_clock_is_deterministic() {
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        assert_eq!(clock.now_utc().to_rfc3339(), "2025-01-15T12:00:00+00:00");
        assert_eq!(clock.now_utc().to_rfc3339(), "2025-01-15T12:00:00+00:00");
    }

    #[test]
    fn mock_clock_advances_through_shared_reference() {
        let clock = std::sync::Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let shared = clock.clone();
        shared.advance(chrono::Duration::hours(1));
        assert_eq!(clock.now_utc().to_rfc3339(), "2025-01-15T13:00:00+00:00");
    }

    #[test]
    fn now_local_applies_offset() {
        let clock = MockClock::from_rfc3339("2025-01-15T20:30:00Z");
        let offset = FixedOffset::east_opt(7 * 3600).unwrap();
        let local = clock.now_local(offset);
        assert_eq!(local.day(), 16);
        assert_eq!(local.hour(), 3);
    }
}
