//! Time-related traits for dependency injection.
//!
//! History ids and backoff delays both depend on the clock. Abstracting them
//! behind traits lets tests assert exact delays and timestamps without
//! actually waiting.

use async_trait::async_trait;
use std::time::Duration;

/// Trait for providing timestamps.
///
/// # Example
///
/// ```
/// use flowgen::clock::{TimeProvider, SystemTimeProvider};
///
/// let provider = SystemTimeProvider;
/// assert!(provider.now_millis() > 0);
/// ```
pub trait TimeProvider: Send + Sync {
    /// Returns the current Unix timestamp in milliseconds.
    fn now_millis(&self) -> i64;

    /// Returns the current time as an RFC 3339 string.
    fn now_rfc3339(&self) -> String {
        chrono::DateTime::from_timestamp_millis(self.now_millis())
            .unwrap_or_default()
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}

/// Default time provider using system time.
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Trait for waiting between retry attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedTime(i64);

    impl TimeProvider for FixedTime {
        fn now_millis(&self) -> i64 {
            self.0
        }
    }

    #[test]
    fn test_rfc3339_from_fixed_time() {
        let time = FixedTime(1_700_000_000_123);
        assert_eq!(time.now_rfc3339(), "2023-11-14T22:13:20.123Z");
    }

    #[tokio::test]
    async fn test_tokio_sleeper_zero_duration_returns() {
        TokioSleeper.sleep(Duration::ZERO).await;
    }
}
