//! Retry/timeout controller for a single generation.
//!
//! Wraps one provider call with:
//!
//! - a hard per-attempt timeout (the attempt future is dropped, which aborts
//!   the in-flight request),
//! - an overall generation deadline that is authoritative for giving up,
//! - exponential-backoff retry, only for errors the policy deems retryable
//!   (by default: "service overloaded"),
//! - periodic best-effort status reports while an attempt is outstanding,
//! - external cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Sleeper, TokioSleeper};
use crate::error::GenerationError;

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);
pub const SLOW_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_GENERATION: Duration = Duration::from_secs(180);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Timing and retry limits for one generation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    pub max_generation: Duration,
    pub max_retries: u32,
    pub status_interval: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub is_retryable: fn(&GenerationError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            max_generation: DEFAULT_MAX_GENERATION,
            max_retries: DEFAULT_MAX_RETRIES,
            status_interval: DEFAULT_STATUS_INTERVAL,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(10_000),
            is_retryable: GenerationError::is_overloaded,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `retry` (1-indexed): `min(base * 2^(retry-1), max)`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Executes attempts under a [`RetryPolicy`].
pub struct RetryController {
    label: String,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryController {
    /// `label` is the provider's human name, used in status and error text.
    pub fn new(label: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            label: label.into(),
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Runs `attempt` until it succeeds, fails terminally, the overall
    /// deadline fires, or `cancel` is triggered.
    pub async fn execute<T, F, Fut, S>(
        &self,
        mut attempt: F,
        cancel: &CancellationToken,
        on_status: S,
    ) -> Result<T, GenerationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
        S: Fn(String),
    {
        let started = Instant::now();
        let attempts = self.run_attempts(&mut attempt, started, &on_status);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(provider = %self.label, "Generation cancelled");
                Err(GenerationError::Cancelled)
            }
            outcome = tokio::time::timeout(self.policy.max_generation, attempts) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(provider = %self.label, "Maximum generation time exceeded, aborting");
                    Err(GenerationError::overall_timeout(&self.label, self.policy.max_generation))
                }
            },
        }
    }

    async fn run_attempts<T, F, Fut, S>(
        &self,
        attempt: &mut F,
        started: Instant,
        on_status: &S,
    ) -> Result<T, GenerationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
        S: Fn(String),
    {
        let mut retries = 0;

        loop {
            match self.run_single(attempt(), started, on_status).await {
                Ok(value) => return Ok(value),
                Err(err) if (self.policy.is_retryable)(&err) => {
                    if retries >= self.policy.max_retries {
                        warn!(provider = %self.label, retries, "Still overloaded, giving up");
                        return Err(GenerationError::Overloaded {
                            label: self.label.clone(),
                            retries,
                        });
                    }
                    retries += 1;
                    let delay = self.policy.backoff_delay(retries);
                    info!(
                        provider = %self.label,
                        retry = retries,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Provider overloaded, retrying"
                    );
                    self.sleeper.sleep(delay).await;
                }
                Err(err) => {
                    debug!(provider = %self.label, error = %err, "Attempt failed, not retryable");
                    return Err(err);
                }
            }
        }
    }

    async fn run_single<T, Fut, S>(
        &self,
        attempt: Fut,
        started: Instant,
        on_status: &S,
    ) -> Result<T, GenerationError>
    where
        Fut: Future<Output = Result<T, GenerationError>>,
        S: Fn(String),
    {
        tokio::pin!(attempt);
        let deadline = tokio::time::sleep(self.policy.attempt_timeout);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.policy.status_interval,
            self.policy.status_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut attempt => return result,
                _ = &mut deadline => {
                    warn!(provider = %self.label, "Request aborted due to timeout");
                    return Err(GenerationError::TimedOut {
                        secs: self.policy.attempt_timeout.as_secs(),
                    });
                }
                _ = ticker.tick() => {
                    on_status(format!(
                        "Still waiting for {} response... ({}s elapsed)",
                        self.label,
                        started.elapsed().as_secs()
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Sleeper that returns immediately and remembers every requested delay.
    #[derive(Default)]
    pub struct RecordingSleeper {
        pub delays: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        pub fn delays(&self) -> Vec<Duration> {
            self.delays.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingSleeper;
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn overloaded() -> GenerationError {
        GenerationError::Provider("Claude API Error: Overloaded".to_string())
    }

    fn controller(sleeper: Arc<RecordingSleeper>) -> RetryController {
        RetryController::new("Test Provider", RetryPolicy::default()).with_sleeper(sleeper)
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5)
            .map(|k| policy.backoff_delay(k).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 10_000, 10_000]);
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(10_000));
    }

    #[tokio::test]
    async fn test_succeeds_after_two_overloaded_attempts() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let attempts = AtomicU32::new(0);

        let result = controller(sleeper.clone())
            .execute(
                || {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    async move { if n < 2 { Err(overloaded()) } else { Ok("done") } }
                },
                &CancellationToken::new(),
                |_| {},
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(2000), Duration::from_millis(4000)]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_retries_plus_one_attempts() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = controller(sleeper.clone())
            .execute(
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err(overloaded()) }
                },
                &CancellationToken::new(),
                |_| {},
            )
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("still overloaded after 3 retries"));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(sleeper.delays().len(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = controller(sleeper.clone())
            .execute(
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err(GenerationError::Provider("Invalid API Key".to_string())) }
                },
                &CancellationToken::new(),
                |_| {},
            )
            .await;

        assert_eq!(
            result.unwrap_err(),
            GenerationError::Provider("Invalid API Key".to_string())
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_terminal() {
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(20),
            ..RetryPolicy::default()
        };
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = RetryController::new("Slow", policy)
            .with_sleeper(Arc::new(RecordingSleeper::default()))
            .execute(
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    std::future::pending()
                },
                &CancellationToken::new(),
                |_| {},
            )
            .await;

        assert_eq!(result.unwrap_err(), GenerationError::TimedOut { secs: 0 });
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overall_deadline_wins_over_retries() {
        let policy = RetryPolicy {
            max_generation: Duration::from_millis(50),
            max_retries: 1000,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        };

        let result: Result<(), _> = RetryController::new("Busy", policy)
            .execute(|| async { Err(overloaded()) }, &CancellationToken::new(), |_| {})
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, GenerationError::OverallTimeout { .. }));
        assert!(err.to_string().contains("The Busy API might be overloaded"));
    }

    #[tokio::test]
    async fn test_status_reports_while_waiting() {
        let policy = RetryPolicy {
            status_interval: Duration::from_millis(10),
            ..RetryPolicy::default()
        };
        let statuses = Mutex::new(Vec::new());

        let result = RetryController::new("Groq", policy)
            .execute(
                || async {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    Ok(1)
                },
                &CancellationToken::new(),
                |status| statuses.lock().unwrap().push(status),
            )
            .await;

        assert_eq!(result.unwrap(), 1);
        let statuses = statuses.lock().unwrap();
        assert!(statuses.len() >= 2, "got {:?}", statuses);
        assert!(statuses[0].starts_with("Still waiting for Groq response... ("));
        assert!(statuses[0].ends_with("s elapsed)"));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_attempt() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = RetryController::new("Any", RetryPolicy::default())
            .execute(std::future::pending, &cancel, |_| {})
            .await;

        assert_eq!(result.unwrap_err(), GenerationError::Cancelled);
    }
}
