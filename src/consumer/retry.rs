//! Retry policy for broker polls and offset commits
//!
//! Per-record processing is never retried: a record that fails is captured and
//! committed. Only broker-level operations go through [`RetryExecutor`].

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on `max_retries`
const MAX_RETRY_ATTEMPTS: u32 = 1000;
/// Upper bound on any configured backoff
const MAX_BACKOFF: Duration = Duration::from_secs(3600);

fn out_of_range<E: serde::de::Error>(field: &str, value: impl fmt::Debug, max: impl fmt::Debug) -> E {
    E::custom(format!("{} {:?} is out of range (max {:?})", field, value, max))
}

fn bounded_retries<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    match u32::deserialize(deserializer)? {
        n if n <= MAX_RETRY_ATTEMPTS => Ok(n),
        n => Err(out_of_range("max_retries", n, MAX_RETRY_ATTEMPTS)),
    }
}

fn bounded_backoff<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    match Duration::deserialize(deserializer)? {
        d if d <= MAX_BACKOFF => Ok(d),
        d => Err(out_of_range("backoff", d, MAX_BACKOFF)),
    }
}

/// Fixed-backoff retry policy with validated bounds
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    #[serde(deserialize_with = "bounded_retries")]
    pub max_retries: u32,
    /// Delay before every retry
    #[serde(deserialize_with = "bounded_backoff")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    /// Three retries, one second apart
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Delay before the given retry; the first attempt runs immediately
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.backoff
        }
    }

    /// Check if we should retry
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Retry result
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Success, possibly after retries
    Success { value: T, attempts: u32 },
    /// Failed after exhausting retries or on a non-retryable error
    Failed { error: E, attempts: u32 },
}

impl<T, E> RetryResult<T, E> {
    /// Collapse into a plain `Result`
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success { value, .. } => Ok(value),
            RetryResult::Failed { error, .. } => Err(error),
        }
    }
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create a new retry executor
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute with a custom retry predicate
    pub async fn execute_with_predicate<F, Fut, P, T, E>(
        &self,
        mut operation: F,
        mut should_retry: P,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return RetryResult::Success {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    if !self.policy.should_retry(attempt) || !should_retry(&error) {
                        warn!("Operation failed after {} attempts: {}", attempt + 1, error);
                        return RetryResult::Failed {
                            error,
                            attempts: attempt,
                        };
                    }

                    attempt += 1;
                    let backoff = self.policy.next_backoff(attempt);

                    warn!(
                        "Operation failed (attempt {}), retrying in {:?}: {}",
                        attempt, backoff, error
                    );

                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_default_is_fixed() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.next_backoff(0), Duration::ZERO);
        assert_eq!(policy.next_backoff(1), Duration::from_secs(1));
        assert_eq!(policy.next_backoff(3), Duration::from_secs(1));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(5));
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::fixed(0, Duration::ZERO).should_retry(0));
    }

    #[tokio::test]
    async fn test_retry_executor_recovers() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(2, Duration::from_millis(5)));
        let count = Arc::new(AtomicU32::new(0));

        let counter = count.clone();
        let result = executor
            .execute_with_predicate(
                move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err("temporary error")
                        } else {
                            Ok("committed")
                        }
                    }
                },
                |_| true,
            )
            .await;

        match result {
            RetryResult::Success { value, attempts } => {
                assert_eq!(value, "committed");
                assert_eq!(attempts, 2);
            }
            RetryResult::Failed { .. } => panic!("Expected success"),
        }
    }

    #[tokio::test]
    async fn test_predicate_stops_early() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(5, Duration::from_millis(5)));
        let count = Arc::new(AtomicU32::new(0));

        let counter = count.clone();
        let result: RetryResult<(), &str> = executor
            .execute_with_predicate(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err("permanent") }
                },
                |_| false,
            )
            .await;

        assert!(result.into_result().is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(3, Duration::from_millis(1)));
        let count = Arc::new(AtomicU32::new(0));

        let counter = count.clone();
        let result: RetryResult<(), &str> = executor
            .execute_with_predicate(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err("broker down") }
                },
                |_| true,
            )
            .await;

        match result {
            RetryResult::Failed { error, attempts } => {
                assert_eq!(error, "broker down");
                assert_eq!(attempts, 3);
            }
            RetryResult::Success { .. } => panic!("Expected failure"),
        }
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_retry_policy_validation() {
        let valid = r#"{"max_retries": 5, "backoff": {"secs": 1, "nanos": 0}}"#;
        let policy: RetryPolicy = serde_json::from_str(valid).unwrap();
        assert_eq!(policy, RetryPolicy::fixed(5, Duration::from_secs(1)));

        let too_many = r#"{"max_retries": 10000}"#;
        assert!(serde_json::from_str::<RetryPolicy>(too_many).is_err());

        let too_long = r#"{"backoff": {"secs": 7200, "nanos": 0}}"#;
        assert!(serde_json::from_str::<RetryPolicy>(too_long).is_err());

        // Exponential growth and jitter are not supported
        let exponential = r#"{"exponential": true}"#;
        assert!(serde_json::from_str::<RetryPolicy>(exponential).is_err());
    }
}
