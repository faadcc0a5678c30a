//! # Retry
//!
//! Convergence and backoff loops shared by the manager, the workers and the stores.
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metrics_consts::STORE_RETRIES;

#[derive(Clone, Debug)]
/// Parameters for retrying transient store failures.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<Duration>,
    /// Total attempts, including the first one, before giving up.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine the interval to wait after the given (1-based) failed attempt.
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_coefficient
            .saturating_pow(attempt.saturating_sub(1));
        let candidate_interval = self
            .initial_interval
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: Duration,
    pub maximum_interval: Option<Duration>,
    pub max_attempts: u32,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(100),
            maximum_interval: Some(Duration::from_secs(5)),
            max_attempts: 5,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = attempts;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            max_attempts: self.max_attempts,
        }
    }
}

/// Run `action` for as long as `should_continue` holds, sleeping `delay` after
/// each run.
///
/// The predicate is checked before every run, so the action may never run at
/// all. Cancelling `cancel` aborts pending delays and further predicate checks
/// with [`Error::Cancelled`]; a run that is already in flight completes first.
/// An error from `action` ends the loop.
pub async fn loop_with_delay<P, A, Fut>(
    mut should_continue: P,
    mut action: A,
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<()>
where
    P: FnMut() -> bool,
    A: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !should_continue() {
            return Ok(());
        }

        action().await?;

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Run `f` until it succeeds, fails permanently, or `policy.max_attempts` is
/// used up, backing off between attempts.
///
/// Only errors for which [`Error::is_retryable`] holds are retried. Running out
/// of attempts yields [`Error::RetriesExhausted`] carrying the last error.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        attempt = attempt.saturating_add(1);

        let err = match f().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(err);
        }

        if attempt >= max_attempts {
            tracing::error!(operation, attempts = attempt, error = %err, "giving up on store operation");
            return Err(Error::RetriesExhausted {
                operation,
                attempts: attempt,
                source: Box::new(err),
            });
        }

        let delay = policy.retry_interval(attempt);
        tracing::warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient store failure, retrying"
        );
        metrics::counter!(STORE_RETRIES, "operation" => operation).increment(1);

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::build(1, Duration::from_millis(1))
            .max_attempts(max_attempts)
            .provide()
    }

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::build(1, Duration::from_secs(2)).provide();

        assert_eq!(retry_policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(3), Duration::from_secs(2));
    }

    #[test]
    fn test_retry_interval_increases_and_caps() {
        let retry_policy = RetryPolicy::build(2, Duration::from_secs(2))
            .maximum_interval(Duration::from_secs(6))
            .provide();

        assert_eq!(retry_policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), Duration::from_secs(6));
        assert_eq!(retry_policy.retry_interval(40), Duration::from_secs(6));
    }

    #[test]
    fn test_retry_interval_saturates_without_maximum() {
        let mut retry_policy = RetryPolicy::build(10, Duration::from_secs(1)).provide();
        retry_policy.maximum_interval = None;

        assert_eq!(retry_policy.retry_interval(100), Duration::MAX);
    }

    #[tokio::test]
    async fn loop_never_runs_action_when_predicate_is_false() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counted = Arc::clone(&calls);
        loop_with_delay(
            || false,
            || {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Duration::from_millis(1),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn loop_runs_until_predicate_turns_false() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let observed = Arc::clone(&calls);
        let counted = Arc::clone(&calls);
        loop_with_delay(
            || observed.load(Ordering::SeqCst) < 3,
            || {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Duration::from_millis(1),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn loop_cancellation_aborts_pending_delay() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            loop_with_delay(|| true, || async { Ok(()) }, Duration::from_secs(3600), &cancel),
        )
        .await
        .expect("loop should observe cancellation promptly");

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn loop_propagates_action_error() {
        let cancel = CancellationToken::new();
        let result = loop_with_delay(
            || true,
            || async { Err(Error::invalid_state("boom")) },
            Duration::from_millis(1),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counted = Arc::clone(&calls);
        let value = retry_with_backoff(&fast_policy(5), "list_work_items", &cancel, || {
            let counted = Arc::clone(&counted);
            async move {
                if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::unavailable("etcd down"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_retry_permanent_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counted = Arc::clone(&calls);
        let result: Result<()> = retry_with_backoff(&fast_policy(5), "try_claim", &cancel, || {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err(Error::InvalidBucket {
                    bucket_id: 9,
                    bucket_count: 3,
                })
            }
        })
        .await;

        assert!(matches!(result, Err(Error::InvalidBucket { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counted = Arc::clone(&calls);
        let result: Result<()> = retry_with_backoff(&fast_policy(4), "try_claim", &cancel, || {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err(Error::unavailable("etcd down"))
            }
        })
        .await;

        match result {
            Err(Error::RetriesExhausted {
                operation,
                attempts,
                source,
            }) => {
                assert_eq!(operation, "try_claim");
                assert_eq!(attempts, 4);
                assert!(matches!(*source, Error::Unavailable(_)));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> =
            retry_with_backoff(&fast_policy(5), "try_claim", &cancel, || async { Ok(()) }).await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
