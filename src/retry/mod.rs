//! Bounded retry with exponential backoff around remote calls.
//!
//! Every namespace call goes through a [`RetryingExecutor`]. After failed
//! attempt `n` (1-based) the executor sleeps `2^n × base_delay` and tries
//! again, up to `max_attempts` attempts in total. There is no jitter and no
//! sleep after the final attempt; the last error is returned.
//!
//! Sleeping is delegated to a [`Sleeper`], so tests observe the schedule
//! without waiting for it.

use crate::config::RetryConfig;
use async_trait::async_trait;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Classifies errors the executor may retry.
pub trait Retryable {
    /// Whether another attempt could succeed.
    fn is_retryable(&self) -> bool;
}

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay unit for the exponential schedule
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }

    /// Delay after failed attempt `attempt` (1-based): `2^attempt × base_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Suspends the caller between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested delays and returns immediately. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .map(|delays| delays.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(duration);
        }
    }
}

/// What a retried call cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// Sum of all backoff delays slept
    pub total_backoff: Duration,
}

/// Runs fallible async operations under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryingExecutor {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryingExecutor {
    pub fn new(policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    /// Executor that sleeps on the tokio timer.
    pub fn with_tokio(policy: RetryPolicy) -> Self {
        Self::new(policy, Arc::new(TokioSleeper))
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `operation` until it succeeds, fails terminally, or attempts run out.
    pub async fn execute<T, E, F, Fut>(&self, action: &str, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.execute_with_stats(action, operation).await.0
    }

    /// Like [`execute`](Self::execute), but retries whatever `retry_if` accepts.
    ///
    /// For calls whose transient failures the generic classification
    /// treats as terminal.
    pub async fn execute_if<T, E, P, F, Fut>(
        &self,
        action: &str,
        retry_if: P,
        operation: F,
    ) -> Result<T, E>
    where
        P: Fn(&E) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run(action, retry_if, operation).await.0
    }

    /// Like [`execute`](Self::execute), also reporting attempts and backoff.
    pub async fn execute_with_stats<T, E, F, Fut>(
        &self,
        action: &str,
        operation: F,
    ) -> (Result<T, E>, RetryStats)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.run(action, |error: &E| error.is_retryable(), operation)
            .await
    }

    async fn run<T, E, P, F, Fut>(
        &self,
        action: &str,
        retry_if: P,
        mut operation: F,
    ) -> (Result<T, E>, RetryStats)
    where
        P: Fn(&E) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut stats = RetryStats::default();

        loop {
            stats.attempts += 1;
            let error = match operation().await {
                Ok(value) => return (Ok(value), stats),
                Err(error) => error,
            };

            if !retry_if(&error) || stats.attempts >= self.policy.max_attempts {
                if stats.attempts > 1 {
                    tracing::warn!(
                        action,
                        attempts = stats.attempts,
                        error = %error,
                        "Giving up after retries"
                    );
                }
                return (Err(error), stats);
            }

            let backoff = self.policy.backoff(stats.attempts);
            tracing::info!(
                action,
                attempt = stats.attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Remote call failed, retrying"
            );
            metrics::counter!("busrules_retry_attempts_total").increment(1);

            self.sleeper.sleep(backoff).await;
            stats.total_backoff += backoff;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("fatal")]
        Fatal,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn executor(max_attempts: u32) -> (RetryingExecutor, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::new());
        let policy = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(1),
        };
        (RetryingExecutor::new(policy, sleeper.clone()), sleeper)
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::default();
        assert!(policy.backoff(40) >= policy.backoff(31));
    }

    #[test]
    fn policy_from_config_never_allows_zero_attempts() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 0,
            base_delay_ms: 10,
        });
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn success_on_first_attempt_does_not_sleep() {
        let (executor, sleeper) = executor(5);
        let (result, stats) = executor
            .execute_with_stats("noop", || async { Ok::<_, TestError>(7) })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(stats.attempts, 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error_with_full_schedule() {
        let (executor, sleeper) = executor(5);
        let calls = AtomicU32::new(0);

        let (result, stats) = executor
            .execute_with_stats("always failing", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Transient) }
            })
            .await;

        assert!(matches!(result, Err(TestError::Transient)));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(stats.attempts, 5);
        assert_eq!(
            sleeper.delays(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ]
        );
        assert_eq!(stats.total_backoff, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let (executor, sleeper) = executor(5);
        let calls = AtomicU32::new(0);

        let result = executor
            .execute("flaky", || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        Err(TestError::Transient)
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(sleeper.delays().len(), 2);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let (executor, sleeper) = executor(5);
        let calls = AtomicU32::new(0);

        let result = executor
            .execute("fatal", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Fatal) }
            })
            .await;

        assert!(matches!(result, Err(TestError::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn custom_predicate_overrides_the_classification() {
        let (executor, sleeper) = executor(5);
        let calls = AtomicU32::new(0);

        let result = executor
            .execute_if(
                "fatal but retried",
                |_: &TestError| true,
                || {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if call == 0 {
                            Err(TestError::Fatal)
                        } else {
                            Ok(())
                        }
                    }
                },
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(sleeper.delays(), vec![Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn single_attempt_policy_never_sleeps() {
        let (executor, sleeper) = executor(1);
        let result = executor
            .execute("once", || async { Err::<(), _>(TestError::Transient) })
            .await;

        assert!(result.is_err());
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_waits_for_the_backoff() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(100),
        };
        let executor = RetryingExecutor::with_tokio(policy);
        let started = tokio::time::Instant::now();

        let _ = executor
            .execute("paused clock", || async { Err::<(), _>(TestError::Transient) })
            .await;

        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
