use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};

/// Exponential backoff with jitter. One policy value is built at startup and
/// handed to whoever needs wrapping — composition, not a mixin on the caller.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Jitter drawn from [0, jitter_factor * delay], de-synchronizing retry
    /// storms across workers.
    pub jitter_factor: f64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_retries: cfg.retry_max_attempts,
            initial_delay: cfg.retry_initial_delay,
            backoff_multiplier: cfg.retry_backoff_multiplier,
            max_delay: cfg.retry_max_delay,
            jitter_factor: 0.1,
        }
    }

    /// Wider jitter for transaction-level retries, where collisions are the
    /// reason we are retrying at all.
    pub fn transaction(cfg: &Config) -> Self {
        Self {
            jitter_factor: 0.25,
            ..Self::from_config(cfg)
        }
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(0.0..=self.jitter_factor.max(f64::EPSILON));
        Duration::from_millis((capped * (1.0 + jitter)) as u64)
    }
}

/// Wraps an operation with bounded retry of transient failures. Permanent
/// (business) failures propagate after exactly one attempt.
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn run<T, F, Fut>(&self, name: &str, op: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.run_classified(name, op, AppError::is_transient).await
    }

    /// `classify` returns true for failures worth retrying; callers may
    /// override the default taxonomy.
    pub async fn run_classified<T, F, Fut, C>(
        &self,
        name: &str,
        mut op: F,
        classify: C,
    ) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
        C: Fn(&AppError) -> bool,
    {
        let mut retry = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if classify(&err) && retry < self.policy.max_retries => {
                    let delay = self.policy.delay_for(retry);
                    retry += 1;
                    warn!(
                        operation = name,
                        attempt = retry,
                        max = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if classify(&err) {
                        error!(
                            operation = name,
                            attempts = retry + 1,
                            error = %err,
                            "transient failure persisted, retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            jitter_factor: 0.1,
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_surfaced() {
        let executor = RetryExecutor::new(fast_policy(3));
        let attempts = AtomicU32::new(0);

        let result: AppResult<()> = executor
            .run("always-timeout", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::Gateway(GatewayError::Timeout)) }
            })
            .await;

        assert!(matches!(result, Err(AppError::Gateway(GatewayError::Timeout))));
        // initial attempt plus three retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_failure_gets_exactly_one_attempt() {
        let executor = RetryExecutor::new(fast_policy(3));
        let attempts = AtomicU32::new(0);

        let result: AppResult<()> = executor
            .run("declined", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::Gateway(GatewayError::Declined("no funds".into()))) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_when_a_retry_succeeds() {
        let executor = RetryExecutor::new(fast_policy(3));
        let attempts = AtomicU32::new(0);

        let result = executor
            .run("flaky", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AppError::Gateway(GatewayError::Unavailable("reset".into())))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn classifier_override_wins() {
        let executor = RetryExecutor::new(fast_policy(2));
        let attempts = AtomicU32::new(0);

        // treat everything as permanent
        let result: AppResult<()> = executor
            .run_classified(
                "no-retries",
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err(AppError::Gateway(GatewayError::Timeout)) }
                },
                |_| false,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(300),
            jitter_factor: 0.0,
        };
        assert!(policy.delay_for(0) >= Duration::from_millis(100));
        assert!(policy.delay_for(1) >= Duration::from_millis(200));
        // capped well below the uncapped 800ms
        assert!(policy.delay_for(3) <= Duration::from_millis(330));
    }
}
