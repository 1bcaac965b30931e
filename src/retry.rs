//! Bounded retry with exponential backoff for GitHub API requests.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::error::{GitHubError, Result};

/// Retry budget for a single API request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries for connection errors, timeouts and 502/503/504
    pub max_retries: u32,
    /// First backoff delay for transient errors
    pub initial_delay: Duration,
    /// Backoff growth factor
    pub multiplier: u32,
    /// Retries after a 403 with an exhausted quota
    pub max_rate_limit_retries: u32,
    /// Rate-limit wait is `rate_limit_unit * 2^attempt`
    pub rate_limit_unit: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(5),
            multiplier: 2,
            max_rate_limit_retries: 3,
            rate_limit_unit: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// A policy that never waits, for tests
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            rate_limit_unit: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Runs an operation until it succeeds, fails permanently, or the budget runs out.
///
/// Transient failures and rate limits have separate budgets. Every backoff
/// sleep is counted so callers can observe how often the policy waited.
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    sleeps: AtomicU32,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            sleeps: AtomicU32::new(0),
        }
    }

    /// Number of backoff sleeps taken so far
    pub fn sleeps(&self) -> u32 {
        self.sleeps.load(Ordering::Relaxed)
    }

    /// Delay before transient retry number `attempt` (0-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.config.multiplier.saturating_pow(attempt);
        self.config.initial_delay.saturating_mul(factor)
    }

    /// Delay before rate-limit retry number `attempt` (0-based)
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        self.config
            .rate_limit_unit
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut transient_attempts = 0;
        let mut rate_limit_attempts = 0;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let rate_limited = matches!(err, GitHubError::RateLimited { .. });
            let delay = if rate_limited && rate_limit_attempts < self.config.max_rate_limit_retries {
                let delay = self.rate_limit_delay(rate_limit_attempts);
                rate_limit_attempts += 1;
                warn!(
                    "Rate limit hit on {}, waiting {:?} before retry {}/{}",
                    what, delay, rate_limit_attempts, self.config.max_rate_limit_retries
                );
                delay
            } else if err.is_transient() && transient_attempts < self.config.max_retries {
                let delay = self.backoff_delay(transient_attempts);
                transient_attempts += 1;
                warn!(
                    "{} failed ({}), retrying in {:?} ({}/{})",
                    what, err, delay, transient_attempts, self.config.max_retries
                );
                delay
            } else {
                return Err(err);
            };

            self.sleeps.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    fn rate_limited() -> GitHubError {
        GitHubError::RateLimited {
            remaining: 0,
            reset_at: None,
            authenticated: false,
        }
    }

    #[test]
    fn test_backoff_delays_double() {
        let policy = RetryPolicy::new(RetryConfig::default());
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(10));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(20));

        assert_eq!(policy.rate_limit_delay(0), Duration::from_secs(1));
        assert_eq!(policy.rate_limit_delay(3), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(RetryConfig::immediate());
        let calls = &AtomicUsize::new(0);

        let result = policy
            .run("GET /user", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GitHubError::Network("connection reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(policy.sleeps(), 2);
    }

    #[tokio::test]
    async fn test_transient_budget_is_bounded() {
        let policy = RetryPolicy::new(RetryConfig::immediate());
        let calls = &AtomicUsize::new(0);

        let result: Result<()> = policy
            .run("GET /user", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GitHubError::Api {
                    status: 503,
                    message: "unavailable".into(),
                })
            })
            .await;

        assert_matches!(result, Err(GitHubError::Api { status: 503, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(policy.sleeps(), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let policy = RetryPolicy::new(RetryConfig::immediate());
        let calls = &AtomicUsize::new(0);

        let result: Result<()> = policy
            .run("GET /orgs/nope", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GitHubError::NotFound {
                    what: "Organization 'nope'".into(),
                })
            })
            .await;

        assert_matches!(result, Err(GitHubError::NotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(policy.sleeps(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion_surfaces_rate_limited() {
        let policy = RetryPolicy::new(RetryConfig::immediate());

        let result: Result<()> = policy.run("GET /user/repos", || async { Err(rate_limited()) }).await;

        assert_matches!(result, Err(GitHubError::RateLimited { remaining: 0, .. }));
        assert_eq!(policy.sleeps(), 3);
    }
}
