//! Bounded retries with backoff for resource acquisition.
//!
//! Only acquisition failures (image pulls, dataset downloads, pipeline
//! fetches) are retried; stage execution failures never are.

use crate::errors::LabflowError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to avoid synchronized retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
}

/// Configuration for acquisition retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the initial one.
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates a config with a different attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// The delay before retrying after `attempt` failures (1-indexed),
    /// capped and jittered.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = match self.backoff {
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1))),
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Constant => self.base_delay_ms,
        };
        let capped = base.min(self.max_delay_ms);
        Duration::from_millis(apply_jitter(self.jitter, capped))
    }
}

fn apply_jitter(jitter: JitterStrategy, delay_ms: u64) -> u64 {
    let mut rng = rand::thread_rng();
    match jitter {
        JitterStrategy::None => delay_ms,
        JitterStrategy::Full => rng.gen_range(0..=delay_ms),
        JitterStrategy::Equal => {
            let half = delay_ms / 2;
            half + rng.gen_range(0..=half)
        }
    }
}

/// Runs an acquisition operation with bounded retries.
///
/// Non-retryable errors surface immediately; retryable ones are retried up
/// to the attempt budget with backoff in between.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    subject: &str,
    mut operation: F,
) -> Result<T, LabflowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LabflowError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < config.max_attempts => {
                let delay = config.delay(attempt);
                warn!(
                    subject = subject,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Acquisition failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            base_delay_ms: 100,
            jitter: JitterStrategy::None,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_exponential_delay() {
        let config = no_jitter();
        assert_eq!(config.delay(1), Duration::from_millis(100));
        assert_eq!(config.delay(2), Duration::from_millis(200));
        assert_eq!(config.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            max_delay_ms: 1500,
            jitter: JitterStrategy::None,
            ..RetryConfig::default()
        };
        assert_eq!(config.delay(10), Duration::from_millis(1500));
    }

    #[test]
    fn test_linear_delay() {
        let config = RetryConfig {
            backoff: BackoffStrategy::Linear,
            ..no_jitter()
        };
        assert_eq!(config.delay(3), Duration::from_millis(300));
    }

    #[test]
    fn test_full_jitter_bounds() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            jitter: JitterStrategy::Full,
            ..RetryConfig::default()
        };
        for _ in 0..50 {
            assert!(config.delay(1) <= Duration::from_millis(1000));
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let config = RetryConfig {
            base_delay_ms: 1,
            jitter: JitterStrategy::None,
            ..RetryConfig::default()
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = with_retry(&config, "test", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LabflowError::acquisition("test", "transient"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let config = RetryConfig {
            base_delay_ms: 1,
            max_attempts: 2,
            jitter: JitterStrategy::None,
            ..RetryConfig::default()
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<(), _> = with_retry(&config, "test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LabflowError::acquisition("test", "still down"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_not_retried() {
        let config = no_jitter();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<(), _> = with_retry(&config, "test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LabflowError::Environment("no runtime".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
