//! Backoff normalization and calculation for job retries.
//!
//! Mirrors the two built-in strategies of the reference implementation
//! (`fixed`, `exponential`) plus a pluggable custom strategy, used by the
//! worker's failure-decision path (`Job::failure_decision`) to compute the
//! concrete delay once a retry (rather than a terminal failure) is decided.

use crate::error::{JobError, JobResult};
use crate::job::BackoffOptions;
use async_trait::async_trait;
use std::sync::Arc;

/// A caller-supplied backoff strategy for `BackoffOptions::Custom`.
///
/// Mirrors the original's `customStrategy(attemptsMade, type, err, job)`
/// callback: given the attempt count and the error, returns the delay in
/// milliseconds, or a negative number to force a terminal failure.
#[async_trait]
pub trait BackoffStrategy: Send + Sync {
    async fn delay(&self, attempts_made: u32, backoff_type: &str, error: &str) -> i64;
}

/// Resolves the millisecond delay for a retry given the job's backoff option
/// and attempt count, consulting `custom` only for `BackoffOptions::Custom`.
pub async fn calculate(
    backoff: &BackoffOptions,
    attempts_made: u32,
    error: &str,
    custom: Option<&Arc<dyn BackoffStrategy>>,
) -> JobResult<i64> {
    match backoff {
        BackoffOptions::Fixed { delay } => Ok(*delay),
        BackoffOptions::Exponential { delay } => {
            let exponent = attempts_made.saturating_sub(1) as i32;
            let scaled = 2f64.powi(exponent) * (*delay as f64);
            Ok(scaled.round() as i64)
        }
        BackoffOptions::Custom { name, .. } => match custom {
            Some(strategy) => Ok(strategy.delay(attempts_made, name, error).await),
            None => Err(JobError::Configuration(format!(
                "unknown backoff strategy {name}: specify a custom strategy when the worker is created"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_backoff_is_constant() {
        let backoff = BackoffOptions::Fixed { delay: 1000 };
        assert_eq!(calculate(&backoff, 1, "err", None).await.unwrap(), 1000);
        assert_eq!(calculate(&backoff, 5, "err", None).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn exponential_backoff_doubles_each_attempt() {
        let backoff = BackoffOptions::Exponential { delay: 1000 };
        assert_eq!(calculate(&backoff, 1, "err", None).await.unwrap(), 1000);
        assert_eq!(calculate(&backoff, 2, "err", None).await.unwrap(), 2000);
        assert_eq!(calculate(&backoff, 3, "err", None).await.unwrap(), 4000);
    }

    struct DoubleCustom;

    #[async_trait]
    impl BackoffStrategy for DoubleCustom {
        async fn delay(&self, attempts_made: u32, _backoff_type: &str, _error: &str) -> i64 {
            attempts_made as i64 * 2000
        }
    }

    #[tokio::test]
    async fn custom_backoff_delegates_to_strategy() {
        let backoff = BackoffOptions::Custom {
            name: "double".into(),
            delay: 0,
        };
        let strategy: Arc<dyn BackoffStrategy> = Arc::new(DoubleCustom);
        let delay = calculate(&backoff, 3, "boom", Some(&strategy)).await.unwrap();
        assert_eq!(delay, 6000);
    }

    #[tokio::test]
    async fn custom_backoff_without_strategy_errors() {
        let backoff = BackoffOptions::Custom {
            name: "double".into(),
            delay: 0,
        };
        let err = calculate(&backoff, 1, "boom", None).await.unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));
    }
}
