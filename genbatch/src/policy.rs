//! Failure handling configuration of a [`crate::Dispatcher`].
use std::{collections::BTreeSet, time::Duration};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::{
    backoff::{BackoffStrategy, Exponential, Jitter, Strategy},
    dispatcher::ExecutionError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of times a single batch is put back in the queue.
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub jitter: Option<Jitter>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60_000,
            jitter: None,
        }
    }
}

impl RetryPolicy {
    pub fn strategy(&self) -> BackoffStrategy<Exponential> {
        let strategy = BackoffStrategy::exponential(millis(self.backoff_ms))
            .with_multiplier(self.backoff_multiplier)
            .with_max(millis(self.max_backoff_ms));
        match self.jitter {
            Some(jitter) => strategy.with_jitter(jitter),
            None => strategy,
        }
    }

    /// `backoff_ms * backoff_multiplier^(consecutive_failures - 1)` capped at `max_backoff_ms`.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        self.strategy()
            .backoff(consecutive_failures)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

fn millis(value: u64) -> TimeDelta {
    TimeDelta::try_milliseconds(value.min(i64::MAX as u64) as i64).unwrap_or(TimeDelta::MAX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    /// Consecutive batch failures after which a job is paused automatically.
    pub consecutive_failure_threshold: u32,
    pub retry_policy: RetryPolicy,
    pub retryable_errors: BTreeSet<u16>,
    pub fatal_errors: BTreeSet<u16>,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: 5,
            retry_policy: Default::default(),
            retryable_errors: [408, 429, 500, 502, 503, 504].into(),
            fatal_errors: [400, 401, 403, 404, 413, 422].into(),
        }
    }
}

impl FailurePolicy {
    pub fn with_threshold(self, consecutive_failure_threshold: u32) -> Self {
        Self {
            consecutive_failure_threshold,
            ..self
        }
    }

    pub fn with_retry_policy(self, retry_policy: RetryPolicy) -> Self {
        Self {
            retry_policy,
            ..self
        }
    }

    /// Fatal statuses win over retryable ones, statuses in neither set defer to the error
    /// itself. Local errors are never retried.
    pub fn classify(&self, error: &ExecutionError) -> ErrorClass {
        let ExecutionError::Api(error) = error else {
            return ErrorClass::Fatal;
        };
        match error.status {
            Some(status) if self.fatal_errors.contains(&status) => ErrorClass::Fatal,
            Some(status) if self.retryable_errors.contains(&status) => ErrorClass::Retryable,
            _ if error.is_retryable() => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }

    pub(crate) fn should_auto_pause(&self, consecutive_failures: u32) -> bool {
        consecutive_failures >= self.consecutive_failure_threshold
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::collaborators::ApiError;

    #[test]
    fn classification_prefers_fatal_statuses() {
        let mut policy = FailurePolicy::default();
        policy.retryable_errors.insert(400);

        let error = ExecutionError::Api(ApiError::new("bad request").with_status(400).retryable());

        assert_eq!(policy.classify(&error), ErrorClass::Fatal);
    }

    #[test]
    fn classification_of_configured_statuses() {
        let policy = FailurePolicy::default();

        assert_eq!(
            policy.classify(&ApiError::new("slow down").with_status(429).into()),
            ErrorClass::Retryable
        );
        assert_eq!(
            policy.classify(&ApiError::new("too large").with_status(413).into()),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn unknown_statuses_defer_to_the_error() {
        let policy = FailurePolicy::default();

        assert_eq!(
            policy.classify(&ApiError::new("teapot").with_status(418).retryable().into()),
            ErrorClass::Retryable
        );
        assert_eq!(
            policy.classify(&ApiError::new("teapot").with_status(418).into()),
            ErrorClass::Fatal
        );
        assert_eq!(
            policy.classify(&ApiError::new("connection reset").retryable().into()),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn local_errors_are_fatal() {
        let policy = FailurePolicy::default();

        assert_eq!(
            policy.classify(&ExecutionError::MissingModel("unknown".to_owned())),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            backoff_ms: 100,
            backoff_multiplier: 3.0,
            max_backoff_ms: 1_000,
            ..Default::default()
        };

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(300));
        assert_eq!(policy.delay(3), Duration::from_millis(900));
        assert_eq!(policy.delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay(40), Duration::from_millis(1_000));
    }

    #[test]
    fn deserializes_partial_policy() {
        let policy: FailurePolicy = serde_json::from_str(
            r#"{
                "consecutive_failure_threshold": 2,
                "retry_policy": { "backoff_ms": 250, "jitter": { "relative": 0.1 } },
                "fatal_errors": [400]
            }"#,
        )
        .unwrap();

        assert_eq!(policy.consecutive_failure_threshold, 2);
        assert_eq!(policy.retry_policy.backoff_ms, 250);
        assert_eq!(policy.retry_policy.max_retries, 3);
        assert_matches!(policy.retry_policy.jitter, Some(Jitter::Relative(_)));
        assert_eq!(policy.fatal_errors, BTreeSet::from([400]));
        assert!(policy.retryable_errors.contains(&429));
    }
}
