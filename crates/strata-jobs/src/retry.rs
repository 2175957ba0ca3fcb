//! Retry policy for retryable job failures.

use std::time::Duration;

use strata_core::defaults;

use crate::config::{env_flag, env_parse};

/// How many times a job may run and how long it waits between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first run.
    pub max_attempts: i32,
    /// Base delay before a failed job becomes claimable again.
    pub backoff_ms: u64,
    /// Double the delay for each attempt already made.
    pub exponential: bool,
    /// Upper bound for exponential delays.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::JOB_RETRY_ATTEMPTS,
            backoff_ms: defaults::JOB_RETRY_BACKOFF_MS,
            exponential: false,
            max_backoff_ms: defaults::JOB_RETRY_BACKOFF_MAX_MS,
        }
    }
}

impl RetryPolicy {
    /// Create policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_RETRY_ATTEMPTS` | `3` | Max attempts per job |
    /// | `JOB_RETRY_BACKOFF_MS` | `5000` | Base backoff |
    /// | `JOB_RETRY_EXPONENTIAL` | `false` | Exponential backoff |
    /// | `JOB_RETRY_BACKOFF_MAX_MS` | `300000` | Backoff cap |
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_parse("JOB_RETRY_ATTEMPTS", defaults::JOB_RETRY_ATTEMPTS).max(1),
            backoff_ms: env_parse("JOB_RETRY_BACKOFF_MS", defaults::JOB_RETRY_BACKOFF_MS),
            exponential: env_flag("JOB_RETRY_EXPONENTIAL", false),
            max_backoff_ms: env_parse(
                "JOB_RETRY_BACKOFF_MAX_MS",
                defaults::JOB_RETRY_BACKOFF_MAX_MS,
            ),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    pub fn with_exponential(mut self, exponential: bool) -> Self {
        self.exponential = exponential;
        self
    }

    /// Delay before the next run, given the attempts already made.
    pub fn delay_for(&self, attempts: i32) -> Duration {
        if !self.exponential {
            return Duration::from_millis(self.backoff_ms);
        }
        let exponent = attempts.saturating_sub(1).clamp(0, 31) as u32;
        let delay = self
            .backoff_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.max_backoff_ms.max(self.backoff_ms));
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff_ignores_attempts() {
        let policy = RetryPolicy::default().with_backoff_ms(250);
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(5), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_ms: 1_000,
            exponential: true,
            max_backoff_ms: 5_000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(5_000));
    }

    #[test]
    fn test_exponential_first_attempt_zero_is_base() {
        let policy = RetryPolicy::default().with_exponential(true);
        assert_eq!(
            policy.delay_for(0),
            Duration::from_millis(defaults::JOB_RETRY_BACKOFF_MS)
        );
    }

    #[test]
    fn test_max_attempts_floor() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts, 1);
    }
}
