//! Reconnection policy with exponential backoff

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

use crate::classify::ClassifiedError;
use crate::config::ReconnectConfig;

/// Backoff multiplier between attempts
pub const BACKOFF_FACTOR: f32 = 2.0;

/// Fallback base delay for categories without a default
const FALLBACK_BASE_DELAY: Duration = Duration::from_secs(1);

/// Reconnection policy
#[derive(Debug, Clone)]
pub struct ReconnectionPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Total connect attempts, first one included
    pub max_attempts: u32,
    /// Base delay overriding the per-category default
    pub base_delay: Option<Duration>,
    /// Maximum delay between attempts
    pub max_delay: Duration,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::new(&ReconnectConfig::default())
    }
}

impl ReconnectionPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }

    /// Policy that never retries
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether another attempt should follow failed attempt number `attempt`
    /// (zero based)
    #[must_use]
    pub fn should_retry(&self, attempt: u32, error: &ClassifiedError) -> bool {
        self.enabled && attempt + 1 < self.max_attempts && error.is_recoverable()
    }

    /// Base delay used for an error: the override, else the category default
    #[must_use]
    pub fn base_delay_for(&self, error: &ClassifiedError) -> Duration {
        self.base_delay
            .or_else(|| error.retry_after())
            .unwrap_or(FALLBACK_BASE_DELAY)
    }

    /// Delay before the retry following failed attempt `attempt`:
    /// `base * 2^attempt`, capped at `max_delay`
    #[must_use]
    pub fn delay_for(&self, error: &ClassifiedError, attempt: u32) -> Duration {
        let base = self.base_delay_for(error).min(self.max_delay);
        let step = attempt as usize;
        self.backoff(base, step + 1)
            .nth(step)
            .unwrap_or(self.max_delay)
    }

    fn backoff(&self, base: Duration, times: usize) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(base)
            .with_max_delay(self.max_delay)
            .with_factor(BACKOFF_FACTOR)
            .with_max_times(times)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::classify::{ErrorCategory, ErrorContext, classify};

    fn transport_error() -> ClassifiedError {
        ClassifiedError::new(
            ErrorCategory::Transport,
            "stream ended",
            &ErrorContext::operation("connect"),
        )
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = ReconnectionPolicy {
            enabled: true,
            max_attempts: 10,
            base_delay: Some(Duration::from_millis(100)),
            max_delay: Duration::from_millis(500),
        };
        let err = transport_error();
        assert_eq!(policy.delay_for(&err, 0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(&err, 1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(&err, 2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(&err, 3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(&err, 9), Duration::from_millis(500));
    }

    #[test]
    fn category_default_used_without_override() {
        let policy = ReconnectionPolicy::default();
        let err = transport_error();
        assert_eq!(policy.base_delay_for(&err), Duration::from_millis(500));
        assert_eq!(policy.delay_for(&err, 1), Duration::from_secs(1));
    }

    #[test]
    fn retry_bounded_by_attempts_and_recoverability() {
        let policy = ReconnectionPolicy {
            max_attempts: 3,
            ..ReconnectionPolicy::default()
        };
        let err = transport_error();
        assert!(policy.should_retry(0, &err));
        assert!(policy.should_retry(1, &err));
        assert!(!policy.should_retry(2, &err));

        let config = classify(
            Error::Config("bad".into()),
            &ErrorContext::operation("connect"),
        );
        assert!(!policy.should_retry(0, &config));
        assert!(!ReconnectionPolicy::disabled().should_retry(0, &err));
    }
}
