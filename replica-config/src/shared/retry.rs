use std::time::Duration;

use serde::Deserialize;

use crate::shared::ValidationError;

/// Backoff policy applied when a batch fails with a transient error.
#[derive(Clone, Debug, Deserialize)]
pub struct RetryConfig {
    /// Consecutive failures tolerated before the worker gives up. `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound for the delay between retries.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f32,
}

impl RetryConfig {
    /// Returns the delay to wait before retry number `attempt` (starting at 1).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay_ms as f64 * (self.backoff_factor as f64).powi(exponent);
        let delay = delay.min(self.max_delay_ms as f64);

        Duration::from_millis(delay as u64)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.backoff_factor < 1.0 {
            return Err(ValidationError::InvalidBackoffFactor(self.backoff_factor));
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_until_capped() {
        let retry = RetryConfig {
            max_attempts: Some(10),
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_factor: 2.0,
        };

        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(retry.delay_for_attempt(5), Duration::from_millis(1_000));
        assert_eq!(retry.delay_for_attempt(60), Duration::from_millis(1_000));
    }

    #[test]
    fn shrinking_backoff_is_rejected() {
        let retry = RetryConfig {
            backoff_factor: 0.5,
            ..RetryConfig::default()
        };

        assert!(matches!(
            retry.validate(),
            Err(ValidationError::InvalidBackoffFactor(_))
        ));
    }
}
