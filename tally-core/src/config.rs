//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ConfigError;

/// Retry policy for single-record store writes.
///
/// Delay before retry `n` (1-based) is `min_timeout * factor^(n-1)`, capped at
/// `max_timeout`. A policy with `retries = 3` makes at most four attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub retries: u32,
    pub factor: f64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            factor: 2.0,
            min_timeout: Duration::from_millis(1000),
            max_timeout: Duration::from_millis(3000),
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits between attempts.
    pub fn immediate(retries: u32) -> Self {
        Self {
            retries,
            factor: 1.0,
            min_timeout: Duration::ZERO,
            max_timeout: Duration::ZERO,
        }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay to wait before the given retry (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.min_timeout.as_millis() as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max_timeout.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.factor.is_nan() || self.factor < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.factor".to_string(),
                value: self.factor.to_string(),
                reason: "factor must be at least 1".to_string(),
            });
        }
        if self.min_timeout > self.max_timeout {
            return Err(ConfigError::InvalidValue {
                field: "retry.min_timeout".to_string(),
                value: format!("{}ms", self.min_timeout.as_millis()),
                reason: format!(
                    "must not exceed max_timeout ({}ms)",
                    self.max_timeout.as_millis()
                ),
            });
        }
        Ok(())
    }
}
