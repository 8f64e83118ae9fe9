//! Incremental id configuration

use std::time::Duration;

use tally_core::{ConfigError, RetryPolicy, MAX_PER_PAGE};
use tally_tasks::{parse_interval, Schedule};

use crate::constants::{
    DEFAULT_CASES_PAGE_SIZE, DEFAULT_INCREMENTAL_ID_INTERVAL, DEFAULT_MAX_RUN_DURATION_MS,
    DEFAULT_RETRY_FACTOR, DEFAULT_RETRY_MAX_TIMEOUT_MS, DEFAULT_RETRY_MIN_TIMEOUT_MS,
    DEFAULT_UPDATE_RETRIES, DEFAULT_USE_INCREMENTER_CACHE,
};

/// Configuration for the incremental id service and its task.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalIdConfig {
    /// Schedule interval of the assignment task (default: "1m")
    pub interval: String,

    /// Wall-clock budget of one run. Cases left over are picked up by the
    /// next run (default: 50 seconds)
    pub max_run_duration: Duration,

    /// Maximum number of unassigned cases fetched per run (default: 10000)
    pub page_size: usize,

    /// Backoff policy for single case updates
    pub retry: RetryPolicy,

    /// Keep the per-namespace incrementer objects in step (default: false)
    pub use_incrementer_cache: bool,
}

impl Default for IncrementalIdConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INCREMENTAL_ID_INTERVAL.to_string(),
            max_run_duration: Duration::from_millis(DEFAULT_MAX_RUN_DURATION_MS),
            page_size: DEFAULT_CASES_PAGE_SIZE,
            retry: RetryPolicy {
                retries: DEFAULT_UPDATE_RETRIES,
                factor: DEFAULT_RETRY_FACTOR,
                min_timeout: Duration::from_millis(DEFAULT_RETRY_MIN_TIMEOUT_MS),
                max_timeout: Duration::from_millis(DEFAULT_RETRY_MAX_TIMEOUT_MS),
            },
            use_incrementer_cache: DEFAULT_USE_INCREMENTER_CACHE,
        }
    }
}

impl IncrementalIdConfig {
    /// Create IncrementalIdConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TALLY_INCREMENTAL_ID_INTERVAL`: Task schedule interval (default: "1m")
    /// - `TALLY_INCREMENTAL_ID_MAX_DURATION_MS`: Run time budget (default: 50000)
    /// - `TALLY_INCREMENTAL_ID_PAGE_SIZE`: Cases fetched per run (default: 10000)
    /// - `TALLY_INCREMENTAL_ID_RETRIES`: Retries per case update (default: 3)
    /// - `TALLY_INCREMENTAL_ID_RETRY_FACTOR`: Backoff factor (default: 2)
    /// - `TALLY_INCREMENTAL_ID_RETRY_MIN_TIMEOUT_MS`: First retry delay (default: 1000)
    /// - `TALLY_INCREMENTAL_ID_RETRY_MAX_TIMEOUT_MS`: Retry delay cap (default: 3000)
    /// - `TALLY_INCREMENTAL_ID_USE_INCREMENTER`: Maintain incrementer objects (default: false)
    pub fn from_env() -> Self {
        let interval = std::env::var("TALLY_INCREMENTAL_ID_INTERVAL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_INCREMENTAL_ID_INTERVAL.to_string());

        let max_run_duration = Duration::from_millis(
            std::env::var("TALLY_INCREMENTAL_ID_MAX_DURATION_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_RUN_DURATION_MS),
        );

        let page_size = std::env::var("TALLY_INCREMENTAL_ID_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CASES_PAGE_SIZE);

        let retries = std::env::var("TALLY_INCREMENTAL_ID_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_UPDATE_RETRIES);

        let factor = std::env::var("TALLY_INCREMENTAL_ID_RETRY_FACTOR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RETRY_FACTOR);

        let min_timeout = Duration::from_millis(
            std::env::var("TALLY_INCREMENTAL_ID_RETRY_MIN_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RETRY_MIN_TIMEOUT_MS),
        );

        let max_timeout = Duration::from_millis(
            std::env::var("TALLY_INCREMENTAL_ID_RETRY_MAX_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RETRY_MAX_TIMEOUT_MS),
        );

        let use_incrementer_cache = std::env::var("TALLY_INCREMENTAL_ID_USE_INCREMENTER")
            .ok()
            .map(|s| s == "true" || s == "1")
            .unwrap_or(DEFAULT_USE_INCREMENTER_CACHE);

        Self {
            interval,
            max_run_duration,
            page_size,
            retry: RetryPolicy {
                retries,
                factor,
                min_timeout,
                max_timeout,
            },
            use_incrementer_cache,
        }
    }

    /// Short intervals and no backoff, for local development and tests.
    pub fn development() -> Self {
        Self {
            interval: "10s".to_string(),
            max_run_duration: Duration::from_secs(5),
            page_size: 100,
            retry: RetryPolicy::immediate(DEFAULT_UPDATE_RETRIES),
            use_incrementer_cache: false,
        }
    }

    /// Production defaults with the incrementer cache enabled.
    pub fn production() -> Self {
        Self {
            use_incrementer_cache: true,
            ..Self::default()
        }
    }

    /// Schedule of the assignment task.
    pub fn schedule(&self) -> Schedule {
        Schedule::every(self.interval.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_interval(&self.interval)?;
        if self.max_run_duration.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "max_run_duration".to_string(),
                value: "0ms".to_string(),
                reason: "a run needs a non-zero time budget".to_string(),
            });
        }
        if self.page_size == 0 || self.page_size > MAX_PER_PAGE {
            return Err(ConfigError::InvalidValue {
                field: "page_size".to_string(),
                value: self.page_size.to_string(),
                reason: format!("must be between 1 and {MAX_PER_PAGE}"),
            });
        }
        self.retry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = IncrementalIdConfig::default();
        assert_eq!(config.interval, "1m");
        assert_eq!(config.max_run_duration, Duration::from_millis(50_000));
        assert_eq!(config.page_size, 10_000);
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(!config.use_incrementer_cache);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_development() {
        let config = IncrementalIdConfig::development();
        assert_eq!(config.interval, "10s");
        assert_eq!(config.retry.delay_for_retry(1), Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_production() {
        let config = IncrementalIdConfig::production();
        assert!(config.use_incrementer_cache);
        assert_eq!(config.interval, "1m");
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Without environment variables set, should use defaults
        let config = IncrementalIdConfig::from_env();
        assert_eq!(config.page_size, DEFAULT_CASES_PAGE_SIZE);
        assert_eq!(config.retry.retries, DEFAULT_UPDATE_RETRIES);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_interval = IncrementalIdConfig {
            interval: "often".to_string(),
            ..Default::default()
        };
        assert!(bad_interval.validate().is_err());

        let zero_budget = IncrementalIdConfig {
            max_run_duration: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_budget.validate().is_err());

        let huge_page = IncrementalIdConfig {
            page_size: MAX_PER_PAGE + 1,
            ..Default::default()
        };
        assert!(huge_page.validate().is_err());
    }

    #[test]
    fn test_schedule_uses_interval() {
        let config = IncrementalIdConfig::default();
        assert_eq!(config.schedule().to_string(), "1m");
    }
}
