//! Task manager configuration

use std::time::Duration;

/// Default interval between polling passes.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;

/// Configuration for the task manager polling loop.
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// How often to look for due tasks (default: 3 seconds)
    pub poll_interval: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl TaskManagerConfig {
    /// Create TaskManagerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TALLY_TASK_POLL_INTERVAL_MS`: Polling interval in milliseconds (default: 3000)
    pub fn from_env() -> Self {
        let poll_interval = Duration::from_millis(
            std::env::var("TALLY_TASK_POLL_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|ms: &u64| *ms > 0)
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        );

        Self { poll_interval }
    }
}
