//! Constants for tally-cases
//!
//! Task identifiers, query defaults and configuration defaults used by the
//! incremental id service and its background task.

// ============================================================================
// TASK IDENTITY
// ============================================================================

/// Task type of the incremental id assignment task.
pub const CASES_INCREMENTAL_ID_SYNC_TASK_TYPE: &str = "cases_incremental_id_assignment";

/// Id of the single scheduled instance of the assignment task.
pub const CASES_INCREMENTAL_ID_SYNC_TASK_ID: &str = "Cases:cases_incremental_id_assignment";

/// Version of the task state layout.
pub const CASES_INCREMENTAL_ID_TASK_VERSION: &str = "1.0.0";

/// Scope the task instance is tagged with.
pub const CASES_TASK_SCOPE: &str = "cases";

/// Task title shown by the task manager.
pub const CASES_INCREMENTAL_ID_TASK_TITLE: &str = "Cases Numerical ID assignment";

/// Task description shown by the task manager.
pub const CASES_INCREMENTAL_ID_TASK_DESCRIPTION: &str = "Applying incremental numeric ids to cases";

// ============================================================================
// QUERY DEFAULTS
// ============================================================================

/// Filter matching cases that already carry an incremental id.
pub const INCREMENTAL_ID_EXISTS_FILTER: &str = "cases.attributes.incremental_id: *";

/// Filter matching cases still waiting for an incremental id.
pub const INCREMENTAL_ID_MISSING_FILTER: &str = "not cases.attributes.incremental_id: *";

/// Default sort field when listing cases (creation order).
pub const DEFAULT_CASES_SORT_FIELD: &str = "created_at";

/// Sort field used to find the highest applied id in a namespace.
pub const INCREMENTAL_ID_SORT_FIELD: &str = "incremental_id.numerical_id";

// ============================================================================
// CONFIGURATION DEFAULTS
// ============================================================================

/// Default schedule interval of the assignment task.
pub const DEFAULT_INCREMENTAL_ID_INTERVAL: &str = "1m";

/// Default wall-clock budget of one assignment run, in milliseconds.
pub const DEFAULT_MAX_RUN_DURATION_MS: u64 = 50_000;

/// Default page size when fetching cases without an id.
pub const DEFAULT_CASES_PAGE_SIZE: usize = 10_000;

/// Default number of retries for a single case update.
pub const DEFAULT_UPDATE_RETRIES: u32 = 3;

/// Default exponential backoff factor between retries.
pub const DEFAULT_RETRY_FACTOR: f64 = 2.0;

/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_RETRY_MIN_TIMEOUT_MS: u64 = 1_000;

/// Default upper bound on a retry delay, in milliseconds.
pub const DEFAULT_RETRY_MAX_TIMEOUT_MS: u64 = 3_000;

/// Default for the incrementer cache toggle.
pub const DEFAULT_USE_INCREMENTER_CACHE: bool = false;

// ============================================================================
// LOGGING
// ============================================================================

/// Default `EnvFilter` directive when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "tally_cases=debug,tally_tasks=info,info";
