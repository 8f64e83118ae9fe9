//! Tally Cases - Incremental Case ID Assignment
//!
//! Gives every case a per-namespace sequential number after it is created.
//! A background task scheduled through `tally-tasks` lists the cases that
//! still lack a number, oldest first, and hands each the next free integer of
//! its namespace. The next free integer is derived from the cases already
//! numbered, so a lost run or a crash never causes reuse.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use tally_cases::{CasesIdIncrementerTask, CasesIncrementalIdService, IncrementalIdConfig};
//! use tally_tasks::{TaskManager, TaskManagerConfig};
//!
//! let config = IncrementalIdConfig::from_env();
//! let service = Arc::new(CasesIncrementalIdService::new(client.clone(), config.clone()));
//!
//! let manager = Arc::new(TaskManager::new(client, TaskManagerConfig::from_env()));
//! let task = CasesIdIncrementerTask::register(&manager, service, config)?;
//! task.schedule(&manager).await?;
//! let handle = Arc::clone(&manager).start(shutdown_rx);
//! ```

pub mod config;
pub mod constants;
pub mod import;
pub mod jobs;
pub mod retry;
pub mod services;
pub mod telemetry;

pub use config::IncrementalIdConfig;
pub use import::{handle_import, ImportHookResult};
pub use jobs::{CaseIdTaskRunner, CaseIdTaskState, CasesIdIncrementerTask};
pub use retry::{retry_transient, RetryFailure};
pub use services::{
    CaseIdIncrementerStore, CasesIncrementalIdService, CasesPaging, IncrementSummary, StopReason,
};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
