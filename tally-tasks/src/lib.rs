//! Tally Tasks - Periodic Background Task Manager
//!
//! Task instances are stored as `task` saved objects so their state survives
//! restarts and so several managers sharing a store never run the same
//! instance at once: a run starts only after a versioned claim succeeds.
//!
//! # Usage
//!
//! ```ignore
//! use tally_tasks::{TaskManager, TaskManagerConfig, TaskDefinition, EnsureScheduled, Schedule};
//! use tokio::sync::watch;
//!
//! let manager = Arc::new(TaskManager::new(client, TaskManagerConfig::from_env()));
//! manager.register_task_definitions([("my_task".to_string(), definition)])?;
//! manager.ensure_scheduled(EnsureScheduled::new("my-task-id", "my_task", Schedule::every("1m"))).await?;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = Arc::clone(&manager).start(shutdown_rx);
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! handle.await?;
//! ```

pub mod config;
pub mod definition;
pub mod manager;
pub mod schedule;
pub mod task;

pub use config::TaskManagerConfig;
pub use definition::{CancellationSignal, RunContext, RunResult, TaskDefinition, TaskRunner};
pub use manager::TaskManager;
pub use schedule::{parse_interval, Schedule};
pub use task::{EnsureScheduled, TaskInstance, TaskStatus, TASK_SAVED_OBJECT};
