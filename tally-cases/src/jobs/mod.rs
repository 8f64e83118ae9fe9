//! Background Jobs for tally-cases
//!
//! - `case_id_task`: periodic incremental id assignment
//!
//! # Usage
//!
//! ```ignore
//! use tally_cases::jobs::CasesIdIncrementerTask;
//!
//! let service = Arc::new(CasesIncrementalIdService::new(client.clone(), config.clone()));
//! let task = CasesIdIncrementerTask::register(&task_manager, service, config)?;
//! task.schedule(&task_manager).await?;
//! ```

pub mod case_id_task;

pub use case_id_task::{CaseIdTaskRunner, CaseIdTaskState, CasesIdIncrementerTask};
