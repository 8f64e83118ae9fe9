//! Incremental ID Assignment Task
//!
//! Registers `cases_incremental_id_assignment` with the task manager and
//! schedules its single instance. Each run lists the cases lacking an id,
//! hands them to `CasesIncrementalIdService` and records advisory state:
//!
//! - when the run happened
//! - how many cases are still waiting for an id
//! - which namespaces have been seen
//!
//! The state is never read back as a source of truth. Every run re-derives
//! its starting point from the cases themselves.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tally_core::{TallyResult, Timestamp};
use tally_tasks::definition::DEFAULT_TASK_TIMEOUT;
use tally_tasks::{
    EnsureScheduled, RunContext, RunResult, TaskDefinition, TaskInstance, TaskManager, TaskRunner,
};
use tokio::time::Instant;

use crate::config::IncrementalIdConfig;
use crate::constants::{
    CASES_INCREMENTAL_ID_SYNC_TASK_ID, CASES_INCREMENTAL_ID_SYNC_TASK_TYPE,
    CASES_INCREMENTAL_ID_TASK_DESCRIPTION, CASES_INCREMENTAL_ID_TASK_TITLE,
    CASES_INCREMENTAL_ID_TASK_VERSION, CASES_TASK_SCOPE,
};
use crate::services::{CasesIncrementalIdService, CasesPaging};

/// Advisory state persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaseIdTaskState {
    pub version: String,
    pub last_run_at: Option<Timestamp>,
    /// Cases still lacking an id when the last run ended.
    pub cases_without_incremental_id: usize,
    /// Namespaces the task has assigned ids in, sorted.
    pub namespaces: Vec<String>,
    pub applied_in_last_run: usize,
    pub last_stop_reason: Option<String>,
}

/// The incremental id assignment task.
pub struct CasesIdIncrementerTask {
    config: IncrementalIdConfig,
}

impl CasesIdIncrementerTask {
    /// Register the task type with `service` injected into every run.
    pub fn register(
        task_manager: &TaskManager,
        service: Arc<CasesIncrementalIdService>,
        config: IncrementalIdConfig,
    ) -> TallyResult<Self> {
        config.validate()?;
        tracing::info!("Registering Case Incremental ID Task Manager");
        task_manager.register_task_definitions([(
            CASES_INCREMENTAL_ID_SYNC_TASK_TYPE.to_string(),
            Self::definition(service, &config),
        )])?;
        Ok(Self { config })
    }

    /// Task definition: one run at a time, with a timeout comfortably above
    /// the run's own time budget.
    pub fn definition(
        service: Arc<CasesIncrementalIdService>,
        config: &IncrementalIdConfig,
    ) -> TaskDefinition {
        let run_config = config.clone();
        TaskDefinition::new(CASES_INCREMENTAL_ID_TASK_TITLE, move |ctx| {
            Box::new(CaseIdTaskRunner::new(
                Arc::clone(&service),
                run_config.clone(),
                ctx,
            )) as Box<dyn TaskRunner>
        })
        .with_description(CASES_INCREMENTAL_ID_TASK_DESCRIPTION)
        .with_max_concurrency(1)
        .with_timeout(DEFAULT_TASK_TIMEOUT.max(config.max_run_duration * 2))
    }

    /// Ensure the single task instance exists. Existing state is kept.
    pub async fn schedule(&self, task_manager: &TaskManager) -> TallyResult<TaskInstance> {
        let request = EnsureScheduled::new(
            CASES_INCREMENTAL_ID_SYNC_TASK_ID,
            CASES_INCREMENTAL_ID_SYNC_TASK_TYPE,
            self.config.schedule(),
        )
        .with_params(json!({}))
        .with_state(json!({}))
        .with_scope([CASES_TASK_SCOPE]);

        match task_manager.ensure_scheduled(request).await {
            Ok(instance) => {
                tracing::info!(
                    task_id = CASES_INCREMENTAL_ID_SYNC_TASK_ID,
                    interval = ?instance.schedule.as_ref().map(|s| s.interval.as_str()),
                    "{CASES_INCREMENTAL_ID_SYNC_TASK_ID} scheduled"
                );
                Ok(instance)
            }
            Err(e) => {
                tracing::error!(
                    task_id = CASES_INCREMENTAL_ID_SYNC_TASK_ID,
                    error = %e,
                    "Error scheduling task"
                );
                Err(e)
            }
        }
    }
}

/// One run of the assignment task.
pub struct CaseIdTaskRunner {
    service: Arc<CasesIncrementalIdService>,
    config: IncrementalIdConfig,
    ctx: RunContext,
    cancelled: AtomicBool,
}

impl CaseIdTaskRunner {
    pub fn new(
        service: Arc<CasesIncrementalIdService>,
        config: IncrementalIdConfig,
        ctx: RunContext,
    ) -> Self {
        Self {
            service,
            config,
            ctx,
            cancelled: AtomicBool::new(false),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.ctx.cancellation.is_cancelled()
    }

    fn previous_state(&self) -> CaseIdTaskState {
        serde_json::from_value(self.ctx.task_instance.state.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TaskRunner for CaseIdTaskRunner {
    async fn run(&self) -> TallyResult<RunResult> {
        let started_at = Utc::now();
        let started = Instant::now();
        tracing::info!(started_at = %started_at, "Increment id task started");

        let cases = self
            .service
            .get_cases_without_incremental_id(CasesPaging::default())
            .await?;
        let summary = self
            .service
            .increment_case_ids_until(&cases.saved_objects, self.config.max_run_duration, || {
                self.is_cancelled()
            })
            .await;

        let cases_without_incremental_id =
            match self.service.count_cases_without_incremental_id().await {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!(error = %e, "Unable to count cases without an incremental id");
                    cases.total.saturating_sub(summary.applied)
                }
            };

        let mut namespaces: BTreeSet<String> =
            self.previous_state().namespaces.into_iter().collect();
        namespaces.extend(summary.namespaces.keys().cloned());

        let state = CaseIdTaskState {
            version: CASES_INCREMENTAL_ID_TASK_VERSION.to_string(),
            last_run_at: Some(started_at),
            cases_without_incremental_id,
            namespaces: namespaces.into_iter().collect(),
            applied_in_last_run: summary.applied,
            last_stop_reason: Some(summary.stop_reason.label().to_string()),
        };

        tracing::info!(
            applied = summary.applied,
            cases_without_incremental_id,
            stop_reason = summary.stop_reason.label(),
            "Increment id task ended"
        );
        tracing::debug!(
            task_id = CASES_INCREMENTAL_ID_SYNC_TASK_ID,
            elapsed_ms = started.elapsed().as_millis() as u64,
            started_at = %started_at,
            "Task terminated"
        );

        Ok(RunResult::with_state(serde_json::to_value(&state)?))
    }

    async fn cancel(&self) -> TallyResult<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        tracing::info!("{CASES_INCREMENTAL_ID_SYNC_TASK_ID} task run was canceled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{CreateOptions, UpdateOptions, CASE_SAVED_OBJECT};
    use tally_storage::{InMemorySavedObjects, SavedObjectsClient};
    use tally_tasks::{CancellationSignal, TaskManagerConfig, TaskStatus, TASK_SAVED_OBJECT};

    fn setup() -> (InMemorySavedObjects, Arc<CasesIncrementalIdService>, IncrementalIdConfig) {
        let store = InMemorySavedObjects::new();
        let config = IncrementalIdConfig::development();
        let service = Arc::new(CasesIncrementalIdService::new(
            Arc::new(store.clone()),
            config.clone(),
        ));
        (store, service, config)
    }

    fn context(state: serde_json::Value) -> RunContext {
        let task_instance = TaskInstance {
            id: CASES_INCREMENTAL_ID_SYNC_TASK_ID.to_string(),
            task_type: CASES_INCREMENTAL_ID_SYNC_TASK_TYPE.to_string(),
            schedule: Some(IncrementalIdConfig::default().schedule()),
            params: json!({}),
            state,
            scope: vec![CASES_TASK_SCOPE.to_string()],
            status: TaskStatus::Running,
            run_at: Utc::now(),
            retry_at: None,
            attempts: 0,
            last_run_at: None,
            version: None,
        };
        RunContext {
            task_instance,
            cancellation: CancellationSignal::never(),
        }
    }

    #[test]
    fn test_definition_is_exclusive() {
        let (_, service, config) = setup();
        let def = CasesIdIncrementerTask::definition(service, &config);
        assert_eq!(def.max_concurrency, 1);
        assert_eq!(def.title, CASES_INCREMENTAL_ID_TASK_TITLE);
        assert!(def.timeout >= config.max_run_duration);
    }

    #[tokio::test]
    async fn test_run_assigns_and_records_state() {
        let (store, service, config) = setup();
        for namespace in ["space-b", "space-a"] {
            store
                .create(
                    CASE_SAVED_OBJECT,
                    json!({ "title": "c" }),
                    &CreateOptions::in_namespace(namespace),
                )
                .await
                .unwrap();
        }

        let runner = CaseIdTaskRunner::new(
            service,
            config,
            context(json!({ "namespaces": ["default"] })),
        );
        let result = runner.run().await.unwrap();
        let state: CaseIdTaskState = serde_json::from_value(result.state.unwrap()).unwrap();

        assert_eq!(state.applied_in_last_run, 2);
        assert_eq!(state.cases_without_incremental_id, 0);
        assert_eq!(state.namespaces, vec!["default", "space-a", "space-b"]);
        assert_eq!(state.last_stop_reason.as_deref(), Some("completed"));
        assert_eq!(state.version, CASES_INCREMENTAL_ID_TASK_VERSION);
    }

    #[tokio::test]
    async fn test_cancelled_runner_assigns_nothing() {
        let (store, service, config) = setup();
        store
            .create(CASE_SAVED_OBJECT, json!({ "title": "c" }), &CreateOptions::default())
            .await
            .unwrap();

        let runner = CaseIdTaskRunner::new(service, config, context(json!({})));
        runner.cancel().await.unwrap();
        let state: CaseIdTaskState =
            serde_json::from_value(runner.run().await.unwrap().state.unwrap()).unwrap();

        assert_eq!(state.applied_in_last_run, 0);
        assert_eq!(state.cases_without_incremental_id, 1);
        assert_eq!(state.last_stop_reason.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_register_and_schedule_keeps_existing_state() {
        let (store, service, config) = setup();
        let manager = TaskManager::new(Arc::new(store.clone()), TaskManagerConfig::default());
        let task = CasesIdIncrementerTask::register(&manager, service, config).unwrap();

        let first = task.schedule(&manager).await.unwrap();
        assert_eq!(first.scope, vec![CASES_TASK_SCOPE.to_string()]);
        assert_eq!(first.schedule.as_ref().map(|s| s.interval.as_str()), Some("10s"));

        store
            .update(
                TASK_SAVED_OBJECT,
                CASES_INCREMENTAL_ID_SYNC_TASK_ID,
                json!({ "state": { "applied_in_last_run": 4 } }),
                &UpdateOptions::default(),
            )
            .await
            .unwrap();

        let again = task.schedule(&manager).await.unwrap();
        assert_eq!(again.state["applied_in_last_run"], 4);
    }
}
