//! Task manager: registration, scheduling, claiming and running.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tally_core::{
    ConfigError, CreateOptions, FindOptions, ObjectRef, StorageError, TallyError, TallyResult,
    TaskError, Timestamp, UpdateOptions, DEFAULT_NAMESPACE, MAX_PER_PAGE,
};
use tally_storage::SavedObjectsClient;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::TaskManagerConfig;
use crate::definition::{CancellationSignal, RunContext, RunResult, TaskDefinition, TaskRunner};
use crate::task::{EnsureScheduled, TaskInstance, TaskStatus, TASK_SAVED_OBJECT};

/// How long a cancelled run may take to wind down before it is dropped.
const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(5);

struct RegisteredTask {
    definition: TaskDefinition,
    permits: Arc<Semaphore>,
}

/// Why a run ended without the runner returning on its own.
enum Interrupt {
    TimedOut,
    Shutdown,
}

/// Periodic task manager backed by a saved-object store.
pub struct TaskManager {
    client: Arc<dyn SavedObjectsClient>,
    config: TaskManagerConfig,
    definitions: RwLock<HashMap<String, Arc<RegisteredTask>>>,
    shutdown: watch::Sender<bool>,
}

impl TaskManager {
    pub fn new(client: Arc<dyn SavedObjectsClient>, config: TaskManagerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            client,
            config,
            definitions: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    /// Register task types. Nothing is registered if any entry is rejected.
    pub fn register_task_definitions<I>(&self, definitions: I) -> TallyResult<()>
    where
        I: IntoIterator<Item = (String, TaskDefinition)>,
    {
        let mut registry = self
            .definitions
            .write()
            .map_err(|_| TallyError::Storage(StorageError::LockPoisoned))?;

        let mut staged: HashMap<String, Arc<RegisteredTask>> = HashMap::new();
        for (task_type, definition) in definitions {
            if registry.contains_key(&task_type) || staged.contains_key(&task_type) {
                return Err(TaskError::AlreadyRegistered { task_type }.into());
            }
            if definition.max_concurrency == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "max_concurrency".to_string(),
                    value: "0".to_string(),
                    reason: format!("task type {task_type} needs at least one concurrent run"),
                }
                .into());
            }
            let permits = Arc::new(Semaphore::new(definition.max_concurrency));
            staged.insert(
                task_type,
                Arc::new(RegisteredTask {
                    definition,
                    permits,
                }),
            );
        }

        for (task_type, registered) in staged {
            tracing::debug!(
                task_type = %task_type,
                title = %registered.definition.title,
                max_concurrency = registered.definition.max_concurrency,
                "Registered task type"
            );
            registry.insert(task_type, registered);
        }
        Ok(())
    }

    pub fn is_registered(&self, task_type: &str) -> bool {
        self.registered(task_type).is_ok()
    }

    fn registered(&self, task_type: &str) -> TallyResult<Arc<RegisteredTask>> {
        self.definitions
            .read()
            .map_err(|_| TallyError::Storage(StorageError::LockPoisoned))?
            .get(task_type)
            .cloned()
            .ok_or_else(|| {
                TaskError::NotRegistered {
                    task_type: task_type.to_string(),
                }
                .into()
            })
    }

    /// Create the instance, or refresh schedule, params and scope of an
    /// existing one. An existing instance keeps its state and status.
    pub async fn ensure_scheduled(&self, request: EnsureScheduled) -> TallyResult<TaskInstance> {
        self.registered(&request.task_type)?;
        if let Some(schedule) = &request.schedule {
            schedule.duration()?;
        }

        match self.load(&request.id).await {
            Ok(existing) => return self.refresh(existing, &request).await,
            Err(TallyError::Task(TaskError::NotFound { .. })) => {}
            Err(err) => return Err(err),
        }

        let instance = request.clone().into_instance();
        let options = CreateOptions {
            namespace: Some(DEFAULT_NAMESPACE.to_string()),
            id: Some(instance.id.clone()),
            created_at: None,
        };
        match self
            .client
            .create(TASK_SAVED_OBJECT, instance.to_attributes()?, &options)
            .await
        {
            Ok(created) => {
                tracing::info!(
                    task_id = %created.id,
                    task_type = %instance.task_type,
                    schedule = ?instance.schedule.as_ref().map(|s| s.to_string()),
                    "Scheduled task"
                );
                Ok(TaskInstance::from_saved_object(&created)?)
            }
            // Another manager created it first.
            Err(TallyError::Storage(StorageError::Conflict { .. })) => {
                let existing = self.load(&request.id).await?;
                self.refresh(existing, &request).await
            }
            Err(err) => Err(err),
        }
    }

    async fn refresh(
        &self,
        existing: TaskInstance,
        request: &EnsureScheduled,
    ) -> TallyResult<TaskInstance> {
        if existing.schedule == request.schedule
            && existing.params == request.params
            && existing.scope == request.scope
        {
            return Ok(existing);
        }
        let updated = self
            .client
            .update(
                TASK_SAVED_OBJECT,
                &existing.id,
                json!({
                    "schedule": request.schedule,
                    "params": request.params,
                    "scope": request.scope,
                }),
                &default_namespace_update(None),
            )
            .await?;
        tracing::debug!(task_id = %existing.id, "Refreshed existing task instance");
        Ok(TaskInstance::from_saved_object(&updated)?)
    }

    /// Remove an instance. Returns whether it existed.
    pub async fn remove_if_exists(&self, task_id: &str) -> TallyResult<bool> {
        let response = self
            .client
            .bulk_delete(&[ObjectRef {
                object_type: TASK_SAVED_OBJECT.to_string(),
                id: task_id.to_string(),
                namespace: Some(DEFAULT_NAMESPACE.to_string()),
            }])
            .await?;
        let removed = response.statuses.iter().any(|status| status.success);
        if removed {
            tracing::info!(task_id, "Removed task instance");
        }
        Ok(removed)
    }

    pub async fn get(&self, task_id: &str) -> TallyResult<TaskInstance> {
        self.load(task_id).await
    }

    async fn load(&self, task_id: &str) -> TallyResult<TaskInstance> {
        match self
            .client
            .get(TASK_SAVED_OBJECT, task_id, Some(DEFAULT_NAMESPACE))
            .await
        {
            Ok(object) => Ok(TaskInstance::from_saved_object(&object)?),
            Err(TallyError::Storage(StorageError::NotFound { .. })) => Err(TaskError::NotFound {
                task_id: task_id.to_string(),
            }
            .into()),
            Err(err) => Err(err),
        }
    }

    /// Make an idle instance due immediately.
    pub async fn run_soon(&self, task_id: &str) -> TallyResult<TaskInstance> {
        let instance = self.load(task_id).await?;
        if instance.status == TaskStatus::Running && !instance.is_due(Utc::now()) {
            return Err(TaskError::RunFailed {
                task_id: task_id.to_string(),
                reason: "task is currently running".to_string(),
            }
            .into());
        }
        let updated = self
            .client
            .update(
                TASK_SAVED_OBJECT,
                task_id,
                json!({ "run_at": Utc::now() }),
                &default_namespace_update(instance.version.clone()),
            )
            .await?;
        Ok(TaskInstance::from_saved_object(&updated)?)
    }

    /// One polling pass: claim every due instance there is capacity for and
    /// spawn its run. Returns the handles of the spawned runs.
    pub async fn run_due_tasks(self: &Arc<Self>) -> TallyResult<Vec<JoinHandle<()>>> {
        let now = Utc::now();
        let response = self
            .client
            .find(
                &FindOptions::new(TASK_SAVED_OBJECT)
                    .with_paging(MAX_PER_PAGE, 1)
                    .with_namespaces([DEFAULT_NAMESPACE]),
            )
            .await?;

        let mut due = Vec::new();
        for object in &response.saved_objects {
            match TaskInstance::from_saved_object(object) {
                Ok(instance) if instance.is_due(now) => due.push(instance),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(task_id = %object.id, error = %e, "Skipping undecodable task instance");
                }
            }
        }
        due.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.id.cmp(&b.id)));

        let mut handles = Vec::new();
        for instance in due {
            let registered = match self.registered(&instance.task_type) {
                Ok(registered) => registered,
                Err(_) => {
                    tracing::debug!(
                        task_id = %instance.id,
                        task_type = %instance.task_type,
                        "No definition registered for due task, skipping"
                    );
                    continue;
                }
            };

            let permit = match Arc::clone(&registered.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::trace!(task_id = %instance.id, "Task type at max concurrency");
                    continue;
                }
            };

            let claimed = match self.claim(&instance, &registered.definition).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(task_id = %instance.id, error = %e, "Failed to claim task");
                    continue;
                }
            };

            let manager = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                manager.execute(claimed, registered, permit).await;
            }));
        }
        Ok(handles)
    }

    /// Versioned claim. `None` means another manager got there first.
    async fn claim(
        &self,
        instance: &TaskInstance,
        definition: &TaskDefinition,
    ) -> TallyResult<Option<TaskInstance>> {
        let retry_at = add_duration(Utc::now(), definition.timeout);
        let result = self
            .client
            .update(
                TASK_SAVED_OBJECT,
                &instance.id,
                json!({ "status": TaskStatus::Running, "retry_at": retry_at }),
                &default_namespace_update(instance.version.clone()),
            )
            .await;
        match result {
            Ok(object) => Ok(Some(TaskInstance::from_saved_object(&object)?)),
            Err(TallyError::Storage(StorageError::Conflict { .. })) => {
                tracing::debug!(task_id = %instance.id, "Task claimed elsewhere, skipping");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn execute(
        self: Arc<Self>,
        instance: TaskInstance,
        registered: Arc<RegisteredTask>,
        _permit: OwnedSemaphorePermit,
    ) {
        let definition = &registered.definition;
        let (cancel_tx, cancellation) = CancellationSignal::channel();
        let runner: Arc<dyn TaskRunner> = Arc::from((definition.create_task_runner)(RunContext {
            task_instance: instance.clone(),
            cancellation,
        }));
        let mut shutdown_rx = self.shutdown.subscribe();

        tracing::debug!(task_id = %instance.id, task_type = %instance.task_type, "Running task");

        let run = runner.run();
        tokio::pin!(run);
        let interrupt = tokio::select! {
            result = &mut run => {
                self.finish(&instance, result).await;
                return;
            }
            _ = tokio::time::sleep(definition.timeout) => Interrupt::TimedOut,
            _ = shutdown_requested(&mut shutdown_rx) => Interrupt::Shutdown,
        };

        cancel_tx.send_replace(true);
        if let Err(e) = runner.cancel().await {
            tracing::warn!(task_id = %instance.id, error = %e, "Task runner cancel failed");
        }

        let result = match interrupt {
            Interrupt::TimedOut => {
                // A store write in flight finishes before the run is dropped.
                // Whatever the run returns, the timeout still counts as a failure.
                if tokio::time::timeout(CANCEL_GRACE_PERIOD, &mut run).await.is_err() {
                    tracing::warn!(task_id = %instance.id, "Timed out run did not wind down in time");
                }
                tracing::warn!(
                    task_id = %instance.id,
                    timeout_ms = definition.timeout.as_millis() as u64,
                    "Task run timed out"
                );
                Err(TaskError::TimedOut {
                    task_id: instance.id.clone(),
                    timeout_ms: definition.timeout.as_millis() as u64,
                }
                .into())
            }
            Interrupt::Shutdown => match tokio::time::timeout(CANCEL_GRACE_PERIOD, &mut run).await
            {
                Ok(result) => result,
                Err(_) => Err(TaskError::Cancelled {
                    task_id: instance.id.clone(),
                }
                .into()),
            },
        };
        self.finish(&instance, result).await;
    }

    /// Persist the outcome of a run and release the claim.
    async fn finish(&self, instance: &TaskInstance, result: TallyResult<RunResult>) {
        let now = Utc::now();

        let Some(schedule) = &instance.schedule else {
            if let Err(e) = &result {
                tracing::error!(task_id = %instance.id, error = %e, "One-off task run failed");
            }
            if let Err(e) = self.remove_if_exists(&instance.id).await {
                tracing::error!(task_id = %instance.id, error = %e, "Failed to remove one-off task");
            }
            return;
        };
        let run_at = match schedule.duration() {
            Ok(every) => add_duration(now, every),
            Err(_) => now,
        };

        let attributes = match result {
            Ok(outcome) => {
                tracing::debug!(task_id = %instance.id, "Task run completed");
                json!({
                    "state": outcome.state.unwrap_or_else(|| instance.state.clone()),
                    "status": TaskStatus::Idle,
                    "run_at": run_at,
                    "retry_at": null,
                    "attempts": 0,
                    "last_run_at": now,
                })
            }
            Err(e) => {
                tracing::error!(
                    task_id = %instance.id,
                    task_type = %instance.task_type,
                    attempts = instance.attempts + 1,
                    error = %e,
                    "Task run failed"
                );
                json!({
                    "status": TaskStatus::Idle,
                    "run_at": run_at,
                    "retry_at": null,
                    "attempts": instance.attempts + 1,
                    "last_run_at": now,
                })
            }
        };

        if let Err(e) = self
            .client
            .update(
                TASK_SAVED_OBJECT,
                &instance.id,
                attributes,
                &default_namespace_update(instance.version.clone()),
            )
            .await
        {
            tracing::warn!(task_id = %instance.id, error = %e, "Failed to persist task run outcome");
        }
    }

    /// Poll for due tasks until `shutdown_rx` reports `true`. In-flight runs
    /// are cancelled on shutdown and awaited before the handle completes.
    pub fn start(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut poll = interval(self.config.poll_interval);
            poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

            tracing::info!(
                poll_interval_ms = self.config.poll_interval.as_millis() as u64,
                "Task manager started"
            );

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::info!("Task manager shutting down");
                            break;
                        }
                    }

                    _ = poll.tick() => {
                        in_flight.retain(|handle| !handle.is_finished());
                        match self.run_due_tasks().await {
                            Ok(handles) => in_flight.extend(handles),
                            Err(e) => tracing::error!(error = %e, "Task polling pass failed"),
                        }
                    }
                }
            }

            self.shutdown.send_replace(true);
            for handle in in_flight {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Task run panicked");
                }
            }
            tracing::info!("Task manager stopped");
        })
    }
}

fn default_namespace_update(version: Option<String>) -> UpdateOptions {
    UpdateOptions {
        namespace: Some(DEFAULT_NAMESPACE.to_string()),
        version,
    }
}

fn add_duration(at: Timestamp, duration: Duration) -> Timestamp {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(at)
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
