//! Task definitions and the runner contract.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tally_core::TallyResult;
use tokio::sync::watch;

use crate::task::TaskInstance;

/// Default run timeout of a task definition.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Read side of a run's cancellation flag.
///
/// Flipped by the manager when the run exceeds its timeout or the manager
/// shuts down. Runners check it between units of work.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    pub(crate) fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that never fires. Useful when driving a runner by hand.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Dropping the sender leaves the last value (false) in place.
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Input handed to a runner factory for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The claimed instance, including the state left by the previous run.
    pub task_instance: TaskInstance,
    pub cancellation: CancellationSignal,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResult {
    /// New state for the next run. `None` keeps the previous state.
    pub state: Option<Value>,
}

impl RunResult {
    pub fn with_state(state: Value) -> Self {
        Self { state: Some(state) }
    }
}

/// One run of a task.
///
/// `cancel` may be called while `run` is in flight and must not block on it.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self) -> TallyResult<RunResult>;

    async fn cancel(&self) -> TallyResult<()>;
}

/// Builds a fresh runner for every run.
pub type TaskRunnerFactory = Arc<dyn Fn(RunContext) -> Box<dyn TaskRunner> + Send + Sync>;

/// A registered task type.
#[derive(Clone)]
pub struct TaskDefinition {
    pub title: String,
    pub description: Option<String>,
    /// Upper bound on concurrent runs of this type within one manager.
    pub max_concurrency: usize,
    /// Runs exceeding this are cancelled and recorded as failed.
    pub timeout: Duration,
    pub create_task_runner: TaskRunnerFactory,
}

impl TaskDefinition {
    pub fn new<F>(title: impl Into<String>, create_task_runner: F) -> Self
    where
        F: Fn(RunContext) -> Box<dyn TaskRunner> + Send + Sync + 'static,
    {
        Self {
            title: title.into(),
            description: None,
            max_concurrency: 1,
            timeout: DEFAULT_TASK_TIMEOUT,
            create_task_runner: Arc::new(create_task_runner),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("title", &self.title)
            .field("description", &self.description)
            .field("max_concurrency", &self.max_concurrency)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
