//! Persisted task instances.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_core::{SavedObject, StorageError, Timestamp};

use crate::schedule::Schedule;

/// Saved-object type holding task instances.
pub const TASK_SAVED_OBJECT: &str = "task";

/// Lifecycle status of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `run_at`.
    Idle,
    /// Claimed by a manager until `retry_at`.
    Running,
}

/// A scheduled task instance as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    #[serde(skip)]
    pub id: String,
    pub task_type: String,
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub params: Value,
    /// State handed from one run to the next.
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub scope: Vec<String>,
    pub status: TaskStatus,
    pub run_at: Timestamp,
    /// Claim expiry. A running task whose claim expired may be claimed again.
    pub retry_at: Option<Timestamp>,
    /// Consecutive failed attempts.
    #[serde(default)]
    pub attempts: u32,
    pub last_run_at: Option<Timestamp>,
    /// Store version of the document this instance was read from.
    #[serde(skip)]
    pub version: Option<String>,
}

impl TaskInstance {
    /// Decode a stored `task` saved object.
    pub fn from_saved_object(object: &SavedObject) -> Result<Self, StorageError> {
        let mut instance: TaskInstance = serde_json::from_value(object.attributes.clone())?;
        instance.id = object.id.clone();
        instance.version = object.version.clone();
        Ok(instance)
    }

    pub fn to_attributes(&self) -> Result<Value, StorageError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Whether a manager may claim this instance at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        match self.status {
            TaskStatus::Idle => self.run_at <= now,
            TaskStatus::Running => self.retry_at.map(|at| at <= now).unwrap_or(true),
        }
    }
}

/// Request for `TaskManager::ensure_scheduled`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsureScheduled {
    pub id: String,
    pub task_type: String,
    pub schedule: Option<Schedule>,
    pub params: Value,
    /// Initial state, only used when the instance does not exist yet.
    pub state: Value,
    pub scope: Vec<String>,
}

impl EnsureScheduled {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            schedule: Some(schedule),
            params: Value::Object(Default::default()),
            state: Value::Object(Default::default()),
            scope: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    pub fn with_scope<I, S>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = scope.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn into_instance(self) -> TaskInstance {
        TaskInstance {
            id: self.id,
            task_type: self.task_type,
            schedule: self.schedule,
            params: self.params,
            state: self.state,
            scope: self.scope,
            status: TaskStatus::Idle,
            run_at: Utc::now(),
            retry_at: None,
            attempts: 0,
            last_run_at: None,
            version: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn instance() -> TaskInstance {
        EnsureScheduled::new("Cases:x", "x", Schedule::every("1m"))
            .with_scope(["cases"])
            .into_instance()
    }

    #[test]
    fn test_attributes_omit_id_and_version() {
        let mut task = instance();
        task.version = Some("3".to_string());
        let attrs = task.to_attributes().unwrap();
        assert!(attrs.get("id").is_none());
        assert!(attrs.get("version").is_none());
        assert_eq!(attrs["status"], "idle");
        assert_eq!(attrs["schedule"], json!({ "interval": "1m" }));
    }

    #[test]
    fn test_from_saved_object_restores_envelope() {
        let task = instance();
        let so = SavedObject {
            id: "Cases:x".to_string(),
            object_type: TASK_SAVED_OBJECT.to_string(),
            attributes: task.to_attributes().unwrap(),
            namespaces: vec!["default".to_string()],
            version: Some("9".to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let decoded = TaskInstance::from_saved_object(&so).unwrap();
        assert_eq!(decoded.id, "Cases:x");
        assert_eq!(decoded.version.as_deref(), Some("9"));
        assert_eq!(decoded.scope, vec!["cases".to_string()]);
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut task = instance();
        task.run_at = now + Duration::seconds(30);
        assert!(!task.is_due(now));
        task.run_at = now - Duration::seconds(1);
        assert!(task.is_due(now));

        task.status = TaskStatus::Running;
        task.retry_at = Some(now + Duration::seconds(60));
        assert!(!task.is_due(now));
        task.retry_at = Some(now - Duration::seconds(60));
        assert!(task.is_due(now));
    }
}
