//! Task and execution records.
//!
//! Both live in the entity store as `task` / `task_execution` entities; the
//! structs here are typed views over those entities' attributes.

use crate::access::Caller;
use crate::core::{Attributes, Entity, EntityRef, ExecutionOutcome, KernelError, Result, Value};
use crate::hooks::CodexPermission;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Relation from a task to its execution records.
pub const EXECUTIONS_RELATION: &str = "executions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    /// Held for the duration of one run; a running task is never picked up.
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// No further runs will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadRef {
    /// An installed codex, looked up at run time.
    Codex { codex_id: String },
    /// Inline source, compiled when scheduled and again on each run.
    Script {
        source: String,
        #[serde(default)]
        permissions: BTreeSet<CodexPermission>,
    },
}

impl PayloadRef {
    pub fn codex(codex_id: impl Into<String>) -> Self {
        Self::Codex { codex_id: codex_id.into() }
    }

    pub fn script(source: impl Into<String>) -> Self {
        Self::Script {
            source: source.into(),
            permissions: BTreeSet::new(),
        }
    }
}

/// Everything needed to schedule a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub name: Option<String>,
    pub payload: PayloadRef,
    /// 0 means one-shot.
    pub interval_seconds: u64,
    pub delay_seconds: u64,
    /// Bound as `entity` when the payload runs.
    pub target: Option<EntityRef>,
    pub args: Value,
}

impl TaskSpec {
    pub fn new(payload: PayloadRef) -> Self {
        Self {
            name: None,
            payload,
            interval_seconds: 0,
            delay_seconds: 0,
            target: None,
            args: Value::Null,
        }
    }

    pub fn codex(codex_id: impl Into<String>) -> Self {
        Self::new(PayloadRef::codex(codex_id))
    }

    pub fn script(source: impl Into<String>) -> Self {
        Self::new(PayloadRef::script(source))
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn interval_seconds(mut self, seconds: u64) -> Self {
        self.interval_seconds = seconds;
        self
    }

    pub fn delay_seconds(mut self, seconds: u64) -> Self {
        self.delay_seconds = seconds;
        self
    }

    pub fn target(mut self, entity: impl Into<EntityRef>) -> Self {
        self.target = Some(entity.into());
        self
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Permissions for an inline script; ignored for codex payloads.
    pub fn permissions(mut self, granted: impl IntoIterator<Item = CodexPermission>) -> Self {
        if let PayloadRef::Script { permissions, .. } = &mut self.payload {
            permissions.extend(granted);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(skip)]
    pub id: EntityRef,
    pub name: String,
    pub interval_seconds: u64,
    pub delay_seconds: u64,
    pub status: TaskStatus,
    pub next_run_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    pub payload: PayloadRef,
    #[serde(default)]
    pub target: Option<EntityRef>,
    #[serde(default)]
    pub args: Value,
    /// Identity the payload runs as: the scheduling caller.
    pub run_as: Caller,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub execution_count: u64,
}

impl Task {
    pub(crate) fn from_entity(entity: &Entity) -> Result<Self> {
        let mut task: Task = serde_json::from_value(Value::Object(entity.attributes.clone()))
            .map_err(|e| {
                KernelError::InvariantViolation(format!(
                    "task '{}' has malformed attributes: {}",
                    entity.id, e
                ))
            })?;
        task.id = entity.id.clone();
        Ok(task)
    }

    pub(crate) fn to_attributes(&self) -> Result<Attributes> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(KernelError::SerializationError(
                "task did not serialize to an object".to_string(),
            )),
        }
    }

    pub fn is_one_shot(&self) -> bool {
        self.interval_seconds == 0
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            interval_seconds: self.interval_seconds,
            next_run_at: self.next_run_at,
            last_run_at: self.last_run_at,
            execution_count: self.execution_count,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// One run of a task. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    #[serde(skip)]
    pub id: EntityRef,
    pub task_id: EntityRef,
    /// 1 for the first run of a task, then increasing.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub steps: u64,
}

impl Execution {
    pub(crate) fn from_entity(entity: &Entity) -> Result<Self> {
        let mut execution: Execution =
            serde_json::from_value(Value::Object(entity.attributes.clone())).map_err(|e| {
                KernelError::InvariantViolation(format!(
                    "execution '{}' has malformed attributes: {}",
                    entity.id, e
                ))
            })?;
        execution.id = entity.id.clone();
        Ok(execution)
    }

    pub(crate) fn to_attributes(&self) -> Result<Attributes> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(KernelError::SerializationError(
                "execution did not serialize to an object".to_string(),
            )),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ExecutionOutcome::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: EntityRef,
    pub name: String,
    pub status: TaskStatus,
    pub interval_seconds: u64,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<TaskSummary>,
    /// 1-based
    pub page_num: usize,
    pub page_size: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: EntityRef,
    pub sequence: u64,
    pub outcome: ExecutionOutcome,
    pub status_after: TaskStatus,
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub now: DateTime<Utc>,
    pub runs: Vec<TaskRun>,
}

impl TickReport {
    pub fn executed(&self) -> usize {
        self.runs.len()
    }

    pub fn failures(&self) -> usize {
        self.runs
            .iter()
            .filter(|run| run.outcome == ExecutionOutcome::Failure)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_json_shape() {
        let payload: PayloadRef =
            serde_json::from_value(json!({"type": "script", "source": "emit 1"})).unwrap();
        assert_eq!(payload, PayloadRef::script("emit 1"));
        assert_eq!(
            serde_json::to_value(PayloadRef::codex("c1")).unwrap(),
            json!({"type": "codex", "codex_id": "c1"})
        );
    }

    #[test]
    fn test_task_attribute_mapping() {
        let now = Utc::now();
        let task = Task {
            id: "t1".into(),
            name: "nightly".into(),
            interval_seconds: 60,
            delay_seconds: 5,
            status: TaskStatus::Scheduled,
            next_run_at: now,
            last_run_at: None,
            payload: PayloadRef::codex("c1"),
            target: None,
            args: json!({"limit": 3}),
            run_as: Caller::new("alice").with_profile("clerk"),
            consecutive_failures: 0,
            execution_count: 0,
        };
        let attributes = task.to_attributes().unwrap();
        assert_eq!(attributes["status"], "scheduled");
        assert!(!attributes.contains_key("id"));

        let entity = Entity::new("t1".into(), "task", attributes, Some("alice".into()), now);
        assert_eq!(Task::from_entity(&entity).unwrap(), task);
    }

    #[test]
    fn test_spec_builder() {
        let spec = TaskSpec::script("emit 1")
            .name("ping")
            .interval_seconds(60)
            .permissions([CodexPermission::Read]);
        assert_eq!(spec.name.as_deref(), Some("ping"));
        assert!(matches!(spec.payload, PayloadRef::Script { ref permissions, .. } if permissions.len() == 1));
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
