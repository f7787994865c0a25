// ABOUTME: Exit conditions and run result types produced when a graph instance finalizes
// ABOUTME: Aggregates per-task reports, a state summary, and the published outputs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use super::error::EngineError;
use super::task::{Task, TaskState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum ExitCondition {
    Success,
    TaskFailed { tasks: Vec<String> },
    UnknownTaskKind { task: String, kind: String },
    OutputArityMismatch { task: String },
    InstanceError { message: String },
}

impl ExitCondition {
    pub fn code(&self) -> i32 {
        match self {
            ExitCondition::Success => 0,
            ExitCondition::UnknownTaskKind { .. } => 202,
            ExitCondition::InstanceError { .. } => 300,
            ExitCondition::OutputArityMismatch { .. } => 301,
            ExitCondition::TaskFailed { .. } => 302,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCondition::Success)
    }
}

impl From<&EngineError> for ExitCondition {
    fn from(error: &EngineError) -> Self {
        match error {
            EngineError::UnknownTaskKind { task, kind } => ExitCondition::UnknownTaskKind {
                task: task.clone(),
                kind: kind.clone(),
            },
            EngineError::OutputArityMismatch { task, .. } => {
                ExitCondition::OutputArityMismatch { task: task.clone() }
            }
            other => ExitCondition::InstanceError {
                message: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for ExitCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitCondition::Success => write!(f, "success"),
            ExitCondition::TaskFailed { tasks } => write!(
                f,
                "graph finished, but tasks {:?} failed; their descendants were skipped",
                tasks
            ),
            ExitCondition::UnknownTaskKind { task, kind } => {
                write!(f, "unknown task kind '{}' on task '{}'", kind, task)
            }
            ExitCondition::OutputArityMismatch { task } => {
                write!(f, "outputs of task '{}' do not match its results", task)
            }
            ExitCondition::InstanceError { message } => write!(f, "instance error: {}", message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub name: String,
    pub kind: String,
    pub state: TaskState,
    pub results: Option<Map<String, Value>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub execution_count: u32,
}

impl From<&Task> for TaskReport {
    fn from(task: &Task) -> Self {
        Self {
            name: task.name.clone(),
            kind: task.kind.to_string(),
            state: task.state(),
            results: task.results().cloned(),
            exit_code: task.exit_code,
            error: task.error.clone(),
            execution_count: task.execution_count,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub total_tasks: usize,
    pub finished_tasks: usize,
    pub failed_tasks: usize,
    pub skipped_tasks: usize,
    pub killed_tasks: usize,
}

impl RunSummary {
    pub fn from_reports(reports: &[TaskReport]) -> Self {
        let count = |state: TaskState| reports.iter().filter(|r| r.state == state).count();
        Self {
            total_tasks: reports.len(),
            finished_tasks: count(TaskState::Finished),
            failed_tasks: count(TaskState::Failed),
            skipped_tasks: count(TaskState::Skipped),
            killed_tasks: count(TaskState::Killed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRunResult {
    pub graph_name: String,
    pub instance_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
    pub exit: ExitCondition,
    pub execution_count: u32,
    pub outputs: Value,
    pub context: Value,
    pub tasks: Vec<TaskReport>,
    pub summary: RunSummary,
    pub reports: Vec<String>,
}

impl GraphRunResult {
    pub fn is_success(&self) -> bool {
        self.exit.is_success()
    }

    pub fn exit_code(&self) -> i32 {
        self.exit.code()
    }

    pub fn get_task(&self, name: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_state(&self, name: &str) -> Option<TaskState> {
        self.get_task(name).map(|t| t.state)
    }

    /// One output socket of a task, if it produced one.
    pub fn task_output(&self, name: &str, socket: &str) -> Option<&Value> {
        self.get_task(name)?.results.as_ref()?.get(socket)
    }

    /// Read a published output by dotted name.
    pub fn output(&self, name: &str) -> Option<&Value> {
        name.split('.')
            .try_fold(&self.outputs, |current, segment| current.get(segment))
    }
}
