// ABOUTME: Execution backend seam between the scheduler and whatever actually runs tasks
// ABOUTME: Defines task outputs, failures, job outcomes, and the async backend trait

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// What an executor hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutput {
    /// Stored under the first declared output.
    Single(Value),
    /// One value per declared output, in declaration order.
    Tuple(Vec<Value>),
    /// Used as the result mapping directly.
    Mapping(Map<String, Value>),
}

impl TaskOutput {
    /// Raw completion value.
    pub fn into_value(self) -> Value {
        match self {
            TaskOutput::Single(value) => value,
            TaskOutput::Tuple(values) => Value::Array(values),
            TaskOutput::Mapping(map) => Value::Object(map),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub message: String,
    /// Non-zero codes select error handlers.
    pub exit_code: Option<i32>,
    /// Partial outputs, kept as the failed task's results.
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
            outputs: Map::new(),
        }
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_outputs(mut self, outputs: Map<String, Value>) -> Self {
        self.outputs = outputs;
        self
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} (exit code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Terminal outcome of an asynchronous job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    Finished(TaskOutput),
    Failed(TaskFailure),
    Cancelled,
}

impl From<Result<TaskOutput, TaskFailure>> for JobOutcome {
    fn from(result: Result<TaskOutput, TaskFailure>) -> Self {
        match result {
            Ok(output) => JobOutcome::Finished(output),
            Err(failure) => JobOutcome::Failed(failure),
        }
    }
}

pub type TaskFuture = BoxFuture<'static, Result<TaskOutput, TaskFailure>>;

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Run a pure executor to completion.
    async fn invoke(&self, executor: &str, inputs: &Map<String, Value>)
        -> Result<TaskOutput, TaskFailure>;

    /// Start a remote job and return its process id.
    async fn submit(&self, executor: &str, inputs: &Map<String, Value>) -> Result<String, TaskFailure>;

    /// Create a remote job without starting it.
    async fn create_paused(
        &self,
        executor: &str,
        inputs: &Map<String, Value>,
    ) -> Result<String, TaskFailure>;

    /// Start a job created paused.
    async fn play(&self, process_id: &str) -> Result<(), TaskFailure>;

    /// Completion of a previously submitted job.
    fn watch(&self, process_id: &str) -> BoxFuture<'static, JobOutcome>;

    async fn cancel(&self, process_id: &str);

    /// Forget a finished process once the engine has recorded its outcome.
    fn release(&self, _process_id: &str) {}

    /// Build the future for an in-process awaitable task.
    fn spawn(&self, executor: &str, inputs: Map<String, Value>) -> Result<TaskFuture, TaskFailure>;

    /// Executor names this backend knows about.
    fn executors(&self) -> Vec<String> {
        Vec::new()
    }
}
