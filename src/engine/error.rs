// ABOUTME: Error types for the graph scheduling engine
// ABOUTME: Separates instance-fatal scheduler faults from per-task execution failures

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Unknown task kind '{kind}' on task '{task}'")]
    UnknownTaskKind { task: String, kind: String },

    #[error("Task '{task}' returned {actual} values for {expected} declared outputs")]
    OutputArityMismatch {
        task: String,
        expected: usize,
        actual: usize,
    },

    #[error("Awaitable '{id}' has no placeholder at context path '{path}'")]
    UnresolvedAwaitable { id: String, path: String },

    #[error("Awaitable '{id}' is not outstanding")]
    AwaitableNotRegistered { id: String },

    #[error("Context path '{path}' conflicts with a non-namespace value at '{segment}'")]
    ContextPathConflict { path: String, segment: String },

    #[error("Task not found: {task}")]
    TaskNotFound { task: String },

    #[error("Condition task '{task}' did not finish synchronously")]
    InvalidConditionTask { task: String },

    #[error("Graph stalled with unfinished tasks: {pending:?}")]
    Stalled { pending: Vec<String> },

    #[error("Graph definition error: {0}")]
    Definition(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Graph instance is no longer running")]
    InstanceClosed,
}

impl From<crate::parser::ParserError> for EngineError {
    fn from(error: crate::parser::ParserError) -> Self {
        EngineError::Definition(error.to_string())
    }
}

impl From<crate::store::StoreError> for EngineError {
    fn from(error: crate::store::StoreError) -> Self {
        EngineError::Store(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
