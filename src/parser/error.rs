// ABOUTME: Error types for graph definition parsing and validation
// ABOUTME: Defines specific error types for parser module operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParserError {
    #[error("Failed to read graph file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid graph format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Circular link dependency detected in tasks: {tasks:?}")]
    CircularDependency { tasks: Vec<String> },

    #[error("Task '{task}' links from unknown task '{source_task}'")]
    UnknownLinkSource { task: String, source_task: String },

    #[error("Malformed link '{link}' on task '{task}': expected 'task.socket'")]
    MalformedLink { task: String, link: String },

    #[error("Task '{task}' names unknown parent '{parent}'")]
    UnknownParent { task: String, parent: String },

    #[error("Task '{task}' has parent '{parent}' which is not a container task")]
    ParentNotContainer { task: String, parent: String },

    #[error("Container nesting cycle through task '{task}'")]
    ParentCycle { task: String },

    #[error("Invalid task configuration for '{task}': {reason}")]
    InvalidTaskConfig { task: String, reason: String },

    #[error("Invalid condition '{condition}': {reason}")]
    InvalidCondition { condition: String, reason: String },

    #[error("Invalid output '{name}': {reason}")]
    InvalidOutput { name: String, reason: String },

    #[error("max_number_jobs must be at least 1")]
    InvalidJobLimit,

    #[error("Empty graph: no tasks defined")]
    EmptyGraph,
}

pub type Result<T> = std::result::Result<T, ParserError>;
