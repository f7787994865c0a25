// ABOUTME: Core graph definition data structures and YAML parsing
// ABOUTME: Defines GraphDefinition, iteration modes, published outputs, and graph-level handlers

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tokio::fs;

use super::error::{ParserError, Result, ValidationError};
use super::task::{TaskDefinition, TaskHandlerDefinition};

fn default_max_iteration() -> u32 {
    1000
}

/// How the whole graph repeats after all of its tasks settle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GraphMode {
    #[default]
    Normal,
    While,
    For,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphDefinition {
    pub name: String,
    pub description: Option<String>,

    #[serde(default)]
    pub mode: GraphMode,

    /// `task.socket` or `context.path` entries, all of which must be truthy
    /// for a `while`/`for` graph to run another iteration.
    #[serde(default)]
    pub conditions: Vec<String>,

    #[serde(default = "default_max_iteration")]
    pub max_iteration: u32,

    /// Values bound to `context.i` in turn by a `for` graph.
    #[serde(default)]
    pub sequence: Vec<Value>,

    /// Ceiling on outstanding remote and sub-graph jobs.
    pub max_number_jobs: Option<usize>,

    /// Initial context. Keys containing `__` address nested paths.
    #[serde(default)]
    pub context: Map<String, Value>,

    pub tasks: IndexMap<String, TaskDefinition>,

    #[serde(default)]
    pub outputs: Vec<OutputBinding>,

    #[serde(default)]
    pub error_handlers: IndexMap<String, GraphHandlerDefinition>,
}

/// A published graph output: `from` is `task`, `task.socket`, or `context.path`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputBinding {
    pub name: String,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphHandlerDefinition {
    pub handler: String,
    /// Per-task exit codes, retry budget, and arguments.
    #[serde(default)]
    pub tasks: IndexMap<String, TaskHandlerDefinition>,
}

impl GraphDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            mode: GraphMode::Normal,
            conditions: Vec::new(),
            max_iteration: default_max_iteration(),
            sequence: Vec::new(),
            max_number_jobs: None,
            context: Map::new(),
            tasks: IndexMap::new(),
            outputs: Vec::new(),
            error_handlers: IndexMap::new(),
        }
    }

    /// Parse graph from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ParserError::IoError)?;
        Self::from_yaml(&content)
    }

    /// Parse graph from YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let graph: GraphDefinition =
            serde_yaml::from_str(content).map_err(ParserError::YamlError)?;
        graph.validate_structure()?;
        Ok(graph)
    }

    /// Validate basic graph structure
    pub fn validate_structure(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ParserError::MissingField("name".to_string()));
        }

        if self.tasks.is_empty() {
            return Err(ParserError::ValidationError(ValidationError::EmptyGraph));
        }

        for name in self.tasks.keys() {
            if name.contains('.') || name.trim().is_empty() {
                return Err(ParserError::ValidationError(
                    ValidationError::InvalidTaskConfig {
                        task: name.clone(),
                        reason: "task names must be non-empty and must not contain '.'"
                            .to_string(),
                    },
                ));
            }
        }

        if self.max_number_jobs == Some(0) {
            return Err(ParserError::ValidationError(ValidationError::InvalidJobLimit));
        }

        Ok(())
    }

    pub fn with_task(mut self, name: &str, task: TaskDefinition) -> Self {
        self.tasks.insert(name.to_string(), task);
        self
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn with_output(mut self, name: &str, from: &str) -> Self {
        self.outputs.push(OutputBinding {
            name: name.to_string(),
            from: from.to_string(),
        });
        self
    }

    /// Get all task names in definition order
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn get_task(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.get(name)
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Direct members of a container task
    pub fn children_of(&self, name: &str) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|(_, task)| task.parent.as_deref() == Some(name))
            .map(|(child, _)| child.clone())
            .collect()
    }

    /// Task names referenced by `task.socket` conditions
    pub fn condition_tasks(&self) -> Vec<String> {
        let mut names = Vec::new();
        for condition in &self.conditions {
            if let Some((head, _)) = condition.split_once('.') {
                if head != "context" && !names.iter().any(|n| n == head) {
                    names.push(head.to_string());
                }
            }
        }
        names
    }

    /// Convert graph back to YAML string
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(ParserError::YamlError)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphParser;

impl GraphParser {
    pub fn new() -> Self {
        Self
    }

    pub async fn parse_file<P: AsRef<Path>>(&self, path: P) -> Result<GraphDefinition> {
        let content = fs::read_to_string(path.as_ref())
            .await
            .map_err(ParserError::IoError)?;
        self.parse_string(&content)
    }

    pub fn parse_string(&self, content: &str) -> Result<GraphDefinition> {
        GraphDefinition::from_yaml(content)
    }
}
