// ABOUTME: Runtime task model: kinds, states, actions, and the name-keyed task arena
// ABOUTME: Builds the task table from a graph definition and keeps results in step with task state

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::error::{EngineError, Result};
use crate::parser::{GraphDefinition, LinkEndpoint, TaskHandlerDefinition, OUTPUTS_SOCKET, WAIT_SOCKET};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    Pure,
    Data,
    RemoteJob,
    SubGraph,
    GraphBuilder,
    Scope,
    Conditional,
    Loop,
    FromContext,
    ToContext,
    Awaitable,
    Monitor,
    Unknown(String),
}

impl TaskKind {
    pub fn parse(kind: &str) -> Self {
        match kind.trim().to_lowercase().as_str() {
            "pure" | "function" | "normal" => TaskKind::Pure,
            "data" => TaskKind::Data,
            "remote_job" | "job" => TaskKind::RemoteJob,
            "sub_graph" | "graph" => TaskKind::SubGraph,
            "graph_builder" => TaskKind::GraphBuilder,
            "scope" | "zone" => TaskKind::Scope,
            "conditional" | "if" => TaskKind::Conditional,
            "loop" | "while" => TaskKind::Loop,
            "from_context" => TaskKind::FromContext,
            "to_context" => TaskKind::ToContext,
            "awaitable" => TaskKind::Awaitable,
            "monitor" => TaskKind::Monitor,
            _ => TaskKind::Unknown(kind.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::Pure => "pure",
            TaskKind::Data => "data",
            TaskKind::RemoteJob => "remote_job",
            TaskKind::SubGraph => "sub_graph",
            TaskKind::GraphBuilder => "graph_builder",
            TaskKind::Scope => "scope",
            TaskKind::Conditional => "conditional",
            TaskKind::Loop => "loop",
            TaskKind::FromContext => "from_context",
            TaskKind::ToContext => "to_context",
            TaskKind::Awaitable => "awaitable",
            TaskKind::Monitor => "monitor",
            TaskKind::Unknown(raw) => raw,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, TaskKind::Scope | TaskKind::Conditional | TaskKind::Loop)
    }

    /// Kinds counted against the graph's outstanding-job ceiling.
    pub fn is_admission_limited(&self) -> bool {
        matches!(self, TaskKind::RemoteJob) || self.runs_child_graph()
    }

    /// Kinds that run a child engine instead of a backend process.
    pub fn runs_child_graph(&self) -> bool {
        matches!(self, TaskKind::SubGraph | TaskKind::GraphBuilder)
    }

    pub fn requires_executor(&self) -> bool {
        matches!(
            self,
            TaskKind::Pure
                | TaskKind::RemoteJob
                | TaskKind::GraphBuilder
                | TaskKind::Awaitable
                | TaskKind::Monitor
        )
    }

    /// Kinds that can be killed while running.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            TaskKind::RemoteJob
                | TaskKind::SubGraph
                | TaskKind::GraphBuilder
                | TaskKind::Awaitable
                | TaskKind::Monitor
        )
    }
}

impl From<String> for TaskKind {
    fn from(kind: String) -> Self {
        TaskKind::parse(&kind)
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Planned,
    /// Backend process exists but was created paused.
    Created,
    Running,
    Finished,
    Failed,
    Skipped,
    Killed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Skipped | TaskState::Killed
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskState::Planned | TaskState::Created | TaskState::Running
        )
    }

    fn carries_results(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskState::Planned => "PLANNED",
            TaskState::Created => "CREATED",
            TaskState::Running => "RUNNING",
            TaskState::Finished => "FINISHED",
            TaskState::Failed => "FAILED",
            TaskState::Skipped => "SKIPPED",
            TaskState::Killed => "KILLED",
        };
        write!(f, "{}", label)
    }
}

/// User actions delivered through control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskAction {
    Reset,
    Pause,
    Play,
    Skip,
    Kill,
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskAction::Reset => "RESET",
            TaskAction::Pause => "PAUSE",
            TaskAction::Play => "PLAY",
            TaskAction::Skip => "SKIP",
            TaskAction::Kill => "KILL",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub from_task: String,
    pub from_socket: String,
    pub to_task: String,
    pub to_socket: String,
}

impl Link {
    pub fn carries_value(&self) -> bool {
        self.from_socket != WAIT_SOCKET
    }
}

/// An exit-code to handler binding with its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerBinding {
    pub handler: String,
    pub exit_codes: Vec<i32>,
    pub max_retries: u32,
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl From<&TaskHandlerDefinition> for HandlerBinding {
    fn from(definition: &TaskHandlerDefinition) -> Self {
        Self {
            handler: definition.handler.clone(),
            exit_codes: definition.exit_codes.clone(),
            max_retries: definition.max_retries,
            retry: 0,
            kwargs: definition.kwargs.clone(),
        }
    }
}

impl HandlerBinding {
    pub fn matches(&self, exit_code: i32) -> bool {
        self.exit_codes.contains(&exit_code)
    }

    pub fn has_budget(&self) -> bool {
        self.retry < self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub kind: TaskKind,
    pub executor: Option<String>,
    /// Literal input properties, editable by error handlers.
    pub inputs: IndexMap<String, Value>,
    pub outputs: Vec<String>,
    state: TaskState,
    results: Option<Map<String, Value>>,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub execution_count: u32,
    pub max_iterations: u32,
    pub invert_condition: bool,
    pub action: Option<TaskAction>,
    pub process_id: Option<String>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub context_mapping: IndexMap<String, String>,
    pub collect_into: Option<String>,
    pub error_handlers: IndexMap<String, HandlerBinding>,
    /// Inline sub-graph definition.
    pub graph: Option<Box<GraphDefinition>>,
}

impl Task {
    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn results(&self) -> Option<&Map<String, Value>> {
        self.results.as_ref()
    }

    /// Declared outputs other than the reserved sockets.
    pub fn value_outputs(&self) -> Vec<&str> {
        self.outputs
            .iter()
            .map(String::as_str)
            .filter(|o| *o != WAIT_SOCKET && *o != OUTPUTS_SOCKET)
            .collect()
    }

    /// Read one output socket; `_outputs` yields the whole mapping.
    pub fn output(&self, socket: &str) -> Option<Value> {
        let results = self.results.as_ref()?;
        if socket == OUTPUTS_SOCKET {
            return Some(Value::Object(results.clone()));
        }
        results.get(socket).cloned()
    }
}

/// One state change waiting to be mirrored into the graph store.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub task: String,
    pub field: &'static str,
    pub value: Value,
}

/// All tasks of one graph instance, keyed by name in definition order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTable {
    tasks: IndexMap<String, Task>,
    links: Vec<Link>,
    #[serde(skip)]
    journal: Vec<FieldChange>,
}

impl TaskTable {
    pub fn from_definition(graph: &GraphDefinition) -> Result<Self> {
        let mut tasks = IndexMap::new();
        let mut links = Vec::new();

        for (name, definition) in &graph.tasks {
            let mut outputs = definition.declared_outputs();
            for reserved in [WAIT_SOCKET, OUTPUTS_SOCKET] {
                if !outputs.iter().any(|o| o == reserved) {
                    outputs.push(reserved.to_string());
                }
            }

            let task = Task {
                name: name.clone(),
                kind: TaskKind::parse(&definition.kind),
                executor: definition.executor.clone(),
                inputs: definition.inputs.clone(),
                outputs,
                state: TaskState::Planned,
                results: None,
                parent: definition.parent.clone(),
                children: graph.children_of(name),
                execution_count: 0,
                max_iterations: definition.max_iterations,
                invert_condition: definition.invert_condition,
                action: definition.paused.then_some(TaskAction::Pause),
                process_id: None,
                exit_code: None,
                error: None,
                context_mapping: definition.context_mapping.clone(),
                collect_into: definition.collect_into.clone(),
                error_handlers: definition
                    .error_handlers
                    .iter()
                    .map(|(key, handler)| (key.clone(), HandlerBinding::from(handler)))
                    .collect(),
                graph: definition.graph.clone(),
            };

            for (input, endpoint, raw) in definition.link_sources() {
                let endpoint = endpoint.ok_or_else(|| {
                    EngineError::Definition(format!("malformed link '{}' on task '{}'", raw, name))
                })?;
                let LinkEndpoint { task: source, socket } = endpoint;
                if !graph.has_task(&source) {
                    return Err(EngineError::Definition(format!(
                        "task '{}' links from unknown task '{}'",
                        name, source
                    )));
                }
                links.push(Link {
                    from_task: source,
                    from_socket: socket,
                    to_task: name.clone(),
                    to_socket: input,
                });
            }

            tasks.insert(name.clone(), task);
        }

        for task in tasks.values() {
            if let Some(parent) = &task.parent {
                if !tasks.contains_key(parent) {
                    return Err(EngineError::Definition(format!(
                        "task '{}' names unknown parent '{}'",
                        task.name, parent
                    )));
                }
            }
        }

        Ok(Self {
            tasks,
            links,
            journal: Vec::new(),
        })
    }

    pub fn get(&self, name: &str) -> Result<&Task> {
        self.tasks.get(name).ok_or_else(|| EngineError::TaskNotFound {
            task: name.to_string(),
        })
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Task> {
        self.tasks
            .get_mut(name)
            .ok_or_else(|| EngineError::TaskNotFound {
                task: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Links arriving at `task`, optionally restricted to one input socket.
    pub fn incoming<'a>(&'a self, task: &'a str, socket: Option<&'a str>) -> impl Iterator<Item = &'a Link> {
        self.links
            .iter()
            .filter(move |l| l.to_task == task && socket.map_or(true, |s| l.to_socket == s))
    }

    pub fn state(&self, name: &str) -> Result<TaskState> {
        Ok(self.get(name)?.state)
    }

    /// Change a task's state. Results are dropped for states that do not carry them.
    pub fn set_state(&mut self, name: &str, state: TaskState) -> Result<()> {
        let task = self.get_mut(name)?;
        task.state = state;
        if !state.carries_results() {
            task.results = None;
        } else if task.results.is_none() {
            task.results = Some(Map::new());
        }
        self.journal.push(FieldChange {
            task: name.to_string(),
            field: "state",
            value: Value::String(state.to_string()),
        });
        Ok(())
    }

    /// Record results and move the task to FINISHED or FAILED.
    pub fn settle(&mut self, name: &str, state: TaskState, results: Map<String, Value>) -> Result<()> {
        self.set_state(name, state)?;
        self.get_mut(name)?.results = Some(results);
        Ok(())
    }

    pub fn set_process(&mut self, name: &str, process_id: Option<String>) -> Result<()> {
        let task = self.get_mut(name)?;
        task.process_id = process_id.clone();
        self.journal.push(FieldChange {
            task: name.to_string(),
            field: "process",
            value: process_id.map(Value::String).unwrap_or(Value::Null),
        });
        Ok(())
    }

    /// Set `state` on the named tasks and, recursively, on their children.
    pub fn set_tree_state(&mut self, names: &[String], state: TaskState) -> Result<()> {
        for name in names {
            self.set_state(name, state)?;
            let children = self.get(name)?.children.clone();
            self.set_tree_state(&children, state)?;
        }
        Ok(())
    }

    pub fn all_children_terminal(&self, name: &str) -> Result<bool> {
        let task = self.get(name)?;
        for child in &task.children {
            if !self.state(child)?.is_terminal() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn names_in_state(&self, state: TaskState) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| t.state == state)
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn take_journal(&mut self) -> Vec<FieldChange> {
        std::mem::take(&mut self.journal)
    }
}
