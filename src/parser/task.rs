// ABOUTME: Task definition structures as they appear in graph YAML files
// ABOUTME: Covers inputs, links, container membership, context mapping, and error handler bindings

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::graph::GraphDefinition;

/// Output socket carrying no value; links on it only order execution.
pub const WAIT_SOCKET: &str = "_wait";
/// Output socket carrying the entire result mapping of the source task.
pub const OUTPUTS_SOCKET: &str = "_outputs";

pub fn default_max_iterations() -> u32 {
    1000
}

fn default_kind() -> String {
    "pure".to_string()
}

/// One task of a graph, keyed by its name in `GraphDefinition::tasks`.
///
/// ```yaml
/// tasks:
///   multiply1:
///     kind: pure
///     executor: multiply
///     inputs:
///       x: "{{ n }}"
///       y: 2
///   add1:
///     executor: add
///     inputs:
///       y: 3
///     links:
///       x: [multiply1.result]
///     context_mapping:
///       result: n
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDefinition {
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Name of the executor the backend runs for this task.
    pub executor: Option<String>,

    pub description: Option<String>,

    /// Literal input properties. Strings of the form `{{ path }}` read the context.
    #[serde(default)]
    pub inputs: IndexMap<String, Value>,

    /// Incoming links per input socket, each written as `task.socket`.
    #[serde(default)]
    pub links: IndexMap<String, Vec<String>>,

    /// Tasks that must reach a terminal state first without passing a value.
    #[serde(default)]
    pub wait_for: Vec<String>,

    /// Declared output sockets; `[result]` when empty.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Enclosing scope, conditional, or loop task.
    pub parent: Option<String>,

    /// Output socket to context path, written when the task finishes.
    #[serde(default)]
    pub context_mapping: IndexMap<String, String>,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default)]
    pub invert_condition: bool,

    /// Created paused; the job only starts after a PLAY action.
    #[serde(default)]
    pub paused: bool,

    /// Append the completion value to this context sequence instead of
    /// assigning it under the task name.
    pub collect_into: Option<String>,

    #[serde(default)]
    pub error_handlers: IndexMap<String, TaskHandlerDefinition>,

    /// Inline definition for `sub_graph` tasks.
    pub graph: Option<Box<GraphDefinition>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskHandlerDefinition {
    pub handler: String,
    #[serde(default)]
    pub exit_codes: Vec<i32>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

fn default_max_retries() -> u32 {
    1
}

/// A parsed `task.socket` link endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEndpoint {
    pub task: String,
    pub socket: String,
}

impl LinkEndpoint {
    pub fn parse(link: &str) -> Option<Self> {
        let (task, socket) = link.split_once('.')?;
        if task.is_empty() || socket.is_empty() {
            return None;
        }
        Some(Self {
            task: task.to_string(),
            socket: socket.to_string(),
        })
    }
}

impl TaskDefinition {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            executor: None,
            description: None,
            inputs: IndexMap::new(),
            links: IndexMap::new(),
            wait_for: Vec::new(),
            outputs: Vec::new(),
            parent: None,
            context_mapping: IndexMap::new(),
            max_iterations: default_max_iterations(),
            invert_condition: false,
            paused: false,
            collect_into: None,
            error_handlers: IndexMap::new(),
            graph: None,
        }
    }

    pub fn with_executor(mut self, executor: &str) -> Self {
        self.executor = Some(executor.to_string());
        self
    }

    pub fn with_input(mut self, name: &str, value: Value) -> Self {
        self.inputs.insert(name.to_string(), value);
        self
    }

    pub fn with_link(mut self, input: &str, source: &str) -> Self {
        self.links
            .entry(input.to_string())
            .or_default()
            .push(source.to_string());
        self
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_context_mapping(mut self, socket: &str, path: &str) -> Self {
        self.context_mapping
            .insert(socket.to_string(), path.to_string());
        self
    }

    /// All link endpoints, including `wait_for` entries mapped onto the wait socket.
    pub fn link_sources(&self) -> Vec<(String, Option<LinkEndpoint>, &str)> {
        let mut sources = Vec::new();
        for (input, links) in &self.links {
            for link in links {
                sources.push((input.clone(), LinkEndpoint::parse(link), link.as_str()));
            }
        }
        for task in &self.wait_for {
            sources.push((
                WAIT_SOCKET.to_string(),
                Some(LinkEndpoint {
                    task: task.clone(),
                    socket: WAIT_SOCKET.to_string(),
                }),
                task.as_str(),
            ));
        }
        sources
    }

    /// Declared outputs, falling back to the single `result` socket.
    pub fn declared_outputs(&self) -> Vec<String> {
        if self.outputs.is_empty() {
            vec!["result".to_string()]
        } else {
            self.outputs.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_link_endpoint() {
        let endpoint = LinkEndpoint::parse("add1.result").unwrap();
        assert_eq!(endpoint.task, "add1");
        assert_eq!(endpoint.socket, "result");

        assert!(LinkEndpoint::parse("add1").is_none());
        assert!(LinkEndpoint::parse(".result").is_none());
        assert!(LinkEndpoint::parse("add1.").is_none());
    }

    #[test]
    fn test_task_definition_defaults() {
        let yaml = r#"
executor: add
inputs:
  x: 1
"#;
        let task: TaskDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task.kind, "pure");
        assert_eq!(task.max_iterations, 1000);
        assert_eq!(task.declared_outputs(), vec!["result"]);
        assert_eq!(task.inputs.get("x"), Some(&json!(1)));
    }

    #[test]
    fn test_wait_for_becomes_wait_link() {
        let task = TaskDefinition {
            wait_for: vec!["a".to_string()],
            ..TaskDefinition::new("pure")
        }
        .with_link("x", "b.result");

        let sources = task.link_sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[1].0, WAIT_SOCKET);
        assert_eq!(sources[1].1.as_ref().unwrap().task, "a");
    }
}
