// ABOUTME: Graph validation logic covering links, container nesting, and conditions
// ABOUTME: Produces a ValidationReport of errors and warnings before a graph is executed

use petgraph::graph::NodeIndex;
use petgraph::Graph;
use std::collections::{HashMap, HashSet};

use super::error::{Result, ValidationError};
use super::graph::{GraphDefinition, GraphMode};
use super::task::{LinkEndpoint, TaskDefinition};
use crate::engine::TaskKind;

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
    pub is_valid: bool,
}

pub struct GraphValidator {
    strict_mode: bool,
    known_executors: Option<HashSet<String>>,
}

impl GraphValidator {
    pub fn new() -> Self {
        Self {
            strict_mode: false,
            known_executors: None,
        }
    }

    /// In strict mode unknown task kinds are errors instead of warnings.
    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn with_known_executors<I, S>(mut self, executors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_executors = Some(executors.into_iter().map(Into::into).collect());
        self
    }

    /// Validate a complete graph
    pub fn validate(&self, graph: &GraphDefinition) -> Result<ValidationReport> {
        let mut report = ValidationReport::new();

        self.validate_links(graph, &mut report);
        self.validate_parents(graph, &mut report);
        self.validate_tasks(graph, &mut report)?;
        self.validate_conditions(graph, &mut report);
        self.validate_outputs(graph, &mut report);
        self.validate_error_handlers(graph, &mut report);

        if graph.max_number_jobs == Some(0) {
            report.errors.push(ValidationError::InvalidJobLimit);
        }

        report.is_valid = report.errors.is_empty();
        Ok(report)
    }

    /// Validate link endpoints and detect link cycles
    fn validate_links(&self, graph: &GraphDefinition, report: &mut ValidationReport) {
        for (name, task) in &graph.tasks {
            for (_, endpoint, raw) in task.link_sources() {
                match endpoint {
                    None => report.errors.push(ValidationError::MalformedLink {
                        task: name.clone(),
                        link: raw.to_string(),
                    }),
                    Some(endpoint) if !graph.has_task(&endpoint.task) => {
                        report.errors.push(ValidationError::UnknownLinkSource {
                            task: name.clone(),
                            source_task: endpoint.task,
                        })
                    }
                    Some(endpoint) => {
                        if is_ancestor(graph, &endpoint.task, name) {
                            report.errors.push(ValidationError::InvalidTaskConfig {
                                task: name.clone(),
                                reason: format!(
                                    "links from its enclosing container '{}'",
                                    endpoint.task
                                ),
                            });
                        }
                    }
                }
            }
        }

        if let Err(cycle) = self.detect_cycles(graph) {
            report
                .errors
                .push(ValidationError::CircularDependency { tasks: cycle });
        }
    }

    /// Detect link cycles using petgraph's topological sort
    fn detect_cycles(&self, graph: &GraphDefinition) -> std::result::Result<(), Vec<String>> {
        let mut link_graph = Graph::<String, ()>::new();
        let mut node_map: HashMap<String, NodeIndex> = HashMap::new();

        for name in graph.tasks.keys() {
            let node = link_graph.add_node(name.clone());
            node_map.insert(name.clone(), node);
        }

        for (name, task) in &graph.tasks {
            let target = node_map[name];
            for (_, endpoint, _) in task.link_sources() {
                if let Some(source) = endpoint.and_then(|e| node_map.get(&e.task).copied()) {
                    link_graph.add_edge(source, target, ());
                }
            }
        }

        match petgraph::algo::toposort(&link_graph, None) {
            Ok(_) => Ok(()),
            Err(cycle) => Err(vec![link_graph[cycle.node_id()].clone()]),
        }
    }

    /// Validate container membership
    fn validate_parents(&self, graph: &GraphDefinition, report: &mut ValidationReport) {
        for (name, task) in &graph.tasks {
            let Some(parent) = &task.parent else {
                continue;
            };

            match graph.get_task(parent) {
                None => report.errors.push(ValidationError::UnknownParent {
                    task: name.clone(),
                    parent: parent.clone(),
                }),
                Some(parent_task) if !TaskKind::parse(&parent_task.kind).is_container() => {
                    report.errors.push(ValidationError::ParentNotContainer {
                        task: name.clone(),
                        parent: parent.clone(),
                    })
                }
                Some(_) => {}
            }

            // Walk upwards; revisiting a task means the nesting loops back on itself
            let mut seen = HashSet::from([name.as_str()]);
            let mut current = task.parent.as_deref();
            while let Some(ancestor) = current {
                if !seen.insert(ancestor) {
                    report
                        .errors
                        .push(ValidationError::ParentCycle { task: name.clone() });
                    break;
                }
                current = graph.get_task(ancestor).and_then(|t| t.parent.as_deref());
            }
        }
    }

    /// Validate kinds, executors, and inline sub-graphs
    fn validate_tasks(&self, graph: &GraphDefinition, report: &mut ValidationReport) -> Result<()> {
        for (name, task) in &graph.tasks {
            let kind = TaskKind::parse(&task.kind);

            if let TaskKind::Unknown(raw) = &kind {
                if self.strict_mode {
                    report.errors.push(ValidationError::InvalidTaskConfig {
                        task: name.clone(),
                        reason: format!("unknown task kind '{}'", raw),
                    });
                } else {
                    report
                        .warnings
                        .push(format!("Task '{}' has unknown kind '{}'", name, raw));
                }
                continue;
            }

            if kind.requires_executor() && task.executor.is_none() {
                report.errors.push(ValidationError::InvalidTaskConfig {
                    task: name.clone(),
                    reason: format!("{} tasks require an executor", kind),
                });
            }

            if kind == TaskKind::SubGraph && task.graph.is_none() && task.executor.is_none() {
                report.errors.push(ValidationError::InvalidTaskConfig {
                    task: name.clone(),
                    reason: "sub_graph tasks need an inline graph or a stored graph id"
                        .to_string(),
                });
            }

            if let (Some(executor), Some(known)) = (&task.executor, &self.known_executors) {
                if kind.requires_executor() && !known.contains(executor) {
                    report.warnings.push(format!(
                        "Task '{}' uses executor '{}' which is not registered",
                        name, executor
                    ));
                }
            }

            for path in task.context_mapping.values() {
                if path.trim().is_empty() {
                    report.errors.push(ValidationError::InvalidTaskConfig {
                        task: name.clone(),
                        reason: "context_mapping paths cannot be empty".to_string(),
                    });
                }
            }

            self.check_output_sockets(graph, name, task, report);

            if let Some(inner) = &task.graph {
                let inner_report = self.validate(inner)?;
                for error in inner_report.errors {
                    report.errors.push(ValidationError::InvalidTaskConfig {
                        task: name.clone(),
                        reason: format!("inline graph: {}", error),
                    });
                }
                report.warnings.extend(
                    inner_report
                        .warnings
                        .into_iter()
                        .map(|w| format!("{}: {}", name, w)),
                );
            }
        }
        Ok(())
    }

    /// Warn about links reading sockets the source never declared
    fn check_output_sockets(
        &self,
        graph: &GraphDefinition,
        name: &str,
        task: &TaskDefinition,
        report: &mut ValidationReport,
    ) {
        for (_, endpoint, _) in task.link_sources() {
            let Some(LinkEndpoint { task: source, socket }) = endpoint else {
                continue;
            };
            let Some(source_task) = graph.get_task(&source) else {
                continue;
            };
            if socket.starts_with('_') {
                continue;
            }
            let kind = TaskKind::parse(&source_task.kind);
            // Jobs and sub-graphs publish whatever their backend returns
            if kind.is_admission_limited() {
                continue;
            }
            if !source_task.declared_outputs().contains(&socket) {
                report.warnings.push(format!(
                    "Task '{}' reads undeclared output '{}.{}'",
                    name, source, socket
                ));
            }
        }
    }

    /// Validate graph-level iteration conditions
    fn validate_conditions(&self, graph: &GraphDefinition, report: &mut ValidationReport) {
        if graph.mode == GraphMode::Normal {
            if !graph.conditions.is_empty() {
                report
                    .warnings
                    .push("conditions are ignored for normal graphs".to_string());
            }
            return;
        }

        for condition in &graph.conditions {
            match condition.split_once('.') {
                Some(("context", path)) if !path.is_empty() => {}
                Some((task, socket)) if !socket.is_empty() && graph.has_task(task) => {}
                Some((task, _)) if !graph.has_task(task) => {
                    report.errors.push(ValidationError::InvalidCondition {
                        condition: condition.clone(),
                        reason: format!("unknown task '{}'", task),
                    })
                }
                _ => report.errors.push(ValidationError::InvalidCondition {
                    condition: condition.clone(),
                    reason: "expected 'task.socket' or 'context.path'".to_string(),
                }),
            }
        }

        if graph.mode == GraphMode::For && graph.sequence.is_empty() {
            report
                .warnings
                .push("for graph has an empty sequence and will skip every task".to_string());
        }
    }

    /// Validate published outputs
    fn validate_outputs(&self, graph: &GraphDefinition, report: &mut ValidationReport) {
        for output in &graph.outputs {
            if output.name.trim().is_empty() {
                report.errors.push(ValidationError::InvalidOutput {
                    name: output.name.clone(),
                    reason: "output name cannot be empty".to_string(),
                });
                continue;
            }

            let mut parts = output.from.splitn(2, '.');
            let head = parts.next().unwrap_or_default();
            let rest = parts.next();
            if head == "context" {
                if rest.map_or(true, str::is_empty) {
                    report.errors.push(ValidationError::InvalidOutput {
                        name: output.name.clone(),
                        reason: "context outputs must name a path as context.key".to_string(),
                    });
                }
            } else if !graph.has_task(head) {
                report.errors.push(ValidationError::InvalidOutput {
                    name: output.name.clone(),
                    reason: format!("unknown task '{}'", head),
                });
            }
        }
    }

    /// Validate that graph-level handlers reference known tasks
    fn validate_error_handlers(&self, graph: &GraphDefinition, report: &mut ValidationReport) {
        for (handler_name, handler) in &graph.error_handlers {
            for task in handler.tasks.keys() {
                if !graph.has_task(task) {
                    report.errors.push(ValidationError::InvalidTaskConfig {
                        task: task.clone(),
                        reason: format!("error handler '{}' targets an unknown task", handler_name),
                    });
                }
            }
        }
    }
}

/// True when `ancestor` encloses `task` through the parent chain.
fn is_ancestor(graph: &GraphDefinition, ancestor: &str, task: &str) -> bool {
    let mut seen = HashSet::new();
    let mut current = graph.get_task(task).and_then(|t| t.parent.as_deref());
    while let Some(name) = current {
        if name == ancestor {
            return true;
        }
        if !seen.insert(name) {
            return false;
        }
        current = graph.get_task(name).and_then(|t| t.parent.as_deref());
    }
    false
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            is_valid: true,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

impl Default for GraphValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(yaml: &str) -> ValidationReport {
        let graph = GraphDefinition::from_yaml(yaml).unwrap();
        GraphValidator::new().validate(&graph).unwrap()
    }

    #[test]
    fn test_link_cycle_detection() {
        let report = validate(
            r#"
name: circular
tasks:
  a:
    executor: identity
    links:
      value: [b.result]
  b:
    executor: identity
    links:
      value: [a.result]
"#,
        );

        assert!(report.has_errors());
        assert!(matches!(
            report.errors[0],
            ValidationError::CircularDependency { .. }
        ));
    }

    #[test]
    fn test_unknown_link_source() {
        let report = validate(
            r#"
name: unknown_source
tasks:
  a:
    executor: identity
    links:
      value: [missing.result]
"#,
        );

        assert_eq!(
            report.errors,
            vec![ValidationError::UnknownLinkSource {
                task: "a".to_string(),
                source_task: "missing".to_string(),
            }]
        );
    }

    #[test]
    fn test_parent_must_be_container() {
        let report = validate(
            r#"
name: bad_parent
tasks:
  a:
    executor: identity
  b:
    executor: identity
    parent: a
"#,
        );

        assert!(matches!(
            report.errors[0],
            ValidationError::ParentNotContainer { .. }
        ));
    }

    #[test]
    fn test_link_from_enclosing_container_rejected() {
        let report = validate(
            r#"
name: self_link
tasks:
  loop1:
    kind: loop
  body:
    executor: identity
    parent: loop1
    links:
      value: [loop1.result]
"#,
        );

        assert!(report.has_errors());
    }

    #[test]
    fn test_while_conditions() {
        let report = validate(
            r#"
name: bad_conditions
mode: while
conditions: [missing.result, context.n, plain]
tasks:
  a:
    executor: identity
"#,
        );

        assert_eq!(report.errors.len(), 2);
        assert!(report
            .errors
            .iter()
            .all(|e| matches!(e, ValidationError::InvalidCondition { .. })));
    }

    #[test]
    fn test_unknown_kind_is_warning_unless_strict() {
        let graph = GraphDefinition::from_yaml(
            r#"
name: odd_kind
tasks:
  a:
    kind: teleport
"#,
        )
        .unwrap();

        let report = GraphValidator::new().validate(&graph).unwrap();
        assert!(report.is_valid);
        assert!(report.has_warnings());

        let strict = GraphValidator::new()
            .with_strict_mode(true)
            .validate(&graph)
            .unwrap();
        assert!(!strict.is_valid);
    }

    #[test]
    fn test_missing_executor() {
        let report = validate(
            r#"
name: no_executor
tasks:
  a:
    kind: remote_job
"#,
        );

        assert!(matches!(
            report.errors[0],
            ValidationError::InvalidTaskConfig { .. }
        ));
    }

    #[test]
    fn test_unregistered_executor_warning() {
        let graph = GraphDefinition::from_yaml(
            r#"
name: unregistered
tasks:
  a:
    executor: nowhere
"#,
        )
        .unwrap();

        let report = GraphValidator::new()
            .with_known_executors(["add", "identity"])
            .validate(&graph)
            .unwrap();
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_valid_graph() {
        let report = validate(
            r#"
name: valid
tasks:
  a:
    executor: const
    inputs:
      value: 3
  b:
    executor: add
    inputs:
      y: 4
    links:
      x: [a.result]
outputs:
  - name: sum
    from: b.result
"#,
        );

        assert!(!report.has_errors());
        assert!(report.is_valid);
    }
}
