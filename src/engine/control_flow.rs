// ABOUTME: Control-flow coordination for scope, conditional and loop containers
// ABOUTME: Derives container states from children, resets tasks, and re-enters WHILE/FOR graphs

use serde_json::{Map, Value};
use tracing::debug;

use super::context::ContextStore;
use super::driver::GraphEngine;
use super::error::{EngineError, Result};
use super::task::{TaskKind, TaskState};

/// Truthiness of a JSON value: `null`, `false`, `0`, and empty strings,
/// sequences and mappings are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map_or(false, |n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Evaluate the user conditions of a loop. Absent conditions always hold; a
/// list of strings names context paths; anything else is tested directly.
pub fn conditions_hold(conditions: Option<&Value>, context: &ContextStore) -> bool {
    match conditions {
        None => true,
        Some(Value::Array(items)) if items.iter().all(Value::is_string) => items
            .iter()
            .filter_map(Value::as_str)
            .all(|path| context.get(path).map_or(false, |v| truthy(&v))),
        Some(Value::Array(items)) => items.iter().all(truthy),
        Some(Value::Object(map)) => map.values().all(truthy),
        Some(value) => truthy(value),
    }
}

impl GraphEngine {
    pub(crate) fn enter_scope(&mut self, name: &str) -> Result<()> {
        self.tasks.set_state(name, TaskState::Running)?;
        self.update_container(name)
    }

    pub(crate) fn enter_conditional(&mut self, name: &str, inputs: &Map<String, Value>) -> Result<()> {
        let task = self.tasks.get(name)?;
        let flag = inputs.get("conditions").map_or(false, truthy) ^ task.invert_condition;
        self.report(format!("Conditional {}: {}", name, flag));

        if flag {
            self.tasks.set_state(name, TaskState::Running)?;
            self.update_container(name)
        } else {
            self.close_container(name, Map::new())
        }
    }

    pub(crate) fn enter_loop(&mut self, name: &str, inputs: &Map<String, Value>) -> Result<()> {
        let task = self.tasks.get(name)?;
        let count = task.execution_count;
        let within_limit = count < task.max_iterations;
        let proceed = within_limit && conditions_hold(inputs.get("conditions"), &self.context);

        if proceed {
            self.tasks.get_mut(name)?.execution_count = count + 1;
            self.tasks.set_state(name, TaskState::Running)?;
            self.report(format!("Loop {}: iteration {}", name, count + 1));
            self.update_container(name)
        } else {
            if !within_limit {
                self.report(format!("Loop {}: max iterations ({}) reached", name, count));
            }
            let mut results = Map::new();
            results.insert("execution_count".to_string(), Value::from(count));
            self.close_container(name, results)
        }
    }

    /// Skip the children and finish the container without running them.
    fn close_container(&mut self, name: &str, results: Map<String, Value>) -> Result<()> {
        let children = self.tasks.get(name)?.children.clone();
        self.tasks.set_tree_state(&children, TaskState::Skipped)?;
        self.tasks.settle(name, TaskState::Finished, results)?;
        self.report(format!("Task: {} finished.", name));
        self.update_parent(name)
    }

    /// Re-derive the container holding `name`, if any.
    pub(crate) fn update_parent(&mut self, name: &str) -> Result<()> {
        match self.tasks.get(name)?.parent.clone() {
            Some(parent) => self.update_container(&parent),
            None => Ok(()),
        }
    }

    pub(crate) fn update_parents_of(&mut self, names: &[String]) -> Result<()> {
        let mut parents: Vec<String> = Vec::new();
        for name in names {
            if let Some(parent) = &self.tasks.get(name)?.parent {
                if !parents.contains(parent) && !names.contains(parent) {
                    parents.push(parent.clone());
                }
            }
        }
        for parent in parents {
            self.update_container(&parent)?;
        }
        Ok(())
    }

    /// A running container completes once every child is terminal, whatever
    /// the children's outcomes; failures propagate along links, not upward.
    pub(crate) fn update_container(&mut self, name: &str) -> Result<()> {
        let task = self.tasks.get(name)?;
        if task.state() != TaskState::Running || !self.tasks.all_children_terminal(name)? {
            return Ok(());
        }
        let kind = task.kind.clone();

        match kind {
            TaskKind::Loop => self.complete_iteration(name),
            _ => {
                self.tasks.settle(name, TaskState::Finished, Map::new())?;
                self.report(format!("Task: {} finished.", name));
                self.update_parent(name)
            }
        }
    }

    /// Reset the loop body so the next scan re-enters the loop.
    fn complete_iteration(&mut self, name: &str) -> Result<()> {
        let count = self.tasks.get(name)?.execution_count;
        self.report(format!("Loop {}: iteration {} finished", name, count));

        let sources: Vec<String> = self
            .tasks
            .incoming(name, Some("conditions"))
            .filter(|l| l.carries_value())
            .map(|l| l.from_task.clone())
            .collect();
        for source in sources {
            self.reset_task(&source, false, true)?;
        }
        self.reset_task(name, true, false)
    }

    /// Return `name` to PLANNED. Containers also reset their children; with
    /// `recursive` every link descendant is reset as well.
    pub(crate) fn reset_task(&mut self, name: &str, recursive: bool, reset_count: bool) -> Result<()> {
        self.drop_awaitables(name)?;
        self.tasks.set_state(name, TaskState::Planned)?;
        self.started.shift_remove(name);

        let task = self.tasks.get_mut(name)?;
        task.exit_code = None;
        task.error = None;
        if task.kind == TaskKind::Loop && reset_count {
            task.execution_count = 0;
        }
        let has_process = task.process_id.is_some();
        let is_container = task.kind.is_container();
        let children = task.children.clone();

        if has_process {
            self.tasks.set_process(name, None)?;
        }
        if is_container {
            for child in &children {
                self.reset_task(child, false, true)?;
            }
        }
        if recursive {
            for descendant in self.connectivity.descendants(name).to_vec() {
                self.reset_task(&descendant, false, true)?;
            }
        }
        debug!("Task {} reset", name);
        Ok(())
    }

    /// Return every task to PLANNED for the next graph-level iteration.
    fn reset_graph(&mut self) -> Result<()> {
        self.execution_count += 1;
        for name in self.tasks.names() {
            self.reset_task(&name, false, true)?;
        }
        self.started.clear();
        Ok(())
    }

    pub(crate) async fn check_while_conditions(&mut self) -> Result<bool> {
        self.report("Check while conditions.");
        if self.execution_count >= self.definition.max_iteration {
            self.report(format!(
                "Max iteration ({}) reached.",
                self.definition.max_iteration
            ));
            return Ok(false);
        }

        let condition_tasks = self.definition.condition_tasks();
        self.run_condition_tasks(&condition_tasks).await?;
        let should_run = self.graph_conditions_hold();
        if should_run {
            self.reset_graph()?;
            self.tasks
                .set_tree_state(&condition_tasks, TaskState::Skipped)?;
        }
        Ok(should_run)
    }

    pub(crate) async fn check_for_conditions(&mut self) -> Result<bool> {
        self.report("Check for conditions.");
        let condition_tasks = self.definition.condition_tasks();
        self.run_condition_tasks(&condition_tasks).await?;

        let cursor = self.for_cursor;
        let should_run = cursor < self.definition.sequence.len() && self.graph_conditions_hold();
        if should_run {
            self.reset_graph()?;
            self.tasks
                .set_tree_state(&condition_tasks, TaskState::Skipped)?;
            let item = self.definition.sequence[cursor].clone();
            self.context.set("i", item)?;
        }
        self.for_cursor += 1;
        Ok(should_run)
    }

    /// Condition tasks run inline and must be terminal when they return.
    async fn run_condition_tasks(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            self.reset_task(name, false, true)?;
            self.dispatch(name).await?;
            if !self.tasks.state(name)?.is_terminal() {
                return Err(EngineError::InvalidConditionTask { task: name.clone() });
            }
        }
        Ok(())
    }

    /// `context.path` and `task.socket` conditions, all of which must be truthy.
    fn graph_conditions_hold(&self) -> bool {
        self.definition.conditions.iter().all(|condition| {
            let value = match condition.split_once('.') {
                Some(("context", path)) => self.context.get(path),
                Some((task, socket)) => self.tasks.get(task).ok().and_then(|t| t.output(socket)),
                None => None,
            };
            value.map_or(false, |v| truthy(&v))
        })
    }
}
