// ABOUTME: Error/retry coordination for failed tasks
// ABOUTME: Matches exit codes to named handlers, enforces retry budgets, and resets patched tasks

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::driver::GraphEngine;
use super::error::Result;
use super::task::HandlerBinding;
use crate::parser::GraphHandlerDefinition;

/// The editable view of a failed task handed to an error handler.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPatch {
    pub name: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub inputs: IndexMap<String, Value>,
}

/// Adjusts a failed task before it is retried. The returned note is reported.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, task: &mut TaskPatch, kwargs: &Map<String, Value>) -> anyhow::Result<Option<String>>;
}

impl<F> ErrorHandler for F
where
    F: Fn(&mut TaskPatch, &Map<String, Value>) -> anyhow::Result<Option<String>> + Send + Sync,
{
    fn handle(&self, task: &mut TaskPatch, kwargs: &Map<String, Value>) -> anyhow::Result<Option<String>> {
        self(task, kwargs)
    }
}

/// Graph-scoped handler with per-task exit codes and retry counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphHandlerBinding {
    pub handler: String,
    pub tasks: IndexMap<String, HandlerBinding>,
}

impl From<&GraphHandlerDefinition> for GraphHandlerBinding {
    fn from(definition: &GraphHandlerDefinition) -> Self {
        Self {
            handler: definition.handler.clone(),
            tasks: definition
                .tasks
                .iter()
                .map(|(task, settings)| (task.clone(), HandlerBinding::from(settings)))
                .collect(),
        }
    }
}

pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ErrorHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("set_inputs", set_inputs);
        registry.register("increment_input", increment_input);
        registry
    }

    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<H>(&mut self, name: &str, handler: H)
    where
        H: ErrorHandler + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ErrorHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Overwrite inputs with `kwargs.inputs`.
fn set_inputs(task: &mut TaskPatch, kwargs: &Map<String, Value>) -> anyhow::Result<Option<String>> {
    let Some(Value::Object(inputs)) = kwargs.get("inputs") else {
        anyhow::bail!("set_inputs needs an 'inputs' mapping");
    };
    for (key, value) in inputs {
        task.inputs.insert(key.clone(), value.clone());
    }
    let keys: Vec<&str> = inputs.keys().map(String::as_str).collect();
    Ok(Some(format!(
        "Updated inputs [{}] of task {}",
        keys.join(", "),
        task.name
    )))
}

/// Add `kwargs.by` (default 1) to the numeric input named by `kwargs.input`.
fn increment_input(task: &mut TaskPatch, kwargs: &Map<String, Value>) -> anyhow::Result<Option<String>> {
    let input = kwargs
        .get("input")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("increment_input needs an 'input' name"))?;
    let by = kwargs.get("by").and_then(Value::as_f64).unwrap_or(1.0);
    let current = task
        .inputs
        .get(input)
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow::anyhow!("input '{}' of task {} is not numeric", input, task.name))?;

    let updated = current + by;
    let value = if updated.fract() == 0.0 && updated.abs() < i64::MAX as f64 {
        Value::from(updated as i64)
    } else {
        Value::from(updated)
    };
    task.inputs.insert(input.to_string(), value.clone());
    Ok(Some(format!("Set {}.{} to {}", task.name, input, value)))
}

/// Where a matched binding lives, so its retry counter can be updated in place.
enum BindingSlot {
    Task(String),
    Graph(String),
}

impl GraphEngine {
    /// Run the first handler whose exit codes match the failure of `name`.
    /// Task-scoped bindings take precedence over graph-scoped ones.
    pub(crate) fn run_error_handlers(&mut self, name: &str) -> Result<()> {
        let task = self.tasks.get(name)?;
        let Some(exit_code) = task.exit_code.filter(|code| *code != 0) else {
            return Ok(());
        };

        let task_slot = task
            .error_handlers
            .iter()
            .find(|(_, binding)| binding.matches(exit_code))
            .map(|(key, _)| BindingSlot::Task(key.clone()));

        let slot = task_slot.or_else(|| {
            self.graph_handlers
                .iter()
                .find(|(_, graph)| graph.tasks.get(name).map_or(false, |b| b.matches(exit_code)))
                .map(|(key, _)| BindingSlot::Graph(key.clone()))
        });

        match slot {
            Some(slot) => self.run_error_handler(name, slot),
            None => Ok(()),
        }
    }

    fn run_error_handler(&mut self, name: &str, slot: BindingSlot) -> Result<()> {
        let binding = match &slot {
            BindingSlot::Task(key) => self.tasks.get(name)?.error_handlers.get(key).cloned(),
            BindingSlot::Graph(key) => self
                .graph_handlers
                .get(key)
                .and_then(|graph| graph.tasks.get(name).cloned().map(|mut b| {
                    b.handler = graph.handler.clone();
                    b
                })),
        };
        let Some(binding) = binding else {
            return Ok(());
        };

        self.report(format!("Run error handler: {}", binding.handler));
        if !binding.has_budget() {
            self.report(format!(
                "Error handler {} exhausted its {} retries for task {}",
                binding.handler, binding.max_retries, name
            ));
            return Ok(());
        }

        let Some(handler) = self.handlers.get(&binding.handler) else {
            warn!("Error handler '{}' is not registered", binding.handler);
            self.report(format!("Error handler {} is not registered", binding.handler));
            return Ok(());
        };

        let task = self.tasks.get(name)?;
        let mut patch = TaskPatch {
            name: name.to_string(),
            exit_code: task.exit_code,
            error: task.error.clone(),
            inputs: task.inputs.clone(),
        };

        match handler.handle(&mut patch, &binding.kwargs) {
            Ok(note) => {
                self.tasks.get_mut(name)?.inputs = patch.inputs;
                self.reset_task(name, true, true)?;
                if let Some(note) = note {
                    self.report(note);
                }
                self.bump_retry(name, &slot)?;
                info!(
                    "Task {} reset by error handler {} (retry {}/{})",
                    name,
                    binding.handler,
                    binding.retry + 1,
                    binding.max_retries
                );
            }
            Err(error) => {
                warn!("Error handler {} failed: {}", binding.handler, error);
                self.report(format!("Error in running error handler: {}", error));
            }
        }
        Ok(())
    }

    fn bump_retry(&mut self, name: &str, slot: &BindingSlot) -> Result<()> {
        let binding = match slot {
            BindingSlot::Task(key) => self.tasks.get_mut(name)?.error_handlers.get_mut(key),
            BindingSlot::Graph(key) => self
                .graph_handlers
                .get_mut(key)
                .and_then(|graph| graph.tasks.get_mut(name)),
        };
        if let Some(binding) = binding {
            binding.retry += 1;
        }
        Ok(())
    }
}
