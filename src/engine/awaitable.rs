// ABOUTME: Registry of outstanding asynchronous completions for a graph instance
// ABOUTME: Places awaitable placeholders in the context and swaps in resolved values

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::context::{ContextStore, Slot, WriteDiscipline};
use super::error::{EngineError, Result};

/// What produces the completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitableTarget {
    /// A backend job or sub-graph; survives a restart and can be watched again.
    Process,
    /// An in-process future; lost when the engine stops.
    AsyncTask,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Awaitable {
    pub id: String,
    pub task: String,
    pub target: AwaitableTarget,
    pub action: WriteDiscipline,
    /// Destination context path.
    pub path: String,
    /// Resolve with the full output mapping rather than the raw completion value.
    pub outputs: bool,
    #[serde(default)]
    pub resolved: bool,
}

impl Awaitable {
    pub fn new(id: &str, task: &str, target: AwaitableTarget, path: &str) -> Self {
        Self {
            id: id.to_string(),
            task: task.to_string(),
            target,
            action: WriteDiscipline::Assign,
            path: path.to_string(),
            outputs: target == AwaitableTarget::Process,
            resolved: false,
        }
    }

    pub fn appending(mut self) -> Self {
        self.action = WriteDiscipline::Append;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwaitableRegistry {
    outstanding: Vec<Awaitable>,
    status: Option<String>,
}

impl AwaitableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from checkpointed awaitables without touching the context.
    pub fn from_outstanding(outstanding: Vec<Awaitable>) -> Self {
        let mut registry = Self {
            outstanding,
            status: None,
        };
        registry.refresh_status();
        registry
    }

    /// Write the placeholder at the destination, then track the awaitable.
    pub fn register(&mut self, awaitable: Awaitable, ctx: &mut ContextStore) -> Result<()> {
        ctx.write(
            &awaitable.path,
            Slot::Pending(awaitable.id.clone()),
            awaitable.action,
        )?;
        debug!(
            "Registered awaitable {} for task {} at ctx.{}",
            awaitable.id, awaitable.task, awaitable.path
        );
        // Only tracked once the placeholder is in place
        self.outstanding.push(awaitable);
        self.refresh_status();
        Ok(())
    }

    /// Swap the placeholder for `value` and stop tracking the awaitable.
    pub fn resolve(
        &mut self,
        id: &str,
        value: Value,
        ctx: &mut ContextStore,
        terminated: bool,
    ) -> Result<Awaitable> {
        let index = self
            .outstanding
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| EngineError::AwaitableNotRegistered { id: id.to_string() })?;

        let awaitable = &self.outstanding[index];
        match awaitable.action {
            WriteDiscipline::Assign => ctx.set(&awaitable.path, value)?,
            WriteDiscipline::Append => ctx.replace_pending(&awaitable.path, id, value)?,
        }

        let mut awaitable = self.outstanding.remove(index);
        awaitable.resolved = true;

        if !terminated {
            self.refresh_status();
        }
        Ok(awaitable)
    }

    /// Resolve every awaitable owned by `task` with `null`, returning their ids.
    pub fn discard_task(&mut self, task: &str, ctx: &mut ContextStore) -> Result<Vec<String>> {
        let ids: Vec<String> = self
            .outstanding
            .iter()
            .filter(|a| a.task == task)
            .map(|a| a.id.clone())
            .collect();
        for id in &ids {
            self.resolve(id, Value::Null, ctx, false)?;
        }
        Ok(ids)
    }

    pub fn get(&self, id: &str) -> Option<&Awaitable> {
        self.outstanding.iter().find(|a| a.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn outstanding(&self) -> &[Awaitable] {
        &self.outstanding
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// `None` when idle, otherwise the ids still being waited on.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    fn refresh_status(&mut self) {
        self.status = if self.outstanding.is_empty() {
            None
        } else {
            let ids: Vec<&str> = self.outstanding.iter().map(|a| a.id.as_str()).collect();
            Some(format!("Waiting for child processes: {}", ids.join(", ")))
        };
    }
}
