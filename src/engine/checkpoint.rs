// ABOUTME: Serializable snapshot of a graph instance and restoration from it
// ABOUTME: Re-watches backend processes and resets tasks whose in-process futures were lost

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use super::awaitable::{Awaitable, AwaitableRegistry, AwaitableTarget};
use super::backend::ExecutionBackend;
use super::context::ContextStore;
use super::driver::{DriverState, GraphEngine};
use super::error::Result;
use super::error_handler::GraphHandlerBinding;
use super::task::TaskTable;
use crate::parser::GraphDefinition;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub instance_id: String,
    pub definition: GraphDefinition,
    pub tasks: TaskTable,
    pub context: ContextStore,
    pub awaitables: Vec<Awaitable>,
    pub started: IndexSet<String>,
    pub execution_count: u32,
    pub for_cursor: usize,
    pub max_number_jobs: usize,
    pub graph_handlers: IndexMap<String, GraphHandlerBinding>,
    pub state: DriverState,
    pub reports: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn is_terminated(&self) -> bool {
        matches!(self.state, DriverState::Done | DriverState::Failed)
    }
}

impl GraphEngine {
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            instance_id: self.instance_id.clone(),
            definition: self.definition.clone(),
            tasks: self.tasks.clone(),
            context: self.context.clone(),
            awaitables: self.awaitables.outstanding().to_vec(),
            started: self.started.clone(),
            execution_count: self.execution_count,
            for_cursor: self.for_cursor,
            max_number_jobs: self.max_number_jobs,
            graph_handlers: self.graph_handlers.clone(),
            state: self.state,
            reports: self.reports.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Rebuild an engine from a checkpoint. Backend processes are watched again
    /// once the engine runs; in-process futures and sub-graph runs cannot be
    /// recovered, so their tasks are reset and dispatched afresh.
    pub fn restore(checkpoint: Checkpoint, backend: Arc<dyn ExecutionBackend>) -> Result<Self> {
        let mut engine = GraphEngine::new(checkpoint.definition, backend)?
            .with_instance_id(&checkpoint.instance_id)
            .with_max_number_jobs(checkpoint.max_number_jobs);

        engine.tasks = checkpoint.tasks;
        engine.context = checkpoint.context;
        engine.awaitables = AwaitableRegistry::from_outstanding(checkpoint.awaitables);
        engine.started = checkpoint.started;
        engine.execution_count = checkpoint.execution_count;
        engine.for_cursor = checkpoint.for_cursor;
        engine.graph_handlers = checkpoint.graph_handlers;
        engine.reports = checkpoint.reports;
        engine.state = checkpoint.state;

        let outstanding = engine.awaitables.outstanding().to_vec();
        for awaitable in outstanding {
            let owner = engine.tasks.get(&awaitable.task)?.kind.clone();
            if awaitable.target == AwaitableTarget::Process && !owner.runs_child_graph() {
                engine.rewatch.push(awaitable.id.clone());
                continue;
            }
            warn!(
                "Awaitable {} of task {} cannot be recovered; resetting the task",
                awaitable.id, awaitable.task
            );
            let terminated = engine.is_terminated();
            engine
                .awaitables
                .resolve(&awaitable.id, Value::Null, &mut engine.context, terminated)?;
            engine.reset_task(&awaitable.task, true, true)?;
        }

        if matches!(engine.state, DriverState::Waiting) {
            engine.state = DriverState::Stepping;
        }
        info!(
            "Restored graph instance {} ({} awaitables to watch)",
            engine.instance_id,
            engine.rewatch.len()
        );
        Ok(engine)
    }
}
