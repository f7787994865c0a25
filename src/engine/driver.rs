// ABOUTME: Step driver that owns one graph instance and advances it until it finishes
// ABOUTME: Alternates between dispatching ready tasks and waiting for completion or control events

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, instrument, warn};

use super::awaitable::{AwaitableRegistry, AwaitableTarget};
use super::backend::{ExecutionBackend, JobOutcome};
use super::connectivity::Connectivity;
use super::context::ContextStore;
use super::error::{EngineError, Result};
use super::error_handler::{GraphHandlerBinding, HandlerRegistry};
use super::result::{ExitCondition, GraphRunResult, RunSummary, TaskReport};
use super::task::{TaskAction, TaskKind, TaskState, TaskTable};
use crate::parser::{GraphDefinition, GraphMode};
use crate::store::GraphStore;

pub const DEFAULT_MAX_NUMBER_JOBS: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DriverState {
    Setup,
    Stepping,
    Waiting,
    Done,
    Failed,
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverState::Setup => "SETUP",
            DriverState::Stepping => "STEPPING",
            DriverState::Waiting => "WAITING",
            DriverState::Done => "DONE",
            DriverState::Failed => "FAILED",
        };
        write!(f, "{}", label)
    }
}

/// Defaults for the monitor primitive when a task does not set its own.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub monitor_interval: Duration,
    pub monitor_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(1),
            monitor_timeout: Duration::from_secs(3600),
        }
    }
}

/// A user action applied to a set of tasks of a running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: TaskAction,
    pub tasks: Vec<String>,
}

impl ControlMessage {
    pub fn new(action: TaskAction, tasks: &[&str]) -> Self {
        Self {
            action,
            tasks: tasks.iter().map(|t| t.to_string()).collect(),
        }
    }
}

pub(crate) enum EngineEvent {
    Completion {
        awaitable_id: String,
        outcome: JobOutcome,
    },
    Control(ControlMessage),
}

/// Sends control messages to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineHandle {
    pub fn send(&self, message: ControlMessage) -> Result<()> {
        self.tx
            .send(EngineEvent::Control(message))
            .map_err(|_| EngineError::InstanceClosed)
    }
}

pub(crate) enum StepOutcome {
    Finished,
    Continue,
    Wait,
}

enum Progress {
    Finished,
    Reentered,
    Pending(Vec<String>),
}

/// One graph instance. All scheduling state lives here and is mutated from a
/// single task; backends and watchers talk back through the event channel.
pub struct GraphEngine {
    pub(crate) instance_id: String,
    pub(crate) definition: GraphDefinition,
    pub(crate) tasks: TaskTable,
    pub(crate) connectivity: Connectivity,
    pub(crate) context: ContextStore,
    pub(crate) awaitables: AwaitableRegistry,
    pub(crate) started: IndexSet<String>,
    pub(crate) execution_count: u32,
    pub(crate) for_cursor: usize,
    pub(crate) max_number_jobs: usize,
    pub(crate) graph_handlers: IndexMap<String, GraphHandlerBinding>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) backend: Arc<dyn ExecutionBackend>,
    pub(crate) store: Option<Arc<dyn GraphStore>>,
    pub(crate) options: EngineOptions,
    pub(crate) state: DriverState,
    pub(crate) events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    pub(crate) watchers: HashMap<String, AbortHandle>,
    /// Process awaitables restored from a checkpoint, watched again on the next run.
    pub(crate) rewatch: Vec<String>,
    pub(crate) reports: Vec<String>,
    /// Finished process ids the backend may forget after the next checkpoint.
    pub(crate) released: Vec<String>,
    /// Set on child engines: dropping one mid-run cancels its jobs.
    cancel_on_drop: bool,
    fatal: Option<EngineError>,
    started_at: DateTime<Utc>,
}

impl GraphEngine {
    pub fn new(definition: GraphDefinition, backend: Arc<dyn ExecutionBackend>) -> Result<Self> {
        definition.validate_structure()?;

        let tasks = TaskTable::from_definition(&definition)?;
        let connectivity = Connectivity::build(&tasks);
        let context = ContextStore::from_map(&definition.context)?;
        let graph_handlers = definition
            .error_handlers
            .iter()
            .map(|(key, handler)| (key.clone(), GraphHandlerBinding::from(handler)))
            .collect();
        let max_number_jobs = definition
            .max_number_jobs
            .unwrap_or(DEFAULT_MAX_NUMBER_JOBS)
            .max(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            definition,
            tasks,
            connectivity,
            context,
            awaitables: AwaitableRegistry::new(),
            started: IndexSet::new(),
            execution_count: 0,
            for_cursor: 0,
            max_number_jobs,
            graph_handlers,
            handlers: Arc::new(HandlerRegistry::new()),
            backend,
            store: None,
            options: EngineOptions::default(),
            state: DriverState::Setup,
            events_tx,
            events_rx,
            watchers: HashMap::new(),
            rewatch: Vec::new(),
            reports: Vec::new(),
            released: Vec::new(),
            cancel_on_drop: false,
            fatal: None,
            started_at: Utc::now(),
        })
    }

    pub fn with_store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_instance_id(mut self, instance_id: &str) -> Self {
        self.instance_id = instance_id.to_string();
        self
    }

    /// Override the graph's ceiling on outstanding jobs. Values below 1 are raised to 1.
    pub fn with_max_number_jobs(mut self, limit: usize) -> Self {
        self.max_number_jobs = limit.max(1);
        self
    }

    /// Merge extra values into the context before the instance starts.
    pub fn with_context_values(mut self, values: &Map<String, Value>) -> Result<Self> {
        self.context.merge(values)?;
        Ok(self)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn definition(&self) -> &GraphDefinition {
        &self.definition
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn awaitables(&self) -> &AwaitableRegistry {
        &self.awaitables
    }

    pub fn execution_count(&self) -> u32 {
        self.execution_count
    }

    /// `None` when idle, otherwise the outstanding awaitables.
    pub fn status(&self) -> Option<&str> {
        self.awaitables.status()
    }

    /// Mark this engine as a sub-graph child, owned by its parent's watcher.
    pub(crate) fn cancelling_jobs_on_drop(mut self) -> Self {
        self.cancel_on_drop = true;
        self
    }

    pub fn reports(&self) -> &[String] {
        &self.reports
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.events_tx.clone(),
        }
    }

    /// Move a waiting instance back to stepping. No-op in any other state.
    pub fn resume(&mut self) -> bool {
        if self.state == DriverState::Waiting {
            self.state = DriverState::Stepping;
            true
        } else {
            false
        }
    }

    /// Drive the instance to completion and produce its result.
    pub async fn run(mut self) -> GraphRunResult {
        if let Err(error) = self.drive().await {
            error!("Graph {} failed: {}", self.definition.name, error);
            self.state = DriverState::Failed;
            self.report(format!("Graph instance failed: {}", error));
            self.fatal = Some(error);
            self.abandon_outstanding().await;
            if let Err(persist_error) = self.persist().await {
                warn!("Could not persist failed instance: {}", persist_error);
            }
        }
        self.finalize()
    }

    #[instrument(skip(self), fields(graph = %self.definition.name, instance = %self.instance_id))]
    async fn drive(&mut self) -> Result<()> {
        self.started_at = Utc::now();
        if self.is_terminated() {
            return Ok(());
        }
        for id in std::mem::take(&mut self.rewatch) {
            self.watch_process(&id);
        }

        if self.state == DriverState::Setup {
            self.setup().await?;
        }

        loop {
            while let Ok(event) = self.events_rx.try_recv() {
                self.handle_event(event).await?;
            }

            match self.step().await? {
                StepOutcome::Finished => {
                    self.state = DriverState::Done;
                    self.report("Finalize graph.");
                    self.persist().await?;
                    return Ok(());
                }
                StepOutcome::Continue => {}
                StepOutcome::Wait => {
                    self.state = DriverState::Waiting;
                    self.persist().await?;
                    debug!("{}", self.awaitables.status().unwrap_or("Waiting"));
                    match self.events_rx.recv().await {
                        Some(event) => self.handle_event(event).await?,
                        None => return Err(EngineError::InstanceClosed),
                    }
                }
            }
        }
    }

    async fn setup(&mut self) -> Result<()> {
        info!(
            "Starting graph {} ({} tasks, instance {})",
            self.definition.name,
            self.tasks.len(),
            self.instance_id
        );
        self.report(format!("Setup graph instance {}", self.instance_id));

        let proceed = match self.definition.mode {
            GraphMode::Normal => true,
            GraphMode::While => self.check_while_conditions().await?,
            GraphMode::For => self.check_for_conditions().await?,
        };
        if !proceed {
            self.report("Graph conditions not met; skipping all tasks.");
            let all = self.tasks.names();
            self.tasks.set_tree_state(&all, TaskState::Skipped)?;
        }

        self.state = DriverState::Stepping;
        Ok(())
    }

    /// Dispatch everything that is ready, then decide what the driver does next.
    pub(crate) async fn step(&mut self) -> Result<StepOutcome> {
        self.state = DriverState::Stepping;

        let ready = self.ready_tasks()?;
        let dispatched = if ready.is_empty() {
            0
        } else {
            debug!("Tasks ready to run: {}", ready.join(", "));
            self.run_tasks(&ready).await?
        };

        match self.graph_progress().await? {
            Progress::Finished => Ok(StepOutcome::Finished),
            Progress::Reentered => Ok(StepOutcome::Continue),
            Progress::Pending(pending) => {
                if !self.awaitables.is_empty() {
                    Ok(StepOutcome::Wait)
                } else if dispatched > 0 {
                    Ok(StepOutcome::Continue)
                } else {
                    match self.events_rx.try_recv() {
                        Ok(event) => {
                            self.handle_event(event).await?;
                            Ok(StepOutcome::Continue)
                        }
                        Err(_) => Err(EngineError::Stalled { pending }),
                    }
                }
            }
        }
    }

    async fn graph_progress(&mut self) -> Result<Progress> {
        let pending: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| t.state().is_active())
            .map(|t| t.name.clone())
            .collect();
        if !pending.is_empty() {
            return Ok(Progress::Pending(pending));
        }

        let reentered = match self.definition.mode {
            GraphMode::Normal => false,
            GraphMode::While => self.check_while_conditions().await?,
            GraphMode::For => self.check_for_conditions().await?,
        };
        Ok(if reentered {
            Progress::Reentered
        } else {
            Progress::Finished
        })
    }

    async fn handle_event(&mut self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::Completion {
                awaitable_id,
                outcome,
            } => self.on_completion(&awaitable_id, outcome)?,
            EngineEvent::Control(message) => self.apply_control(message).await?,
        }
        self.resume();
        Ok(())
    }

    fn on_completion(&mut self, id: &str, outcome: JobOutcome) -> Result<()> {
        self.watchers.remove(id);
        let Some(awaitable) = self.awaitables.get(id).cloned() else {
            debug!("Ignoring completion of {}: no longer outstanding", id);
            return Ok(());
        };
        let name = awaitable.task.clone();
        if awaitable.target == AwaitableTarget::Process && self.tasks.get(&name)?.kind == TaskKind::RemoteJob {
            self.released.push(id.to_string());
        }
        let terminated = self.is_terminated();
        let running = self.tasks.state(&name)? == TaskState::Running;

        match outcome {
            JobOutcome::Finished(output) => {
                let raw = output.clone().into_value();
                let results = self.shape_results(&name, output)?;
                let value = if awaitable.outputs {
                    Value::Object(results.clone())
                } else {
                    raw
                };
                self.awaitables
                    .resolve(id, value, &mut self.context, terminated)?;
                if running {
                    self.settle_finished(&name, results)?;
                }
            }
            JobOutcome::Failed(failure) => {
                self.awaitables
                    .resolve(id, Value::Null, &mut self.context, terminated)?;
                if running {
                    self.fail_task(&name, failure)?;
                }
            }
            JobOutcome::Cancelled => {
                self.awaitables
                    .resolve(id, Value::Null, &mut self.context, terminated)?;
                if running {
                    self.mark_killed(&name)?;
                }
            }
        }

        if !running {
            debug!("Task {} is no longer running; completion recorded only", name);
        }
        Ok(())
    }

    async fn apply_control(&mut self, message: ControlMessage) -> Result<()> {
        for name in &message.tasks {
            if !self.tasks.contains(name) {
                warn!("Control message {} names unknown task {}", message.action, name);
                self.report(format!("Unknown task {} in {} message", name, message.action));
                continue;
            }
            self.report(format!("Task {} action: {}", name, message.action));

            match message.action {
                TaskAction::Reset => {
                    self.cancel_backend_process(name).await?;
                    self.reset_task(name, true, true)?;
                }
                TaskAction::Pause => self.tasks.get_mut(name)?.action = Some(TaskAction::Pause),
                TaskAction::Play => self.play_task(name).await?,
                TaskAction::Skip => self.skip_task(name)?,
                TaskAction::Kill => self.kill_task(name).await?,
            }
        }
        Ok(())
    }

    async fn play_task(&mut self, name: &str) -> Result<()> {
        let task = self.tasks.get_mut(name)?;
        task.action = None;
        let (state, process_id) = (task.state(), task.process_id.clone());

        if let (TaskState::Created, Some(process_id)) = (state, process_id) {
            match self.backend.play(&process_id).await {
                Ok(()) => {
                    info!("Task {} started", name);
                    self.tasks.set_state(name, TaskState::Running)?;
                }
                Err(failure) => {
                    self.drop_awaitables(name)?;
                    self.tasks.set_state(name, TaskState::Running)?;
                    self.fail_task(name, failure)?;
                }
            }
        }
        Ok(())
    }

    fn skip_task(&mut self, name: &str) -> Result<()> {
        self.drop_awaitables(name)?;
        self.tasks
            .set_tree_state(&[name.to_string()], TaskState::Skipped)?;
        self.update_parent(name)
    }

    /// Cancel a running job, sub-graph, awaitable or monitor task.
    async fn kill_task(&mut self, name: &str) -> Result<()> {
        let task = self.tasks.get(name)?;
        if task.state() != TaskState::Running || !task.kind.is_cancellable() {
            self.report(format!(
                "Task {} is {} and cannot be killed",
                name,
                task.state()
            ));
            return Ok(());
        }

        self.cancel_backend_process(name).await?;
        self.drop_awaitables(name)?;
        self.mark_killed(name)
    }

    async fn cancel_backend_process(&mut self, name: &str) -> Result<()> {
        let task = self.tasks.get(name)?;
        if task.kind == TaskKind::RemoteJob && task.state().is_active() {
            if let Some(process_id) = task.process_id.clone() {
                self.backend.cancel(&process_id).await;
                self.released.push(process_id);
            }
        }
        Ok(())
    }

    pub(crate) fn mark_killed(&mut self, name: &str) -> Result<()> {
        self.tasks.set_state(name, TaskState::Killed)?;
        warn!("Task {} killed", name);
        self.report(format!("Task: {} killed.", name));
        let skipped = self.cascade_skip(name)?;
        self.update_parents_of(&skipped)?;
        self.update_parent(name)
    }

    /// Resolve a task's outstanding awaitables with `null` and stop watching them.
    pub(crate) fn drop_awaitables(&mut self, name: &str) -> Result<()> {
        for id in self.awaitables.discard_task(name, &mut self.context)? {
            if let Some(handle) = self.watchers.remove(&id) {
                handle.abort();
            }
        }
        Ok(())
    }

    pub(crate) fn watch_process(&mut self, process_id: &str) {
        let future = self.backend.watch(process_id);
        self.spawn_watcher(process_id, future);
    }

    /// Forward the completion of `future` into the event channel.
    pub(crate) fn spawn_watcher(&mut self, awaitable_id: &str, future: BoxFuture<'static, JobOutcome>) {
        let tx = self.events_tx.clone();
        let id = awaitable_id.to_string();
        let handle = tokio::spawn(async move {
            let outcome = future.await;
            let _ = tx.send(EngineEvent::Completion {
                awaitable_id: id,
                outcome,
            });
        });
        self.watchers
            .insert(awaitable_id.to_string(), handle.abort_handle());
    }

    async fn abandon_outstanding(&mut self) {
        for (_, handle) in self.watchers.drain() {
            handle.abort();
        }
        for process_id in self.outstanding_jobs() {
            self.backend.cancel(&process_id).await;
        }
    }

    /// Process ids of remote jobs still awaited. Child graphs are not listed;
    /// aborting their watchers drops them, and they cancel their own jobs.
    fn outstanding_jobs(&self) -> Vec<String> {
        self.awaitables
            .outstanding()
            .iter()
            .filter(|awaitable| awaitable.target == AwaitableTarget::Process)
            .filter(|awaitable| {
                self.tasks
                    .get(&awaitable.task)
                    .map_or(false, |t| t.kind == TaskKind::RemoteJob)
            })
            .map(|awaitable| awaitable.id.clone())
            .collect()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        matches!(self.state, DriverState::Done | DriverState::Failed)
    }

    /// Mirror journaled task changes and a checkpoint into the store, if any.
    pub(crate) async fn persist(&mut self) -> Result<()> {
        let changes = self.tasks.take_journal();
        if let Some(store) = self.store.clone() {
            for change in changes {
                store
                    .persist_task_field(&self.instance_id, &change.task, change.field, &change.value)
                    .await?;
            }
            store.save_checkpoint(&self.checkpoint()).await?;
        }
        // Only once no checkpoint can still ask to watch them again.
        for process_id in std::mem::take(&mut self.released) {
            self.backend.release(&process_id);
        }
        Ok(())
    }

    pub(crate) fn report(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.reports.push(message);
    }

    fn finalize(mut self) -> GraphRunResult {
        let exit = match &self.fatal {
            Some(error) => ExitCondition::from(error),
            None => {
                let failed = self.tasks.names_in_state(TaskState::Failed);
                if failed.is_empty() {
                    ExitCondition::Success
                } else {
                    self.report(format!(
                        "Graph finished, but tasks {} failed. Their descendants were skipped.",
                        failed.join(", ")
                    ));
                    ExitCondition::TaskFailed { tasks: failed }
                }
            }
        };
        info!("Graph {} finished: {}", self.definition.name, exit);

        let end_time = Utc::now();
        let tasks: Vec<TaskReport> = self.tasks.iter().map(TaskReport::from).collect();
        let summary = RunSummary::from_reports(&tasks);

        GraphRunResult {
            graph_name: self.definition.name.clone(),
            instance_id: self.instance_id.clone(),
            start_time: self.started_at,
            end_time,
            duration: (end_time - self.started_at).to_std().unwrap_or_default(),
            exit,
            execution_count: self.execution_count,
            outputs: self.collect_outputs(),
            context: self.context.to_value(),
            tasks,
            summary,
            reports: std::mem::take(&mut self.reports),
        }
    }

    /// Build the published outputs from `{name, from}` bindings.
    fn collect_outputs(&self) -> Value {
        let mut outputs = Map::new();
        for binding in &self.definition.outputs {
            let value = match binding.from.split_once('.') {
                Some(("context", path)) => self.context.get(path),
                Some((task, socket)) => self
                    .tasks
                    .get(task)
                    .ok()
                    .and_then(|t| t.output(socket)),
                None => self
                    .tasks
                    .get(&binding.from)
                    .ok()
                    .map(|t| t.results().cloned().map(Value::Object).unwrap_or(Value::Null)),
            };
            if let Some(value) = value {
                insert_nested(&mut outputs, &binding.name, value);
            }
        }
        Value::Object(outputs)
    }
}

fn insert_nested(target: &mut Map<String, Value>, name: &str, value: Value) {
    match name.split_once('.') {
        None => {
            target.insert(name.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(inner) = entry {
                insert_nested(inner, rest, value);
            }
        }
    }
}

impl Drop for GraphEngine {
    fn drop(&mut self) {
        if !self.cancel_on_drop || self.is_terminated() {
            return;
        }
        for (_, handle) in self.watchers.drain() {
            handle.abort();
        }
        let jobs = self.outstanding_jobs();
        if jobs.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(
                    "Sub-graph instance {} dropped; cancelling jobs {}",
                    self.instance_id,
                    jobs.join(", ")
                );
                let backend = self.backend.clone();
                runtime.spawn(async move {
                    for process_id in jobs {
                        backend.cancel(&process_id).await;
                    }
                });
            }
            Err(_) => warn!(
                "Sub-graph instance {} dropped outside a runtime; jobs {} keep running",
                self.instance_id,
                jobs.join(", ")
            ),
        }
    }
}

/// Boxed so a sub-graph task can run a child engine inside its watcher.
pub(crate) fn launch_subgraph(engine: GraphEngine) -> BoxFuture<'static, GraphRunResult> {
    Box::pin(engine.run())
}
