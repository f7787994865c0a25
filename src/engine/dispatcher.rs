// ABOUTME: Task dispatcher: readiness scan, admission control, input resolution, per-kind execution
// ABOUTME: Settles finished and failed tasks and registers awaitables for asynchronous kinds

use futures::FutureExt;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::awaitable::{Awaitable, AwaitableTarget};
use super::backend::{JobOutcome, TaskFailure, TaskOutput};
use super::driver::{launch_subgraph, GraphEngine};
use super::error::{EngineError, Result};
use super::result::GraphRunResult;
use super::task::{Link, TaskAction, TaskKind, TaskState};
use crate::parser::{GraphDefinition, WAIT_SOCKET};

impl GraphEngine {
    /// PLANNED tasks, not yet started, whose parent is running and whose
    /// scope inputs have all reached a terminal state.
    pub(crate) fn ready_tasks(&self) -> Result<Vec<String>> {
        let mut ready = Vec::new();
        for task in self.tasks.iter() {
            if task.state() != TaskState::Planned || self.started.contains(&task.name) {
                continue;
            }
            if let Some(parent) = &task.parent {
                if self.tasks.state(parent)? != TaskState::Running {
                    continue;
                }
            }
            let mut gated = false;
            for input in self.connectivity.scope_inputs(&task.name) {
                if !self.tasks.state(input)?.is_terminal() {
                    gated = true;
                    break;
                }
            }
            if !gated {
                ready.push(task.name.clone());
            }
        }
        Ok(ready)
    }

    /// Dispatch `names` in order, refusing admission-limited kinds while the
    /// outstanding awaitables are at the ceiling. Returns how many were started.
    pub(crate) async fn run_tasks(&mut self, names: &[String]) -> Result<usize> {
        let mut dispatched = 0;
        for name in names {
            let task = self.tasks.get(name)?;
            if task.state() != TaskState::Planned || self.started.contains(name) {
                continue;
            }
            if task.kind.is_admission_limited() && self.awaitables.len() >= self.max_number_jobs {
                warn!(
                    "Max number of jobs ({}) reached; task {} waits",
                    self.max_number_jobs, name
                );
                self.report(format!(
                    "The maximum number of subprocesses ({}) has been reached. Task {} waits.",
                    self.max_number_jobs, name
                ));
                continue;
            }

            self.started.insert(name.clone());
            self.dispatch(name).await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    pub(crate) async fn dispatch(&mut self, name: &str) -> Result<()> {
        let kind = self.tasks.get(name)?.kind.clone();
        info!("Running task {} ({})", name, kind);
        self.report(format!("Run task: {}, type: {}", name, kind));

        match kind {
            TaskKind::Pure => self.run_pure(name).await,
            TaskKind::Data => self.run_data(name),
            TaskKind::RemoteJob => self.run_remote_job(name).await,
            TaskKind::SubGraph => self.run_sub_graph(name).await,
            TaskKind::GraphBuilder => self.run_graph_builder(name).await,
            TaskKind::Awaitable => self.run_awaitable(name),
            TaskKind::Monitor => self.run_monitor(name),
            TaskKind::FromContext => self.run_from_context(name),
            TaskKind::ToContext => self.run_to_context(name),
            TaskKind::Scope => self.enter_scope(name),
            TaskKind::Conditional => {
                let inputs = self.resolve_inputs(name)?;
                self.enter_conditional(name, &inputs)
            }
            TaskKind::Loop => {
                let inputs = self.resolve_inputs(name)?;
                self.enter_loop(name, &inputs)
            }
            TaskKind::Unknown(kind) => Err(EngineError::UnknownTaskKind {
                task: name.to_string(),
                kind,
            }),
        }
    }

    /// Resolve the inputs of `name` from its links and literal properties.
    pub(crate) fn resolve_inputs(&self, name: &str) -> Result<Map<String, Value>> {
        let task = self.tasks.get(name)?;

        let mut sockets: Vec<String> = task.inputs.keys().cloned().collect();
        for link in self.tasks.incoming(name, None) {
            if !sockets.contains(&link.to_socket) {
                sockets.push(link.to_socket.clone());
            }
        }

        let mut inputs = Map::new();
        for socket in &sockets {
            if socket == WAIT_SOCKET {
                continue;
            }
            let links: Vec<&Link> = self
                .tasks
                .incoming(name, Some(socket.as_str()))
                .filter(|l| l.carries_value())
                .collect();

            match links.as_slice() {
                [] => {
                    if let Some(property) = task.inputs.get(socket) {
                        inputs.insert(socket.clone(), self.context.substitute(property));
                    }
                }
                [link] => {
                    inputs.insert(socket.clone(), self.link_value(link));
                }
                many => {
                    let values = many
                        .iter()
                        .map(|l| (format!("{}_{}", l.from_task, l.from_socket), self.link_value(l)))
                        .collect();
                    inputs.insert(socket.clone(), Value::Object(values));
                }
            }
        }
        Ok(inputs)
    }

    fn link_value(&self, link: &Link) -> Value {
        self.tasks
            .get(&link.from_task)
            .ok()
            .and_then(|source| source.output(&link.from_socket))
            .unwrap_or(Value::Null)
    }

    /// Turn an executor's output into the task's result mapping.
    pub(crate) fn shape_results(&self, name: &str, output: TaskOutput) -> Result<Map<String, Value>> {
        let task = self.tasks.get(name)?;
        let declared = task.value_outputs();

        match output {
            TaskOutput::Single(value) => {
                let socket = declared.first().copied().unwrap_or("result");
                let mut results = Map::new();
                results.insert(socket.to_string(), value);
                Ok(results)
            }
            TaskOutput::Tuple(values) => {
                if values.len() != declared.len() {
                    return Err(EngineError::OutputArityMismatch {
                        task: name.to_string(),
                        expected: declared.len(),
                        actual: values.len(),
                    });
                }
                Ok(declared
                    .iter()
                    .map(|socket| socket.to_string())
                    .zip(values)
                    .collect())
            }
            TaskOutput::Mapping(map) => Ok(map),
        }
    }

    pub(crate) fn finish_task(&mut self, name: &str, output: TaskOutput) -> Result<()> {
        let results = self.shape_results(name, output)?;
        self.settle_finished(name, results)
    }

    /// FINISHED with `results`, copy mapped sockets into the context, re-derive the parent.
    pub(crate) fn settle_finished(&mut self, name: &str, results: Map<String, Value>) -> Result<()> {
        self.tasks.settle(name, TaskState::Finished, results)?;

        let task = self.tasks.get(name)?;
        let mut writes = Vec::new();
        for (socket, path) in &task.context_mapping {
            if let Some(value) = task.output(socket) {
                writes.push((path.clone(), value));
            }
        }
        for (path, value) in writes {
            self.context.set(&path, value)?;
        }

        info!("Task {} finished", name);
        self.report(format!("Task: {} finished.", name));
        self.update_parent(name)
    }

    /// FAILED, skip everything downstream, give error handlers a chance, re-derive parents.
    pub(crate) fn fail_task(&mut self, name: &str, failure: TaskFailure) -> Result<()> {
        error!("Task {} failed: {}", name, failure);
        {
            let task = self.tasks.get_mut(name)?;
            task.exit_code = failure.exit_code;
            task.error = Some(failure.message.clone());
        }
        self.tasks.settle(name, TaskState::Failed, failure.outputs)?;
        self.report(format!("Task: {} failed.", name));

        let skipped = self.cascade_skip(name)?;
        self.run_error_handlers(name)?;
        self.update_parent(name)?;
        self.update_parents_of(&skipped)
    }

    fn executor_of(&self, name: &str) -> Result<Option<String>> {
        Ok(self.tasks.get(name)?.executor.clone())
    }

    /// Fail `name` because it has nothing to run.
    fn fail_missing_executor(&mut self, name: &str) -> Result<()> {
        self.fail_task(name, TaskFailure::new(format!("Task {} has no executor", name)))
    }

    async fn run_pure(&mut self, name: &str) -> Result<()> {
        let Some(executor) = self.executor_of(name)? else {
            return self.fail_missing_executor(name);
        };
        let inputs = self.resolve_inputs(name)?;
        self.tasks.set_state(name, TaskState::Running)?;

        match self.backend.invoke(&executor, &inputs).await {
            Ok(output) => self.finish_task(name, output),
            Err(failure) => self.fail_task(name, failure),
        }
    }

    fn run_data(&mut self, name: &str) -> Result<()> {
        let mut inputs = self.resolve_inputs(name)?;
        let value = inputs
            .remove("value")
            .unwrap_or_else(|| Value::Object(inputs));
        self.finish_task(name, TaskOutput::Single(value))
    }

    fn run_from_context(&mut self, name: &str) -> Result<()> {
        let inputs = self.resolve_inputs(name)?;
        let Some(key) = inputs.get("key").and_then(Value::as_str) else {
            return self.fail_task(name, TaskFailure::new("from_context needs a string 'key' input"));
        };
        let value = self.context.get(key).unwrap_or(Value::Null);
        self.finish_task(name, TaskOutput::Single(value))
    }

    fn run_to_context(&mut self, name: &str) -> Result<()> {
        let inputs = self.resolve_inputs(name)?;
        let Some(key) = inputs.get("key").and_then(Value::as_str) else {
            return self.fail_task(name, TaskFailure::new("to_context needs a string 'key' input"));
        };
        let value = inputs.get("value").cloned().unwrap_or(Value::Null);
        self.context.set(key, value)?;
        self.finish_task(name, TaskOutput::Mapping(Map::new()))
    }

    async fn run_remote_job(&mut self, name: &str) -> Result<()> {
        let Some(executor) = self.executor_of(name)? else {
            return self.fail_missing_executor(name);
        };
        let inputs = self.resolve_inputs(name)?;
        let paused = self.tasks.get(name)?.action == Some(TaskAction::Pause);

        let submitted = if paused {
            self.backend.create_paused(&executor, &inputs).await
        } else {
            self.backend.submit(&executor, &inputs).await
        };
        let process_id = match submitted {
            Ok(process_id) => process_id,
            Err(failure) => return self.fail_task(name, failure),
        };

        self.tasks.set_process(name, Some(process_id.clone()))?;
        if paused {
            self.tasks.get_mut(name)?.action = None;
            self.tasks.set_state(name, TaskState::Created)?;
            self.report(format!("Task {} created paused as process {}", name, process_id));
        } else {
            self.tasks.set_state(name, TaskState::Running)?;
            debug!("Task {} submitted as process {}", name, process_id);
        }

        let awaitable = self.awaitable_for(name, &process_id, AwaitableTarget::Process);
        self.awaitables.register(awaitable, &mut self.context)?;
        self.watch_process(&process_id);
        Ok(())
    }

    async fn run_sub_graph(&mut self, name: &str) -> Result<()> {
        let inputs = self.resolve_inputs(name)?;
        match self.sub_graph_definition(name).await? {
            Ok(definition) => self.launch_child(name, definition, &inputs),
            Err(failure) => self.fail_task(name, failure),
        }
    }

    /// Invoke the builder executor and run the graph it returns as a child
    /// instance. The inputs feed the builder, not the child's context.
    async fn run_graph_builder(&mut self, name: &str) -> Result<()> {
        let Some(executor) = self.executor_of(name)? else {
            return self.fail_missing_executor(name);
        };
        let inputs = self.resolve_inputs(name)?;
        let built = self
            .backend
            .invoke(&executor, &inputs)
            .await
            .and_then(|output| built_graph(&executor, output));

        match built {
            Ok(mut definition) => {
                definition.name = name.to_string();
                self.launch_child(name, definition, &Map::new())
            }
            Err(failure) => self.fail_task(name, failure),
        }
    }

    /// Start `definition` as an independent child engine seeded with `seed`,
    /// watched through a process awaitable.
    fn launch_child(
        &mut self,
        name: &str,
        definition: GraphDefinition,
        seed: &Map<String, Value>,
    ) -> Result<()> {
        let child = GraphEngine::new(definition, self.backend.clone()).and_then(|engine| {
            engine
                .with_handlers(self.handlers.clone())
                .with_options(self.options.clone())
                .with_context_values(seed)
        });
        let child = match child {
            Ok(child) => child.cancelling_jobs_on_drop(),
            Err(error) => {
                return self.fail_task(name, TaskFailure::new(format!("Invalid sub-graph: {}", error)))
            }
        };

        let instance_id = child.instance_id().to_string();
        self.tasks.set_process(name, Some(instance_id.clone()))?;
        self.tasks.set_state(name, TaskState::Running)?;
        self.report(format!("Task {} launched sub-graph instance {}", name, instance_id));

        let awaitable = self.awaitable_for(name, &instance_id, AwaitableTarget::Process);
        self.awaitables.register(awaitable, &mut self.context)?;
        let future = launch_subgraph(child).map(sub_graph_outcome).boxed();
        self.spawn_watcher(&instance_id, future);
        Ok(())
    }

    /// The inline graph of a sub-graph task, or the stored graph named by its executor.
    async fn sub_graph_definition(&self, name: &str) -> Result<std::result::Result<GraphDefinition, TaskFailure>> {
        let task = self.tasks.get(name)?;
        if let Some(graph) = &task.graph {
            return Ok(Ok(graph.as_ref().clone()));
        }
        let (Some(store), Some(graph_id)) = (&self.store, &task.executor) else {
            return Ok(Err(TaskFailure::new(format!(
                "Task {} has neither an inline graph nor a stored graph to load",
                name
            ))));
        };
        Ok(store
            .load_graph(graph_id)
            .await
            .map_err(|e| TaskFailure::new(format!("Could not load graph {}: {}", graph_id, e))))
    }

    fn run_awaitable(&mut self, name: &str) -> Result<()> {
        let Some(executor) = self.executor_of(name)? else {
            return self.fail_missing_executor(name);
        };
        let inputs = self.resolve_inputs(name)?;

        let future = match self.backend.spawn(&executor, inputs) {
            Ok(future) => future,
            Err(failure) => return self.fail_task(name, failure),
        };
        self.start_async_task(name, future.map(JobOutcome::from).boxed())
    }

    fn run_monitor(&mut self, name: &str) -> Result<()> {
        let Some(executor) = self.executor_of(name)? else {
            return self.fail_missing_executor(name);
        };
        let mut inputs = self.resolve_inputs(name)?;
        let interval = seconds(inputs.remove("interval")).unwrap_or(self.options.monitor_interval);
        let timeout = seconds(inputs.remove("timeout")).unwrap_or(self.options.monitor_timeout);

        let future = crate::tasks::monitor::poll_until(
            self.backend.clone(),
            executor,
            inputs,
            interval,
            timeout,
        );
        self.start_async_task(name, future.map(JobOutcome::from).boxed())
    }

    fn start_async_task(
        &mut self,
        name: &str,
        future: futures::future::BoxFuture<'static, JobOutcome>,
    ) -> Result<()> {
        let id = format!("{}-{}", name, uuid::Uuid::new_v4().simple());
        self.tasks.set_state(name, TaskState::Running)?;
        let awaitable = self.awaitable_for(name, &id, AwaitableTarget::AsyncTask);
        self.awaitables.register(awaitable, &mut self.context)?;
        self.spawn_watcher(&id, future);
        Ok(())
    }

    /// Awaitables land at the task's name, or are appended to `collect_into`.
    fn awaitable_for(&self, name: &str, id: &str, target: AwaitableTarget) -> Awaitable {
        match self.tasks.get(name).ok().and_then(|t| t.collect_into.clone()) {
            Some(path) => Awaitable::new(id, name, target, &path).appending(),
            None => Awaitable::new(id, name, target, name),
        }
    }

    /// Skip every still-active link descendant of `name`.
    pub(crate) fn cascade_skip(&mut self, name: &str) -> Result<Vec<String>> {
        let mut skipped = Vec::new();
        for descendant in self.connectivity.descendants(name).to_vec() {
            if self.tasks.state(&descendant)?.is_active() {
                skipped.push(descendant);
            }
        }
        if !skipped.is_empty() {
            debug!("Skipping descendants of {}: {}", name, skipped.join(", "));
            self.tasks.set_tree_state(&skipped, TaskState::Skipped)?;
        }
        Ok(skipped)
    }
}

fn seconds(value: Option<Value>) -> Option<Duration> {
    value
        .and_then(|v| v.as_f64())
        .filter(|secs| *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// A builder's output is the graph itself, either as a mapping or as YAML text.
fn built_graph(executor: &str, output: TaskOutput) -> std::result::Result<GraphDefinition, TaskFailure> {
    let definition = match output.into_value() {
        Value::String(yaml) => GraphDefinition::from_yaml(&yaml).map_err(|e| e.to_string()),
        value => serde_json::from_value::<GraphDefinition>(value)
            .map_err(|e| e.to_string())
            .and_then(|graph| graph.validate_structure().map(|_| graph).map_err(|e| e.to_string())),
    };
    definition.map_err(|reason| {
        TaskFailure::new(format!("Graph builder {} returned an invalid graph: {}", executor, reason))
    })
}

fn sub_graph_outcome(result: GraphRunResult) -> JobOutcome {
    let success = result.is_success();
    let exit_code = result.exit_code();
    let mut outputs = match result.outputs {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    outputs.insert(
        "execution_count".to_string(),
        Value::from(result.execution_count),
    );

    if success {
        JobOutcome::Finished(TaskOutput::Mapping(outputs))
    } else {
        JobOutcome::Failed(
            TaskFailure::new(format!("Sub-graph {} failed: {}", result.graph_name, result.exit))
                .with_exit_code(exit_code)
                .with_outputs(outputs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_built_graph_accepts_mapping_and_yaml() {
        let mapping = json!({
            "name": "built",
            "tasks": {"a": {"executor": "const", "inputs": {"value": 1}}}
        });
        let graph = built_graph("builder", TaskOutput::Single(mapping)).unwrap();
        assert_eq!(graph.task_names(), vec!["a"]);

        let yaml = "name: built\ntasks:\n  b:\n    executor: const\n";
        let graph = built_graph("builder", TaskOutput::Single(json!(yaml))).unwrap();
        assert_eq!(graph.task_names(), vec!["b"]);

        let failure = built_graph("builder", TaskOutput::Single(json!({"name": "empty", "tasks": {}})))
            .unwrap_err();
        assert!(failure.message.contains("builder returned an invalid graph"));
    }

    #[test]
    fn test_seconds_parsing() {
        assert_eq!(seconds(Some(json!(2))), Some(Duration::from_secs(2)));
        assert_eq!(seconds(Some(json!(0.5))), Some(Duration::from_millis(500)));
        assert_eq!(seconds(Some(json!(-1))), None);
        assert_eq!(seconds(Some(json!("soon"))), None);
        assert_eq!(seconds(None), None);
    }
}
