// ABOUTME: Integration tests for the step driver, dispatcher and awaitable handling
// ABOUTME: Runs whole graph instances against the reference executor registry

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use stepgraph::engine::{
    ControlMessage, ExitCondition, GraphEngine, TaskAction, TaskFailure, TaskOutput, TaskState,
};
use stepgraph::store::{GraphStore, MemoryGraphStore};

mod common;
use common::{
    backend, context_value, doubling_while_graph, engine, has_report, parse, run, run_graph,
    run_yaml,
};

fn report_position(result: &stepgraph::GraphRunResult, prefix: &str) -> usize {
    result
        .reports
        .iter()
        .position(|line| line.starts_with(prefix))
        .unwrap_or_else(|| panic!("no report starting with {:?}", prefix))
}

#[tokio::test]
async fn test_linked_pure_tasks() {
    let graph = parse(
        r#"
name: linked
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
  - name: total
    from: b.result
"#,
    );

    let result = run_graph(graph).await;

    assert!(result.is_success(), "{}", result.exit);
    assert_eq!(result.task_output("b", "result"), Some(&json!(7)));
    assert_eq!(result.output("total"), Some(&json!(7)));
    assert_eq!(result.summary.finished_tasks, 2);
}

#[tokio::test]
async fn test_context_substitution_and_mapping() {
    let result = run_yaml(
        r#"
name: context
context:
  settings:
    factor: 5
tasks:
  scale:
    executor: multiply
    inputs:
      x: "{{ settings.factor }}"
      y: 3
    context_mapping:
      result: stats.scaled
  read:
    kind: from_context
    inputs:
      key: stats.scaled
    wait_for: [scale]
outputs:
  - name: scaled
    from: context.stats.scaled
  - name: echoed
    from: read.result
"#,
    )
    .await;

    assert!(result.is_success());
    assert_eq!(context_value(&result, "stats.scaled"), json!(15));
    assert_eq!(result.output("scaled"), Some(&json!(15)));
    assert_eq!(result.output("echoed"), Some(&json!(15)));
}

#[tokio::test]
async fn test_multiple_links_are_collected_into_a_mapping() {
    let result = run_yaml(
        r#"
name: fan_in
tasks:
  a:
    executor: const
    inputs:
      value: 1
  b:
    executor: const
    inputs:
      value: 2
  total:
    executor: sum
    links:
      values: [a.result, b.result]
"#,
    )
    .await;

    assert!(result.is_success());
    assert_eq!(result.task_output("total", "result"), Some(&json!(3)));
}

#[tokio::test]
async fn test_tuple_outputs_and_arity_mismatch() {
    let mut registry = stepgraph::ExecutorRegistry::new();
    registry.register_fn("pair", |_inputs: &serde_json::Map<String, serde_json::Value>| {
        Ok(stepgraph::engine::TaskOutput::Tuple(vec![json!(1), json!(2)]))
    });
    let registry = Arc::new(registry);

    let ok = parse(
        r#"
name: tuple
tasks:
  split:
    executor: pair
    outputs: [low, high]
"#,
    );
    let result = run(GraphEngine::new(ok, registry.clone()).unwrap()).await;
    assert!(result.is_success());
    assert_eq!(result.task_output("split", "high"), Some(&json!(2)));

    let mismatch = parse(
        r#"
name: tuple
tasks:
  split:
    executor: pair
    outputs: [only]
"#,
    );
    let result = run(GraphEngine::new(mismatch, registry).unwrap()).await;
    assert!(matches!(result.exit, ExitCondition::OutputArityMismatch { .. }));
    assert_eq!(result.exit_code(), 301);
}

#[tokio::test]
async fn test_failure_cascades_skip_to_descendants() {
    let result = run_yaml(
        r#"
name: cascade
tasks:
  broken:
    executor: fail
    inputs:
      message: boom
      exit_code: 3
  child:
    executor: identity
    links:
      x: [broken.result]
  grandchild:
    executor: identity
    links:
      x: [child.result]
  independent:
    executor: const
    inputs:
      value: ok
"#,
    )
    .await;

    assert_eq!(result.task_state("broken"), Some(TaskState::Failed));
    assert_eq!(result.task_state("child"), Some(TaskState::Skipped));
    assert_eq!(result.task_state("grandchild"), Some(TaskState::Skipped));
    assert_eq!(result.task_state("independent"), Some(TaskState::Finished));
    assert_eq!(
        result.exit,
        ExitCondition::TaskFailed {
            tasks: vec!["broken".to_string()]
        }
    );
    assert_eq!(result.exit_code(), 302);
    assert_eq!(result.get_task("broken").unwrap().exit_code, Some(3));
}

#[tokio::test]
async fn test_unknown_task_kind_is_fatal() {
    let result = run_yaml(
        r#"
name: unknown
tasks:
  odd:
    kind: teleport
"#,
    )
    .await;

    assert_eq!(
        result.exit,
        ExitCondition::UnknownTaskKind {
            task: "odd".to_string(),
            kind: "teleport".to_string()
        }
    );
    assert_eq!(result.exit_code(), 202);
}

#[tokio::test]
async fn test_append_preserves_registration_order() {
    let result = run_yaml(
        r#"
name: gather
tasks:
  first:
    kind: awaitable
    executor: sleep
    collect_into: results
    inputs:
      seconds: 0.15
      value: A
  second:
    kind: awaitable
    executor: sleep
    collect_into: results
    inputs:
      seconds: 0.01
      value: B
  third:
    kind: awaitable
    executor: sleep
    collect_into: results
    inputs:
      seconds: 0.08
      value: C
"#,
    )
    .await;

    assert!(result.is_success());
    assert_eq!(context_value(&result, "results"), json!(["A", "B", "C"]));
}

#[tokio::test]
async fn test_remote_job_outputs_land_in_context() {
    let result = run_yaml(
        r#"
name: shell
tasks:
  greet:
    kind: remote_job
    executor: shell
    inputs:
      command: echo
      args: [hello]
  length:
    executor: identity
    links:
      x: [greet.exit_code]
"#,
    )
    .await;

    assert!(result.is_success(), "{}", result.exit);
    let stdout = result.task_output("greet", "stdout").unwrap();
    assert!(stdout.as_str().unwrap().contains("hello"));
    assert_eq!(result.task_output("length", "result"), Some(&json!(0)));
    assert_eq!(context_value(&result, "greet.exit_code"), json!(0));
}

#[tokio::test]
async fn test_job_ceiling_defers_admission() {
    let result = run_yaml(
        r#"
name: backpressure
max_number_jobs: 1
tasks:
  job1:
    kind: remote_job
    executor: sleep
    inputs:
      seconds: 0.05
      value: 1
  job2:
    kind: remote_job
    executor: sleep
    inputs:
      seconds: 0.05
      value: 2
  job3:
    kind: remote_job
    executor: sleep
    inputs:
      seconds: 0.05
      value: 3
"#,
    )
    .await;

    assert!(result.is_success());
    assert_eq!(result.summary.finished_tasks, 3);
    assert!(has_report(&result, "maximum number of subprocesses (1)"));
    assert!(report_position(&result, "Task: job1 finished.") < report_position(&result, "Run task: job2"));
    assert!(report_position(&result, "Task: job2 finished.") < report_position(&result, "Run task: job3"));
}

#[tokio::test]
async fn test_error_handler_retries_with_patched_inputs() {
    let result = run_yaml(
        r#"
name: retry
tasks:
  check:
    executor: at_least
    inputs:
      x: 1
      min: 3
      exit_code: 11
    error_handlers:
      bump:
        handler: increment_input
        exit_codes: [11]
        max_retries: 5
        kwargs:
          input: x
  after:
    executor: identity
    links:
      x: [check.result]
"#,
    )
    .await;

    assert!(result.is_success(), "{}", result.exit);
    assert_eq!(result.task_output("check", "result"), Some(&json!(3)));
    assert_eq!(result.task_output("after", "result"), Some(&json!(3)));
    assert!(has_report(&result, "Set check.x to 3"));
}

#[tokio::test]
async fn test_error_handler_budget_is_enforced() {
    let result = run_yaml(
        r#"
name: retry_budget
tasks:
  check:
    executor: at_least
    inputs:
      x: 1
      min: 10
      exit_code: 11
error_handlers:
  bump:
    handler: increment_input
    tasks:
      check:
        handler: increment_input
        exit_codes: [11]
        max_retries: 2
        kwargs:
          input: x
"#,
    )
    .await;

    assert_eq!(result.task_state("check"), Some(TaskState::Failed));
    assert!(has_report(&result, "exhausted its 2 retries"));
}

#[tokio::test]
async fn test_kill_running_job() {
    let graph = parse(
        r#"
name: kill
tasks:
  slow:
    kind: remote_job
    executor: sleep
    inputs:
      seconds: 30
  after:
    executor: identity
    links:
      x: [slow.result]
"#,
    );
    let engine = engine(graph);
    let handle = engine.handle();
    let running = tokio::spawn(run(engine));

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle
        .send(ControlMessage::new(TaskAction::Kill, &["slow"]))
        .unwrap();

    let result = running.await.unwrap();
    assert_eq!(result.task_state("slow"), Some(TaskState::Killed));
    assert_eq!(result.task_state("after"), Some(TaskState::Skipped));
    assert!(result.is_success());
    assert!(result.duration < Duration::from_secs(10));
}

#[tokio::test]
async fn test_paused_job_runs_after_play() {
    let graph = parse(
        r#"
name: pause
tasks:
  job:
    kind: remote_job
    executor: const
    paused: true
    inputs:
      value: 42
"#,
    );
    let engine = engine(graph);
    let handle = engine.handle();
    let running = tokio::spawn(run(engine));

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle
        .send(ControlMessage::new(TaskAction::Play, &["job"]))
        .unwrap();

    let result = running.await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.task_output("job", "result"), Some(&json!(42)));
    assert!(has_report(&result, "created paused"));
}

#[tokio::test]
async fn test_skip_pending_task() {
    let graph = parse(
        r#"
name: skip
tasks:
  gate:
    kind: remote_job
    executor: sleep
    paused: true
  downstream:
    executor: const
    inputs:
      value: 1
    wait_for: [gate]
"#,
    );
    let engine = engine(graph);
    let handle = engine.handle();
    let running = tokio::spawn(run(engine));

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle
        .send(ControlMessage::new(TaskAction::Skip, &["gate"]))
        .unwrap();

    let result = running.await.unwrap();
    assert_eq!(result.task_state("gate"), Some(TaskState::Skipped));
    assert_eq!(result.task_state("downstream"), Some(TaskState::Finished));
}

#[tokio::test]
async fn test_sub_graph_publishes_outputs() {
    let result = run_yaml(
        r#"
name: parent
tasks:
  child:
    kind: sub_graph
    inputs:
      n: 21
    graph:
      name: doubler
      tasks:
        double:
          executor: multiply
          inputs:
            x: "{{ n }}"
            y: 2
      outputs:
        - name: result
          from: double.result
  use:
    executor: add
    inputs:
      y: 0
    links:
      x: [child.result]
"#,
    )
    .await;

    assert!(result.is_success(), "{}", result.exit);
    assert_eq!(result.task_output("child", "result"), Some(&json!(42)));
    assert_eq!(result.task_output("child", "execution_count"), Some(&json!(0)));
    assert_eq!(result.task_output("use", "result"), Some(&json!(42)));
}

#[tokio::test]
async fn test_stored_sub_graph_is_loaded_by_executor_name() {
    let store = Arc::new(MemoryGraphStore::new());
    store
        .insert_graph(
            "doubler",
            parse(
                r#"
name: doubler
tasks:
  double:
    executor: multiply
    inputs:
      x: "{{ n }}"
      y: 2
outputs:
  - name: result
    from: double.result
"#,
            ),
        )
        .unwrap();

    let graph = parse(
        r#"
name: parent
tasks:
  child:
    kind: sub_graph
    executor: doubler
    inputs:
      n: 5
"#,
    );
    let engine = GraphEngine::new(graph, backend()).unwrap().with_store(store);
    let result = run(engine).await;

    assert!(result.is_success(), "{}", result.exit);
    assert_eq!(result.task_output("child", "result"), Some(&json!(10)));
}

#[tokio::test]
async fn test_failed_sub_graph_fails_its_task() {
    let result = run_yaml(
        r#"
name: parent
tasks:
  child:
    kind: sub_graph
    graph:
      name: broken
      tasks:
        explode:
          executor: fail
"#,
    )
    .await;

    assert_eq!(result.task_state("child"), Some(TaskState::Failed));
    assert_eq!(result.get_task("child").unwrap().exit_code, Some(302));
}

#[tokio::test]
async fn test_monitor_waits_for_condition() {
    let temp_dir = tempfile::tempdir().unwrap();
    let marker = temp_dir.path().join("ready");
    let graph = stepgraph::parser::GraphDefinition::new("monitor").with_task(
        "wait_file",
        stepgraph::parser::TaskDefinition::new("monitor")
            .with_executor("file_exists")
            .with_input("path", json!(marker.to_str().unwrap()))
            .with_input("interval", json!(0.02))
            .with_input("timeout", json!(5)),
    );

    let writer = {
        let marker = marker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::fs::write(marker, b"done").await.unwrap();
        })
    };

    let result = run_graph(graph).await;
    writer.await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.task_output("wait_file", "result"), Some(&json!(true)));
}

#[tokio::test]
async fn test_monitor_timeout_fails_task() {
    let graph = stepgraph::parser::GraphDefinition::new("monitor").with_task(
        "wait_file",
        stepgraph::parser::TaskDefinition::new("monitor")
            .with_executor("file_exists")
            .with_input("path", json!("/definitely/not/here"))
            .with_input("interval", json!(0.01))
            .with_input("timeout", json!(0.1)),
    );

    let result = run_graph(graph).await;
    assert_eq!(result.task_state("wait_file"), Some(TaskState::Failed));
    assert!(result
        .get_task("wait_file")
        .and_then(|t| t.error.as_deref())
        .unwrap_or_default()
        .contains("timed out"));
}

#[tokio::test]
async fn test_checkpoint_restore_resumes_waiting_instance() {
    let registry = backend();
    let store = Arc::new(MemoryGraphStore::new());
    let graph = parse(
        r#"
name: resumable
tasks:
  job:
    kind: remote_job
    executor: const
    paused: true
    inputs:
      value: 7
  after:
    executor: add
    inputs:
      y: 1
    links:
      x: [job.result]
"#,
    );

    let engine = GraphEngine::new(graph, registry.clone())
        .unwrap()
        .with_store(store.clone());
    let instance_id = engine.instance_id().to_string();
    let first = tokio::spawn(engine.run());
    tokio::time::sleep(Duration::from_millis(200)).await;
    first.abort();

    let checkpoint = store.load_checkpoint(&instance_id).await.unwrap();
    assert_eq!(checkpoint.tasks.state("job").unwrap(), TaskState::Created);

    let restored = GraphEngine::restore(checkpoint, registry)
        .unwrap()
        .with_store(store.clone());
    let handle = restored.handle();
    handle
        .send(ControlMessage::new(TaskAction::Play, &["job"]))
        .unwrap();
    let result = run(restored).await;

    assert!(result.is_success(), "{}", result.exit);
    assert_eq!(result.instance_id, instance_id);
    assert_eq!(result.task_output("after", "result"), Some(&json!(8)));

    let fields = store.task_fields(&instance_id, "after").unwrap();
    assert_eq!(fields["state"], json!("FINISHED"));
}

#[tokio::test]
async fn test_results_do_not_depend_on_definition_order() {
    let forward = r#"
name: diamond
tasks:
  a:
    executor: const
    inputs:
      value: 2
  b:
    executor: multiply
    inputs:
      y: 3
    links:
      x: [a.result]
  c:
    executor: add
    inputs:
      y: 1
    links:
      x: [a.result]
  d:
    executor: add
    links:
      x: [b.result]
      y: [c.result]
outputs:
  - name: total
    from: d.result
"#;
    let reversed = r#"
name: diamond
tasks:
  d:
    executor: add
    links:
      x: [b.result]
      y: [c.result]
  c:
    executor: add
    inputs:
      y: 1
    links:
      x: [a.result]
  b:
    executor: multiply
    inputs:
      y: 3
    links:
      x: [a.result]
  a:
    executor: const
    inputs:
      value: 2
outputs:
  - name: total
    from: d.result
"#;

    let first = run_yaml(forward).await;
    let second = run_yaml(reversed).await;

    assert!(first.is_success() && second.is_success());
    assert_eq!(first.output("total"), Some(&json!(9)));
    assert_eq!(first.outputs, second.outputs);
    for task in ["a", "b", "c", "d"] {
        assert_eq!(first.task_output(task, "result"), second.task_output(task, "result"));
    }
}

#[tokio::test]
async fn test_reset_of_planned_task_does_not_dispatch_twice() {
    let engine = engine(parse(
        r#"
name: reset_planned
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
"#,
    ));
    let handle = engine.handle();
    handle
        .send(ControlMessage::new(TaskAction::Reset, &["a"]))
        .unwrap();
    handle
        .send(ControlMessage::new(TaskAction::Reset, &["a"]))
        .unwrap();

    let result = run(engine).await;

    assert!(result.is_success(), "{}", result.exit);
    assert_eq!(result.task_output("b", "result"), Some(&json!(7)));
    let runs = result
        .reports
        .iter()
        .filter(|line| line.starts_with("Run task: a,"))
        .count();
    assert_eq!(runs, 1);
}

#[tokio::test]
async fn test_reset_of_finished_task_runs_it_again() {
    let engine = engine(parse(
        r#"
name: reset_finished
tasks:
  a:
    executor: const
    inputs:
      value: 3
  gate:
    kind: remote_job
    executor: const
    paused: true
    inputs:
      value: 0
"#,
    ));
    let handle = engine.handle();
    let running = tokio::spawn(run(engine));

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle
        .send(ControlMessage::new(TaskAction::Reset, &["a"]))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle
        .send(ControlMessage::new(TaskAction::Play, &["gate"]))
        .unwrap();

    let result = running.await.unwrap();
    assert!(result.is_success(), "{}", result.exit);
    assert_eq!(result.task_state("a"), Some(TaskState::Finished));
    let runs = result
        .reports
        .iter()
        .filter(|line| line.starts_with("Run task: a,"))
        .count();
    assert_eq!(runs, 2);
}

fn builder_registry() -> Arc<stepgraph::ExecutorRegistry> {
    let mut registry = stepgraph::ExecutorRegistry::new();
    registry.register_fn("doubling_builder", |inputs: &Map<String, Value>| {
        let mut graph = doubling_while_graph(10);
        graph
            .context
            .insert("n".to_string(), inputs.get("n").cloned().unwrap_or(json!(0)));
        if let (Some(limit), Some(compare)) = (inputs.get("limit"), graph.tasks.get_mut("compare1")) {
            compare.inputs.insert("y".to_string(), limit.clone());
        }
        serde_json::to_value(&graph)
            .map(TaskOutput::Single)
            .map_err(|e| TaskFailure::new(e.to_string()))
    });
    registry.register_fn("broken_builder", |_inputs: &Map<String, Value>| {
        Ok(TaskOutput::Single(json!({"name": "nothing"})))
    });
    Arc::new(registry)
}

#[tokio::test]
async fn test_graph_builder_runs_built_graph() {
    let graph = parse(
        r#"
name: builder
tasks:
  limit:
    executor: add
    inputs:
      x: 25
      y: 25
  my_while:
    kind: graph_builder
    executor: doubling_builder
    inputs:
      n: 1
    links:
      limit: [limit.result]
  add2:
    executor: add
    inputs:
      y: 2
    links:
      x: [my_while.result]
"#,
    );

    let result = run(GraphEngine::new(graph, builder_registry()).unwrap()).await;

    assert!(result.is_success(), "{}", result.exit);
    assert_eq!(result.task_output("my_while", "result"), Some(&json!(61)));
    assert_eq!(result.task_output("my_while", "execution_count"), Some(&json!(4)));
    assert_eq!(result.task_output("add2", "result"), Some(&json!(63)));
    assert!(has_report(&result, "Task my_while launched sub-graph instance"));
}

#[tokio::test]
async fn test_graph_builder_counts_against_job_ceiling() {
    let graph = parse(
        r#"
name: builders
max_number_jobs: 1
tasks:
  first:
    kind: graph_builder
    executor: doubling_builder
    inputs:
      n: 1
  second:
    kind: graph_builder
    executor: doubling_builder
    inputs:
      n: 2
"#,
    );

    let result = run(GraphEngine::new(graph, builder_registry()).unwrap()).await;

    assert!(result.is_success(), "{}", result.exit);
    assert!(has_report(&result, "maximum number of subprocesses (1)"));
    assert_eq!(result.task_output("first", "result"), Some(&json!(61)));
    assert_eq!(result.task_output("second", "result"), Some(&json!(61)));
}

#[tokio::test]
async fn test_graph_builder_with_invalid_graph_fails() {
    let graph = parse(
        r#"
name: builder
tasks:
  built:
    kind: graph_builder
    executor: broken_builder
"#,
    );

    let result = run(GraphEngine::new(graph, builder_registry()).unwrap()).await;

    assert_eq!(result.task_state("built"), Some(TaskState::Failed));
    assert_eq!(result.exit_code(), 302);
}

#[tokio::test]
async fn test_finished_processes_are_released() {
    let registry = backend();
    let graph = parse(
        r#"
name: repeated_jobs
mode: for
sequence: [1, 2, 3]
tasks:
  job:
    kind: remote_job
    executor: add
    inputs:
      x: "{{ i }}"
      y: 1
"#,
    );

    let result = run(GraphEngine::new(graph, registry.clone()).unwrap()).await;

    assert!(result.is_success(), "{}", result.exit);
    assert_eq!(result.execution_count, 3);
    assert_eq!(result.task_output("job", "result"), Some(&json!(4)));
    assert_eq!(registry.tracked_processes(), 0);
}

#[tokio::test]
async fn test_killing_sub_graph_cancels_its_jobs() {
    let registry = backend();
    let graph = parse(
        r#"
name: parent
tasks:
  child:
    kind: sub_graph
    graph:
      name: inner
      tasks:
        slow:
          kind: remote_job
          executor: sleep
          inputs:
            seconds: 30
"#,
    );
    let engine = GraphEngine::new(graph, registry.clone()).unwrap();
    let handle = engine.handle();
    let running = tokio::spawn(run(engine));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(registry.running_processes(), 1);
    handle
        .send(ControlMessage::new(TaskAction::Kill, &["child"]))
        .unwrap();

    let result = running.await.unwrap();
    assert_eq!(result.task_state("child"), Some(TaskState::Killed));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.running_processes(), 0);
}
