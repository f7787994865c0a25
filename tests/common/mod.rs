// ABOUTME: Common utilities and helpers for integration tests
// ABOUTME: Provides graph builders, a default backend, and temp directories for graph files

#![allow(dead_code)]

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs;

use stepgraph::engine::GraphEngine;
use stepgraph::parser::{GraphDefinition, GraphMode, TaskDefinition};
use stepgraph::{ExecutorRegistry, GraphRunResult};

/// Upper bound on any single test run so a scheduling bug fails instead of hanging.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(20);

pub fn backend() -> Arc<ExecutorRegistry> {
    Arc::new(ExecutorRegistry::new())
}

pub fn parse(yaml: &str) -> GraphDefinition {
    GraphDefinition::from_yaml(yaml).expect("graph YAML should parse")
}

pub fn engine(graph: GraphDefinition) -> GraphEngine {
    GraphEngine::new(graph, backend()).expect("graph should build an engine")
}

pub async fn run(engine: GraphEngine) -> GraphRunResult {
    tokio::time::timeout(RUN_TIMEOUT, engine.run())
        .await
        .expect("graph run timed out")
}

pub async fn run_graph(graph: GraphDefinition) -> GraphRunResult {
    run(engine(graph)).await
}

pub async fn run_yaml(yaml: &str) -> GraphRunResult {
    run_graph(parse(yaml)).await
}

/// A pure task running `executor`.
pub fn pure(executor: &str) -> TaskDefinition {
    TaskDefinition::new("pure").with_executor(executor)
}

/// `n = n * 2 + 3` while `n < 50`, with `compare1` as the condition task.
pub fn doubling_while_graph(max_iteration: u32) -> GraphDefinition {
    let mut graph = GraphDefinition::new("doubling")
        .with_context("n", json!(1))
        .with_task(
            "compare1",
            pure("less_than")
                .with_input("x", json!("{{ n }}"))
                .with_input("y", json!(50)),
        )
        .with_task(
            "multiply1",
            pure("multiply")
                .with_input("x", json!("{{ n }}"))
                .with_input("y", json!(2)),
        )
        .with_task(
            "add1",
            pure("add")
                .with_link("x", "multiply1.result")
                .with_input("y", json!(3))
                .with_context_mapping("result", "n"),
        )
        .with_output("result", "context.n");
    graph.mode = GraphMode::While;
    graph.conditions = vec!["compare1.result".to_string()];
    graph.max_iteration = max_iteration;
    graph
}

pub fn context_value(result: &GraphRunResult, path: &str) -> Value {
    path.split('.')
        .try_fold(&result.context, |current, segment| current.get(segment))
        .cloned()
        .unwrap_or(Value::Null)
}

pub fn has_report(result: &GraphRunResult, needle: &str) -> bool {
    result.reports.iter().any(|line| line.contains(needle))
}

pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path().join("state")
    }

    pub fn output_file(&self, name: &str) -> PathBuf {
        self.path().join(format!("{}_output.json", name))
    }

    pub async fn write_graph(&self, name: &str, yaml: &str) -> PathBuf {
        let path = self.path().join(format!("{}.yaml", name));
        fs::write(&path, yaml)
            .await
            .expect("Failed to write graph file");
        path
    }
}

pub async fn read_json_output(file_path: &Path) -> Result<Value, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(file_path).await?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_graph_shape() {
        let graph = doubling_while_graph(10);
        assert_eq!(graph.mode, GraphMode::While);
        assert_eq!(graph.condition_tasks(), vec!["compare1".to_string()]);
        assert!(graph.validate_structure().is_ok());
    }

    #[test]
    fn test_environment_setup() {
        let env = TestEnvironment::new();
        assert!(env.path().exists());
        assert!(env.state_dir().starts_with(env.path()));
    }
}
