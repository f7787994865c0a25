// ABOUTME: Command implementations for the stepgraph CLI
// ABOUTME: Handles execution of the run, validate and resume commands

use anyhow::Result;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::config::Config;
use crate::engine::{ExecutionBackend, GraphEngine, GraphRunResult};
use crate::parser::{GraphParser, GraphValidator, ValidationReport};
use crate::store::{FileGraphStore, GraphStore};
use crate::tasks::ExecutorRegistry;

/// Execute a graph file. Returns `None` for a dry run.
pub async fn run_graph(
    graph_path: PathBuf,
    variables: Map<String, Value>,
    dry_run: bool,
    output: Option<PathBuf>,
    max_jobs: Option<usize>,
    config: &Config,
) -> Result<Option<GraphRunResult>> {
    info!("Starting graph execution: {}", graph_path.display());

    let graph = GraphParser::new()
        .parse_file(&graph_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse graph: {}", e))?;
    info!("Loaded graph: {}", graph.name);

    let registry = Arc::new(ExecutorRegistry::new());
    let report = GraphValidator::new()
        .with_known_executors(registry.executors())
        .validate(&graph)
        .map_err(|e| anyhow::anyhow!("Graph validation failed: {}", e))?;
    ensure_valid(&report)?;

    let mut context = config.context.clone();
    context.extend(variables);

    let store: Arc<dyn GraphStore> = Arc::new(FileGraphStore::new(config.state_dir()));
    let mut engine = GraphEngine::new(graph, registry)
        .map_err(|e| anyhow::anyhow!("Failed to create graph instance: {}", e))?
        .with_store(store)
        .with_options(config.engine_options())
        .with_context_values(&context)
        .map_err(|e| anyhow::anyhow!("Invalid context values: {}", e))?;
    if let Some(limit) = max_jobs.or(config.max_number_jobs) {
        engine = engine.with_max_number_jobs(limit);
    }

    if dry_run {
        info!("Dry run - graph validation successful");
        println!(
            "✓ Graph '{}' is valid ({} tasks)",
            engine.definition().name,
            engine.tasks().len()
        );
        return Ok(None);
    }

    println!("Instance: {}", engine.instance_id());
    let result = engine.run().await;
    finish(result, output).map(Some)
}

/// Validate a graph file
pub async fn validate_graph(graph_path: PathBuf, strict: bool, _config: &Config) -> Result<()> {
    info!("Validating graph: {}", graph_path.display());

    let graph = GraphParser::new()
        .parse_file(&graph_path)
        .await
        .map_err(|e| anyhow::anyhow!("Graph validation failed: {}", e))?;

    let report = GraphValidator::new()
        .with_strict_mode(strict)
        .with_known_executors(ExecutorRegistry::new().executors())
        .validate(&graph)
        .map_err(|e| anyhow::anyhow!("Graph validation failed: {}", e))?;
    ensure_valid(&report)?;

    println!("✓ Graph '{}' is valid", graph.name);
    println!("  Tasks: {}", graph.tasks.len());
    println!("  Mode: {:?}", graph.mode);
    for warning in &report.warnings {
        println!("  Warning: {}", warning);
    }

    info!("Graph validation completed successfully");
    Ok(())
}

/// Continue a graph instance from the checkpoint in the state directory
pub async fn resume_graph(
    instance_id: String,
    output: Option<PathBuf>,
    config: &Config,
) -> Result<GraphRunResult> {
    info!("Resuming graph instance: {}", instance_id);

    let store = Arc::new(FileGraphStore::new(config.state_dir()));
    let checkpoint = store
        .load_checkpoint(&instance_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load checkpoint '{}': {}", instance_id, e))?;
    if checkpoint.is_terminated() {
        info!("Instance {} already terminated; reporting its final state", instance_id);
    }

    let engine = GraphEngine::restore(checkpoint, Arc::new(ExecutorRegistry::new()))
        .map_err(|e| anyhow::anyhow!("Failed to restore instance: {}", e))?
        .with_store(store)
        .with_options(config.engine_options());

    let result = engine.run().await;
    finish(result, output)
}

fn ensure_valid(report: &ValidationReport) -> Result<()> {
    for warning in &report.warnings {
        warn!("{}", warning);
    }
    if report.has_errors() {
        let errors: Vec<String> = report.errors.iter().map(|e| e.to_string()).collect();
        return Err(anyhow::anyhow!(
            "Graph validation failed:\n  {}",
            errors.join("\n  ")
        ));
    }
    Ok(())
}

/// Print or write the result, then turn a non-success exit condition into an error.
fn finish(result: GraphRunResult, output: Option<PathBuf>) -> Result<GraphRunResult> {
    match &output {
        Some(path) => write_result(&result, path)?,
        None => print_result(&result),
    }

    info!("Graph execution completed");
    if result.is_success() {
        Ok(result)
    } else {
        Err(anyhow::anyhow!(
            "Graph '{}' finished with exit code {}: {}",
            result.graph_name,
            result.exit_code(),
            result.exit
        ))
    }
}

fn write_result(result: &GraphRunResult, path: &Path) -> Result<()> {
    let json_content = serde_json::to_string_pretty(result)
        .map_err(|e| anyhow::anyhow!("Failed to serialize results to JSON: {}", e))?;
    std::fs::write(path, json_content)
        .map_err(|e| anyhow::anyhow!("Failed to write output file '{}': {}", path.display(), e))?;
    info!("Results written to: {}", path.display());
    Ok(())
}

fn print_result(result: &GraphRunResult) {
    println!(
        "Graph '{}' finished: {} ({} iterations)",
        result.graph_name, result.exit, result.execution_count
    );
    for task in &result.tasks {
        println!("  Task '{}': {}", task.name, task.state);
        if let Some(error) = &task.error {
            println!("    Error: {}", error);
        }
    }
    if result.outputs.as_object().is_some_and(|o| !o.is_empty()) {
        match serde_json::to_string_pretty(&result.outputs) {
            Ok(outputs) => println!("Outputs:\n{}", outputs),
            Err(e) => warn!("Could not render outputs: {}", e),
        }
    }
}
