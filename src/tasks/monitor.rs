// ABOUTME: Polling loop behind monitor tasks
// ABOUTME: Re-invokes a pure executor until it reports a truthy value or the deadline passes

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::engine::{truthy, ExecutionBackend, TaskFailure, TaskOutput};

/// Invoke `executor` every `interval` until its output is truthy.
///
/// An executor failure ends the monitor with that failure; running past
/// `timeout` ends it with a timeout failure.
pub async fn poll_until(
    backend: Arc<dyn ExecutionBackend>,
    executor: String,
    inputs: Map<String, Value>,
    interval: Duration,
    timeout: Duration,
) -> Result<TaskOutput, TaskFailure> {
    let deadline = Instant::now() + timeout;
    let mut polls: u64 = 0;

    loop {
        let output = backend.invoke(&executor, &inputs).await?;
        polls += 1;
        if truthy(&output.clone().into_value()) {
            debug!("Monitor {} satisfied after {} polls", executor, polls);
            return Ok(output);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(TaskFailure::new(format!(
                "Monitor timed out after {:?} waiting on {}",
                timeout, executor
            )));
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::ExecutorRegistry;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_returns_once_truthy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = ExecutorRegistry::empty();
        registry.register_fn("third_time", move |_inputs: &Map<String, Value>| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TaskOutput::Single(Value::Bool(n >= 3)))
        });

        let output = poll_until(
            Arc::new(registry),
            "third_time".to_string(),
            Map::new(),
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(output, TaskOutput::Single(json!(true)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_times_out() {
        let mut registry = ExecutorRegistry::empty();
        registry.register_fn("never", |_inputs: &Map<String, Value>| {
            Ok(TaskOutput::Single(Value::Bool(false)))
        });

        let failure = poll_until(
            Arc::new(registry),
            "never".to_string(),
            Map::new(),
            Duration::from_millis(5),
            Duration::from_millis(30),
        )
        .await
        .unwrap_err();

        assert!(failure.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_executor_failure_ends_monitor() {
        let failure = poll_until(
            Arc::new(ExecutorRegistry::empty()),
            "missing".to_string(),
            Map::new(),
            Duration::from_millis(5),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert!(failure.message.contains("Unknown executor"));
    }
}
