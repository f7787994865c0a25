// ABOUTME: Built-in executors for arithmetic, comparison, collection and test helpers
// ABOUTME: Registered on every ExecutorRegistry created with ExecutorRegistry::new

use futures::FutureExt;
use serde_json::{Map, Number, Value};
use std::time::Duration;

use super::{BackendError, ExecutorRegistry};
use crate::engine::{TaskFailure, TaskOutput};

type Outcome = Result<TaskOutput, TaskFailure>;

pub fn register_builtins(registry: &mut ExecutorRegistry) {
    registry.register_fn("const", constant);
    registry.register_fn("identity", identity);
    registry.register_fn("add", |inputs| arithmetic("add", inputs, i64::checked_add, |a, b| a + b));
    registry.register_fn("subtract", |inputs| {
        arithmetic("subtract", inputs, i64::checked_sub, |a, b| a - b)
    });
    registry.register_fn("multiply", |inputs| {
        arithmetic("multiply", inputs, i64::checked_mul, |a, b| a * b)
    });
    registry.register_fn("less_than", |inputs| compare("less_than", inputs, |a, b| a < b));
    registry.register_fn("compare", |inputs| compare("compare", inputs, |a, b| a < b));
    registry.register_fn("greater_than", |inputs| compare("greater_than", inputs, |a, b| a > b));
    registry.register_fn("equal", equal);
    registry.register_fn("sum", sum);
    registry.register_fn("concat", concat);
    registry.register_fn("fail", fail);
    registry.register_fn("at_least", at_least);
    registry.register_fn("file_exists", file_exists);
    registry.register_async("sleep", |inputs| sleep(inputs).boxed());
}

fn invalid(executor: &str, message: impl Into<String>) -> TaskFailure {
    BackendError::InvalidInput {
        executor: executor.to_string(),
        message: message.into(),
    }
    .into()
}

fn input<'a>(executor: &str, inputs: &'a Map<String, Value>, name: &str) -> Result<&'a Value, TaskFailure> {
    inputs
        .get(name)
        .ok_or_else(|| invalid(executor, format!("missing input '{}'", name)))
}

fn number(executor: &str, inputs: &Map<String, Value>, name: &str) -> Result<Number, TaskFailure> {
    match input(executor, inputs, name)? {
        Value::Number(number) => Ok(number.clone()),
        other => Err(invalid(executor, format!("input '{}' is not a number: {}", name, other))),
    }
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

/// `value`
fn constant(inputs: &Map<String, Value>) -> Outcome {
    Ok(TaskOutput::Single(input("const", inputs, "value")?.clone()))
}

/// `x`, or `value`
fn identity(inputs: &Map<String, Value>) -> Outcome {
    let value = inputs
        .get("x")
        .or_else(|| inputs.get("value"))
        .cloned()
        .unwrap_or(Value::Null);
    Ok(TaskOutput::Single(value))
}

/// Integer arithmetic when both sides are integers and the result fits, floats otherwise.
fn arithmetic(
    executor: &str,
    inputs: &Map<String, Value>,
    integer: fn(i64, i64) -> Option<i64>,
    real: fn(f64, f64) -> f64,
) -> Outcome {
    let x = number(executor, inputs, "x")?;
    let y = number(executor, inputs, "y")?;

    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        if let Some(result) = integer(a, b) {
            return Ok(TaskOutput::Single(Value::from(result)));
        }
    }
    let a = x.as_f64().unwrap_or(0.0);
    let b = y.as_f64().unwrap_or(0.0);
    Ok(TaskOutput::Single(float(real(a, b))))
}

fn compare(executor: &str, inputs: &Map<String, Value>, op: fn(f64, f64) -> bool) -> Outcome {
    let x = number(executor, inputs, "x")?.as_f64().unwrap_or(0.0);
    let y = number(executor, inputs, "y")?.as_f64().unwrap_or(0.0);
    Ok(TaskOutput::Single(Value::Bool(op(x, y))))
}

fn equal(inputs: &Map<String, Value>) -> Outcome {
    let x = input("equal", inputs, "x")?;
    let y = input("equal", inputs, "y")?;
    let same = match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => x == y,
    };
    Ok(TaskOutput::Single(Value::Bool(same)))
}

/// Items of a sequence, or the values of a multi-link mapping.
fn items<'a>(executor: &str, value: &'a Value) -> Result<Vec<&'a Value>, TaskFailure> {
    match value {
        Value::Array(items) => Ok(items.iter().collect()),
        Value::Object(map) => Ok(map.values().collect()),
        other => Err(invalid(executor, format!("expected a list or mapping, got {}", other))),
    }
}

fn sum(inputs: &Map<String, Value>) -> Outcome {
    let values = items("sum", input("sum", inputs, "values")?)?;
    let mut integer: Option<i64> = Some(0);
    let mut real = 0.0;
    for value in values {
        let Value::Number(number) = value else {
            return Err(invalid("sum", format!("not a number: {}", value)));
        };
        integer = match (integer, number.as_i64()) {
            (Some(total), Some(n)) => total.checked_add(n),
            _ => None,
        };
        real += number.as_f64().unwrap_or(0.0);
    }
    Ok(TaskOutput::Single(match integer {
        Some(total) => Value::from(total),
        None => float(real),
    }))
}

/// Join strings with `separator` (default empty); non-strings use their JSON text.
fn concat(inputs: &Map<String, Value>) -> Outcome {
    let values = items("concat", input("concat", inputs, "values")?)?;
    let separator = inputs
        .get("separator")
        .and_then(Value::as_str)
        .unwrap_or("");
    let parts: Vec<String> = values
        .iter()
        .map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect();
    Ok(TaskOutput::Single(Value::String(parts.join(separator))))
}

/// Always fails with `message` and `exit_code`.
fn fail(inputs: &Map<String, Value>) -> Outcome {
    let message = inputs
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("task failed");
    let mut failure = TaskFailure::new(message);
    if let Some(code) = inputs.get("exit_code").and_then(Value::as_i64) {
        failure = failure.with_exit_code(code as i32);
    }
    Err(failure)
}

/// Returns `x` when `x >= min`, otherwise fails with `exit_code` (default 1).
fn at_least(inputs: &Map<String, Value>) -> Outcome {
    let x = number("at_least", inputs, "x")?;
    let min = number("at_least", inputs, "min")?;
    if x.as_f64().unwrap_or(0.0) >= min.as_f64().unwrap_or(0.0) {
        return Ok(TaskOutput::Single(Value::Number(x)));
    }
    let code = inputs.get("exit_code").and_then(Value::as_i64).unwrap_or(1) as i32;
    Err(TaskFailure::new(format!("{} is below {}", x, min)).with_exit_code(code))
}

fn file_exists(inputs: &Map<String, Value>) -> Outcome {
    let path = input("file_exists", inputs, "path")?
        .as_str()
        .ok_or_else(|| invalid("file_exists", "input 'path' is not a string"))?;
    Ok(TaskOutput::Single(Value::Bool(std::path::Path::new(path).exists())))
}

/// Wait `seconds`, then return `value` (or `null`).
async fn sleep(inputs: Map<String, Value>) -> Outcome {
    let seconds = inputs
        .get("seconds")
        .and_then(Value::as_f64)
        .filter(|s| *s >= 0.0)
        .unwrap_or(0.0);
    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    Ok(TaskOutput::Single(
        inputs.get("value").cloned().unwrap_or(Value::Null),
    ))
}
