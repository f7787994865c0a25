// ABOUTME: Shell job executor running commands and scripts as child processes
// ABOUTME: Propagates exit codes as task failures and kills the child when the job is cancelled

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use crate::engine::{TaskFailure, TaskOutput};

/// Inputs of a `shell` job.
///
/// Either a `command` with `args`, or a `script` run through `shell -c`:
///
/// ```yaml
/// kind: remote_job
/// executor: shell
/// inputs:
///   script: |
///     echo "processing $SAMPLE"
///     sleep 1
///   env:
///     SAMPLE: water
///   timeout_seconds: 60
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub script: Option<String>,

    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Exit codes treated as success (default: only 0)
    #[serde(default)]
    pub expected_exit_codes: Vec<i32>,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            script: None,
            shell: default_shell(),
            env: HashMap::new(),
            working_dir: None,
            timeout_seconds: None,
            expected_exit_codes: Vec::new(),
        }
    }
}

impl ShellConfig {
    pub fn from_inputs(inputs: Map<String, Value>) -> Result<Self, TaskFailure> {
        let config: ShellConfig = serde_json::from_value(Value::Object(inputs))
            .map_err(|e| TaskFailure::new(format!("Invalid shell configuration: {}", e)))?;

        let problem = match (&config.command, &config.script) {
            (None, None) => Some("Either 'command' or 'script' must be provided"),
            (Some(_), Some(_)) => Some("Cannot specify both 'command' and 'script' - use only one"),
            (Some(command), None) if command.is_empty() => Some("Command cannot be empty"),
            (None, Some(script)) if script.is_empty() => Some("Script cannot be empty"),
            _ if config.timeout_seconds == Some(0) => Some("Timeout must be greater than 0"),
            _ => None,
        };
        match problem {
            Some(problem) => Err(TaskFailure::new(problem)),
            None => Ok(config),
        }
    }

    fn build(&self) -> Command {
        let mut command = match (&self.script, &self.command) {
            (Some(script), _) => {
                let mut command = Command::new(&self.shell);
                command.arg("-c").arg(script);
                command
            }
            (None, Some(program)) => {
                let mut command = Command::new(program);
                command.args(&self.args);
                command
            }
            (None, None) => Command::new(&self.shell),
        };

        for (key, value) in &self.env {
            command.env(key, value);
        }
        if let Some(working_dir) = &self.working_dir {
            command.current_dir(working_dir);
        }
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn is_success(&self, exit_code: i32) -> bool {
        if self.expected_exit_codes.is_empty() {
            exit_code == 0
        } else {
            self.expected_exit_codes.contains(&exit_code)
        }
    }
}

/// Run a shell job. Outputs `stdout`, `stderr` and `exit_code`.
pub async fn run_shell(inputs: Map<String, Value>) -> Result<TaskOutput, TaskFailure> {
    let config = ShellConfig::from_inputs(inputs)?;
    let mut command = config.build();

    match (&config.command, &config.script) {
        (Some(program), _) => info!("Executing command: {} {:?}", program, config.args),
        _ => info!("Executing script with {}", config.shell),
    }

    let running = command.output();
    let output = match config.timeout_seconds {
        Some(seconds) => match timeout(Duration::from_secs(seconds), running).await {
            Ok(output) => output,
            Err(_) => {
                return Err(TaskFailure::new(format!(
                    "Command timed out after {} seconds",
                    seconds
                )))
            }
        },
        None => running.await,
    }
    .map_err(|e| TaskFailure::new(format!("Failed to execute: {}", e)))?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    debug!("Command completed with exit code: {}", exit_code);

    let mut results = Map::new();
    results.insert("stdout".to_string(), Value::String(stdout));
    results.insert("stderr".to_string(), Value::String(stderr));
    results.insert("exit_code".to_string(), Value::from(exit_code));

    if config.is_success(exit_code) {
        Ok(TaskOutput::Mapping(results))
    } else {
        Err(
            TaskFailure::new(format!("Command exited with code {}", exit_code))
                .with_exit_code(exit_code)
                .with_outputs(results),
        )
    }
}
