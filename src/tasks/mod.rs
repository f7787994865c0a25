// ABOUTME: Reference execution backend built from named executors
// ABOUTME: Runs pure functions inline, async functions as futures, and jobs as tracked processes

pub mod builtin;
pub mod command;
pub mod monitor;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::engine::{ExecutionBackend, JobOutcome, TaskFailure, TaskFuture, TaskOutput};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Unknown executor: {name}")]
    UnknownExecutor { name: String },

    #[error("Invalid input for {executor}: {message}")]
    InvalidInput { executor: String, message: String },

    #[error("Unknown process: {process_id}")]
    UnknownProcess { process_id: String },

    #[error("Process {process_id} is not paused")]
    NotPaused { process_id: String },

    #[error("Process table unavailable: {0}")]
    Internal(String),
}

impl From<BackendError> for TaskFailure {
    fn from(error: BackendError) -> Self {
        TaskFailure::new(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Executor run inline to completion.
pub type PureFn = Arc<dyn Fn(&Map<String, Value>) -> std::result::Result<TaskOutput, TaskFailure> + Send + Sync>;

/// Executor producing a future; used for awaitable tasks and as job bodies.
pub type AsyncFn = Arc<dyn Fn(Map<String, Value>) -> TaskFuture + Send + Sync>;

struct ProcessEntry {
    executor: String,
    inputs: Map<String, Value>,
    outcome: Arc<watch::Sender<Option<JobOutcome>>>,
    handle: Option<AbortHandle>,
}

/// Named executors plus a process table for submitted jobs.
pub struct ExecutorRegistry {
    pure: HashMap<String, PureFn>,
    async_fns: HashMap<String, AsyncFn>,
    jobs: HashMap<String, AsyncFn>,
    processes: Mutex<HashMap<String, ProcessEntry>>,
    next_process: AtomicU64,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        let mut registry = Self::empty();
        builtin::register_builtins(&mut registry);
        registry.register_job("shell", |inputs| command::run_shell(inputs).boxed());
        registry
    }

    pub fn empty() -> Self {
        Self {
            pure: HashMap::new(),
            async_fns: HashMap::new(),
            jobs: HashMap::new(),
            processes: Mutex::new(HashMap::new()),
            next_process: AtomicU64::new(1),
        }
    }

    pub fn register_fn<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&Map<String, Value>) -> std::result::Result<TaskOutput, TaskFailure> + Send + Sync + 'static,
    {
        self.pure.insert(name.to_string(), Arc::new(function));
    }

    pub fn register_async<F>(&mut self, name: &str, function: F)
    where
        F: Fn(Map<String, Value>) -> TaskFuture + Send + Sync + 'static,
    {
        self.async_fns.insert(name.to_string(), Arc::new(function));
    }

    pub fn register_job<F>(&mut self, name: &str, function: F)
    where
        F: Fn(Map<String, Value>) -> TaskFuture + Send + Sync + 'static,
    {
        self.jobs.insert(name.to_string(), Arc::new(function));
    }

    pub fn has_executor(&self, name: &str) -> bool {
        self.pure.contains_key(name) || self.async_fns.contains_key(name) || self.jobs.contains_key(name)
    }

    /// Number of processes that have not produced an outcome yet.
    pub fn running_processes(&self) -> usize {
        self.processes
            .lock()
            .map(|table| {
                table
                    .values()
                    .filter(|entry| entry.outcome.borrow().is_none())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Entries in the process table, finished or not.
    pub fn tracked_processes(&self) -> usize {
        self.processes.lock().map(|table| table.len()).unwrap_or(0)
    }

    /// The body of a job: job executors first, then async, then pure functions.
    fn job_future(&self, executor: &str, inputs: Map<String, Value>) -> Result<TaskFuture> {
        if let Some(job) = self.jobs.get(executor) {
            return Ok(job(inputs));
        }
        if let Some(function) = self.async_fns.get(executor) {
            return Ok(function(inputs));
        }
        if let Some(function) = self.pure.get(executor) {
            let function = function.clone();
            return Ok(async move { function(&inputs) }.boxed());
        }
        Err(BackendError::UnknownExecutor {
            name: executor.to_string(),
        })
    }

    fn create_process(&self, executor: &str, inputs: &Map<String, Value>) -> Result<String> {
        if !self.has_executor(executor) {
            return Err(BackendError::UnknownExecutor {
                name: executor.to_string(),
            });
        }
        let process_id = self.next_process.fetch_add(1, Ordering::SeqCst).to_string();
        let (outcome, _) = watch::channel(None);
        let entry = ProcessEntry {
            executor: executor.to_string(),
            inputs: inputs.clone(),
            outcome: Arc::new(outcome),
            handle: None,
        };
        self.processes
            .lock()
            .map_err(|e| BackendError::Internal(e.to_string()))?
            .insert(process_id.clone(), entry);
        Ok(process_id)
    }

    fn start_process(&self, process_id: &str) -> Result<()> {
        let mut table = self
            .processes
            .lock()
            .map_err(|e| BackendError::Internal(e.to_string()))?;
        let entry = table
            .get_mut(process_id)
            .ok_or_else(|| BackendError::UnknownProcess {
                process_id: process_id.to_string(),
            })?;
        if entry.handle.is_some() {
            return Err(BackendError::NotPaused {
                process_id: process_id.to_string(),
            });
        }

        let job = self.job_future(&entry.executor, entry.inputs.clone())?;
        let outcome = entry.outcome.clone();
        let handle = tokio::spawn(async move {
            let result = JobOutcome::from(job.await);
            outcome.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(result);
                    true
                } else {
                    false
                }
            });
        });
        entry.handle = Some(handle.abort_handle());
        info!("Started process {} ({})", process_id, entry.executor);
        Ok(())
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionBackend for ExecutorRegistry {
    async fn invoke(
        &self,
        executor: &str,
        inputs: &Map<String, Value>,
    ) -> std::result::Result<TaskOutput, TaskFailure> {
        match self.pure.get(executor) {
            Some(function) => function(inputs),
            None => Err(BackendError::UnknownExecutor {
                name: executor.to_string(),
            }
            .into()),
        }
    }

    async fn submit(&self, executor: &str, inputs: &Map<String, Value>) -> std::result::Result<String, TaskFailure> {
        let process_id = self.create_process(executor, inputs)?;
        self.start_process(&process_id)?;
        Ok(process_id)
    }

    async fn create_paused(
        &self,
        executor: &str,
        inputs: &Map<String, Value>,
    ) -> std::result::Result<String, TaskFailure> {
        let process_id = self.create_process(executor, inputs)?;
        debug!("Created paused process {} ({})", process_id, executor);
        Ok(process_id)
    }

    async fn play(&self, process_id: &str) -> std::result::Result<(), TaskFailure> {
        Ok(self.start_process(process_id)?)
    }

    fn watch(&self, process_id: &str) -> BoxFuture<'static, JobOutcome> {
        let receiver = self
            .processes
            .lock()
            .ok()
            .and_then(|table| table.get(process_id).map(|entry| entry.outcome.subscribe()));

        let Some(mut receiver) = receiver else {
            let failure = TaskFailure::from(BackendError::UnknownProcess {
                process_id: process_id.to_string(),
            });
            return future::ready(JobOutcome::Failed(failure)).boxed();
        };

        async move {
            loop {
                if let Some(outcome) = receiver.borrow_and_update().clone() {
                    return outcome;
                }
                if receiver.changed().await.is_err() {
                    return JobOutcome::Failed(TaskFailure::new("process table dropped"));
                }
            }
        }
        .boxed()
    }

    async fn cancel(&self, process_id: &str) {
        let Ok(mut table) = self.processes.lock() else {
            return;
        };
        if let Some(entry) = table.get_mut(process_id) {
            if let Some(handle) = entry.handle.take() {
                handle.abort();
            }
            entry.outcome.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(JobOutcome::Cancelled);
                    true
                } else {
                    false
                }
            });
            info!("Cancelled process {}", process_id);
        }
    }

    fn release(&self, process_id: &str) {
        let Ok(mut table) = self.processes.lock() else {
            return;
        };
        let finished = table
            .get(process_id)
            .map_or(false, |entry| entry.outcome.borrow().is_some());
        if finished {
            table.remove(process_id);
            debug!("Released process {}", process_id);
        }
    }

    fn spawn(&self, executor: &str, inputs: Map<String, Value>) -> std::result::Result<TaskFuture, TaskFailure> {
        if let Some(function) = self.async_fns.get(executor) {
            return Ok(function(inputs));
        }
        if let Some(function) = self.pure.get(executor) {
            let function = function.clone();
            return Ok(async move { function(&inputs) }.boxed());
        }
        Err(BackendError::UnknownExecutor {
            name: executor.to_string(),
        }
        .into())
    }

    fn executors(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pure
            .keys()
            .chain(self.async_fns.keys())
            .chain(self.jobs.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
