// ABOUTME: Graph scheduling engine for stepgraph
// ABOUTME: Drives task graphs step by step over a context store, awaitables and control-flow containers

pub mod awaitable;
pub mod backend;
pub mod checkpoint;
pub mod connectivity;
pub mod context;
pub mod control_flow;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod error_handler;
pub mod result;
pub mod task;

pub use awaitable::{Awaitable, AwaitableRegistry, AwaitableTarget};
pub use backend::{ExecutionBackend, JobOutcome, TaskFailure, TaskFuture, TaskOutput};
pub use checkpoint::Checkpoint;
pub use context::{ContextStore, Slot, WriteDiscipline};
pub use control_flow::{conditions_hold, truthy};
pub use driver::{ControlMessage, DriverState, EngineHandle, EngineOptions, GraphEngine};
pub use error::{EngineError, Result};
pub use error_handler::{ErrorHandler, HandlerRegistry, TaskPatch};
pub use result::{ExitCondition, GraphRunResult, RunSummary, TaskReport};
pub use task::{Task, TaskAction, TaskKind, TaskState, TaskTable};
