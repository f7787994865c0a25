// ABOUTME: Main library module for the stepgraph task graph scheduler
// ABOUTME: Exports all core modules and provides the public API

pub mod cli;
pub mod engine;
pub mod parser;
pub mod store;
pub mod tasks;

// Re-export commonly used types
pub use cli::{App, Args, Config};
pub use engine::{
    ContextStore, EngineHandle, ExitCondition, GraphEngine, GraphRunResult, TaskState,
};
pub use parser::{GraphDefinition, GraphParser, GraphValidator, TaskDefinition};
pub use store::{FileGraphStore, GraphStore, MemoryGraphStore};
pub use tasks::ExecutorRegistry;

// Error handling
pub type Result<T> = anyhow::Result<T>;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
