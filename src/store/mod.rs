// ABOUTME: Persistence seam for graph definitions, task fields and instance checkpoints
// ABOUTME: Defines the async GraphStore trait with in-memory and file-backed implementations

pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::engine::Checkpoint;
use crate::parser::GraphDefinition;

pub use file::FileGraphStore;
pub use memory::MemoryGraphStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Load a stored graph definition, used by sub-graph tasks.
    async fn load_graph(&self, graph_id: &str) -> Result<GraphDefinition>;

    /// Record one changed task field of an instance.
    async fn persist_task_field(
        &self,
        instance_id: &str,
        task: &str,
        field: &str,
        value: &Value,
    ) -> Result<()>;

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn load_checkpoint(&self, instance_id: &str) -> Result<Checkpoint>;
}
