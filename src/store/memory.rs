// ABOUTME: In-memory GraphStore for tests and embedding
// ABOUTME: Keeps graphs, mirrored task fields and the latest checkpoint per instance in locked maps

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{GraphStore, Result, StoreError};
use crate::engine::Checkpoint;
use crate::parser::GraphDefinition;

#[derive(Default)]
pub struct MemoryGraphStore {
    graphs: RwLock<HashMap<String, GraphDefinition>>,
    fields: RwLock<HashMap<String, HashMap<String, Map<String, Value>>>>,
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_graph(&self, graph_id: &str, graph: GraphDefinition) -> Result<()> {
        self.graphs
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .insert(graph_id.to_string(), graph);
        Ok(())
    }

    /// Last persisted fields of one task.
    pub fn task_fields(&self, instance_id: &str, task: &str) -> Option<Map<String, Value>> {
        let fields = self.fields.read().ok()?;
        fields.get(instance_id)?.get(task).cloned()
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.checkpoints
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn load_graph(&self, graph_id: &str) -> Result<GraphDefinition> {
        let graphs = self
            .graphs
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        graphs
            .get(graph_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(graph_id.to_string()))
    }

    async fn persist_task_field(
        &self,
        instance_id: &str,
        task: &str,
        field: &str,
        value: &Value,
    ) -> Result<()> {
        let mut fields = self
            .fields
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        fields
            .entry(instance_id.to_string())
            .or_default()
            .entry(task.to_string())
            .or_default()
            .insert(field.to_string(), value.clone());
        Ok(())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .insert(checkpoint.instance_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, instance_id: &str) -> Result<Checkpoint> {
        let checkpoints = self
            .checkpoints
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        checkpoints
            .get(instance_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(instance_id.to_string()))
    }
}
