// ABOUTME: File-backed GraphStore that keeps instance state under a state directory
// ABOUTME: Stores graphs as YAML and checkpoints plus task fields as JSON per instance

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::{GraphStore, Result, StoreError};
use crate::engine::Checkpoint;
use crate::parser::GraphDefinition;

const CHECKPOINT_FILE: &str = "checkpoint.json";
const TASKS_FILE: &str = "tasks.json";

/// Layout: `graphs/{id}.yaml`, `instances/{id}/checkpoint.json`, `instances/{id}/tasks.json`.
pub struct FileGraphStore {
    root: PathBuf,
}

impl FileGraphStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn save_graph(&self, graph_id: &str, graph: &GraphDefinition) -> Result<()> {
        let content = graph
            .to_yaml()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.graph_path(graph_id), content.as_bytes()).await
    }

    fn graph_path(&self, graph_id: &str) -> PathBuf {
        self.root.join("graphs").join(format!("{}.yaml", graph_id))
    }

    fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.root.join("instances").join(instance_id)
    }

    async fn read_task_fields(&self, instance_id: &str) -> Result<BTreeMap<String, Map<String, Value>>> {
        let path = self.instance_dir(instance_id).join(TASKS_FILE);
        match fs::read_to_string(&path).await {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| StoreError::Serialization(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Last persisted fields of one task.
    pub async fn task_fields(&self, instance_id: &str, task: &str) -> Result<Option<Map<String, Value>>> {
        Ok(self.read_task_fields(instance_id).await?.remove(task))
    }
}

#[async_trait]
impl GraphStore for FileGraphStore {
    async fn load_graph(&self, graph_id: &str) -> Result<GraphDefinition> {
        let path = self.graph_path(graph_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(graph_id.to_string()))
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        GraphDefinition::from_yaml(&content).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    async fn persist_task_field(
        &self,
        instance_id: &str,
        task: &str,
        field: &str,
        value: &Value,
    ) -> Result<()> {
        let mut fields = self.read_task_fields(instance_id).await?;
        fields
            .entry(task.to_string())
            .or_default()
            .insert(field.to_string(), value.clone());

        let content = serde_json::to_vec_pretty(&fields)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.instance_dir(instance_id).join(TASKS_FILE), &content).await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let content = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let path = self.instance_dir(&checkpoint.instance_id).join(CHECKPOINT_FILE);
        write_atomic(&path, &content).await?;
        debug!("Saved checkpoint {}", path.display());
        Ok(())
    }

    async fn load_checkpoint(&self, instance_id: &str) -> Result<Checkpoint> {
        let path = self.instance_dir(instance_id).join(CHECKPOINT_FILE);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(instance_id.to_string()))
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        serde_json::from_str(&content).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// Write through a temporary sibling so readers never see a partial file.
async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
