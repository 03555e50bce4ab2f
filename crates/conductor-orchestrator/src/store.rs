use crate::checkpoint::StateCheckpoint;
use async_trait::async_trait;
use conductor_core::ConductorResult;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Durable storage for checkpoints, keyed by `(execution_id, timestamp)`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint.
    async fn save(&self, checkpoint: &StateCheckpoint) -> ConductorResult<()>;
    /// All checkpoints of an execution, oldest first.
    async fn load(&self, execution_id: Uuid) -> ConductorResult<Vec<StateCheckpoint>>;
    /// Remove one checkpoint.
    async fn delete(&self, execution_id: Uuid, checkpoint_id: Uuid) -> ConductorResult<()>;
    /// Remove every checkpoint of an execution.
    async fn delete_all(&self, execution_id: Uuid) -> ConductorResult<()>;
    /// Executions with at least one checkpoint.
    async fn list_executions(&self) -> ConductorResult<Vec<Uuid>>;
}

/// Process-local checkpoint store.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<Uuid, Vec<StateCheckpoint>>>,
}

impl InMemoryCheckpointStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checkpoints held for an execution.
    pub async fn count(&self, execution_id: Uuid) -> usize {
        self.checkpoints
            .read()
            .await
            .get(&execution_id)
            .map_or(0, Vec::len)
    }

    /// Direct mutable access, for simulating corruption of stored records.
    #[cfg(test)]
    pub(crate) async fn with_checkpoints_mut<F>(&self, execution_id: Uuid, f: F)
    where
        F: FnOnce(&mut Vec<StateCheckpoint>),
    {
        let mut all = self.checkpoints.write().await;
        if let Some(list) = all.get_mut(&execution_id) {
            f(list);
        }
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &StateCheckpoint) -> ConductorResult<()> {
        let mut all = self.checkpoints.write().await;
        let list = all.entry(checkpoint.execution_id).or_default();
        list.push(checkpoint.clone());
        list.sort_by_key(|c| c.timestamp);
        Ok(())
    }

    async fn load(&self, execution_id: Uuid) -> ConductorResult<Vec<StateCheckpoint>> {
        Ok(self
            .checkpoints
            .read()
            .await
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, execution_id: Uuid, checkpoint_id: Uuid) -> ConductorResult<()> {
        let mut all = self.checkpoints.write().await;
        if let Some(list) = all.get_mut(&execution_id) {
            list.retain(|c| c.checkpoint_id != checkpoint_id);
            if list.is_empty() {
                all.remove(&execution_id);
            }
        }
        Ok(())
    }

    async fn delete_all(&self, execution_id: Uuid) -> ConductorResult<()> {
        self.checkpoints.write().await.remove(&execution_id);
        Ok(())
    }

    async fn list_executions(&self) -> ConductorResult<Vec<Uuid>> {
        Ok(self.checkpoints.read().await.keys().copied().collect())
    }
}
