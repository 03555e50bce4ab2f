use crate::checkpoint::{CheckpointLevel, CheckpointTrigger, StateCheckpoint};
use crate::context::ExecutionContext;
use crate::store::CheckpointStore;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Checkpoint cadence and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateManagerConfig {
    /// Progress units (completed steps) between automatic checkpoints. `0` disables them.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    /// Checkpoints retained per execution; the oldest are dropped first.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints_per_execution: usize,
    /// Level used for automatic checkpoints.
    #[serde(default)]
    pub default_level: CheckpointLevel,
}

fn default_checkpoint_interval() -> u64 {
    5
}

fn default_max_checkpoints() -> usize {
    10
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            max_checkpoints_per_execution: default_max_checkpoints(),
            default_level: CheckpointLevel::default(),
        }
    }
}

struct ManagedExecution {
    workflow_id: String,
    started_at: DateTime<Utc>,
    last_interval_progress: u64,
    checkpoints: VecDeque<StateCheckpoint>,
}

/// Summary of a managed execution.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedExecutionInfo {
    /// Managed execution.
    pub execution_id: Uuid,
    /// Workflow being executed.
    pub workflow_id: String,
    /// When management started.
    pub started_at: DateTime<Utc>,
    /// Checkpoints currently retained.
    pub checkpoint_count: usize,
    /// Time of the newest checkpoint.
    pub last_checkpoint_at: Option<DateTime<Utc>>,
}

/// Tracks active executions and their checkpoint ring buffers.
pub struct WorkflowStateManager {
    config: StateManagerConfig,
    active: RwLock<HashMap<Uuid, ManagedExecution>>,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl WorkflowStateManager {
    /// Manager that keeps checkpoints in memory only.
    pub fn new(config: StateManagerConfig) -> Self {
        Self {
            config,
            active: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Mirror checkpoints into a durable store.
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Manager configuration.
    pub fn config(&self) -> &StateManagerConfig {
        &self.config
    }

    /// Register an execution. Re-registering keeps its existing checkpoints.
    pub async fn start_managing_execution(&self, context: &ExecutionContext) {
        let mut active = self.active.write().await;
        active
            .entry(context.execution_id)
            .or_insert_with(|| ManagedExecution {
                workflow_id: context.workflow_id.clone(),
                started_at: Utc::now(),
                last_interval_progress: context.progress,
                checkpoints: VecDeque::new(),
            });
        info!(
            execution_id = %context.execution_id,
            workflow_id = %context.workflow_id,
            "State manager tracking execution"
        );
    }

    /// True if `execution_id` is managed.
    pub async fn is_managing(&self, execution_id: Uuid) -> bool {
        self.active.read().await.contains_key(&execution_id)
    }

    /// Number of managed executions.
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Summary of a managed execution.
    pub async fn execution_info(&self, execution_id: Uuid) -> Option<ManagedExecutionInfo> {
        let active = self.active.read().await;
        let managed = active.get(&execution_id)?;
        Some(ManagedExecutionInfo {
            execution_id,
            workflow_id: managed.workflow_id.clone(),
            started_at: managed.started_at,
            checkpoint_count: managed.checkpoints.len(),
            last_checkpoint_at: managed.checkpoints.back().map(|c| c.timestamp),
        })
    }

    /// Snapshot the fields implied by `level` and retain it.
    ///
    /// The oldest checkpoint is evicted once the ring is full.
    pub async fn create_checkpoint(
        &self,
        context: &ExecutionContext,
        level: CheckpointLevel,
        trigger: CheckpointTrigger,
    ) -> ConductorResult<StateCheckpoint> {
        let checkpoint = StateCheckpoint::capture(context, level, trigger)?;

        let evicted = {
            let mut active = self.active.write().await;
            let managed = active.get_mut(&context.execution_id).ok_or_else(|| {
                ConductorError::NotFound(format!(
                    "execution {} is not managed",
                    context.execution_id
                ))
            })?;
            if trigger == CheckpointTrigger::Interval {
                managed.last_interval_progress = context.progress;
            }
            managed.checkpoints.push_back(checkpoint.clone());
            let mut evicted = Vec::new();
            while managed.checkpoints.len() > self.config.max_checkpoints_per_execution.max(1) {
                if let Some(old) = managed.checkpoints.pop_front() {
                    evicted.push(old.checkpoint_id);
                }
            }
            evicted
        };

        debug!(
            execution_id = %context.execution_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            level = ?level,
            trigger = ?trigger,
            size_bytes = checkpoint.size_bytes,
            "Checkpoint created"
        );

        if let Some(store) = &self.store {
            store.save(&checkpoint).await?;
            for checkpoint_id in evicted {
                store.delete(context.execution_id, checkpoint_id).await?;
            }
        }

        Ok(checkpoint)
    }

    /// Take an automatic checkpoint if `checkpoint_interval` progress units
    /// have accrued since the last automatic one.
    pub async fn maybe_checkpoint(
        &self,
        context: &ExecutionContext,
    ) -> ConductorResult<Option<StateCheckpoint>> {
        let interval = self.config.checkpoint_interval;
        if interval == 0 {
            return Ok(None);
        }
        let due = {
            let active = self.active.read().await;
            match active.get(&context.execution_id) {
                Some(managed) => {
                    context.progress.saturating_sub(managed.last_interval_progress) >= interval
                }
                None => false,
            }
        };
        if !due {
            return Ok(None);
        }
        self.create_checkpoint(context, self.config.default_level, CheckpointTrigger::Interval)
            .await
            .map(Some)
    }

    /// Stop tracking an execution, optionally taking a last comprehensive
    /// snapshot first.
    pub async fn stop_managing_execution(
        &self,
        context: &ExecutionContext,
        final_checkpoint: bool,
    ) -> ConductorResult<Option<StateCheckpoint>> {
        if !self.is_managing(context.execution_id).await {
            return Err(ConductorError::NotFound(format!(
                "execution {} is not managed",
                context.execution_id
            )));
        }

        let last = if final_checkpoint {
            Some(
                self.create_checkpoint(
                    context,
                    CheckpointLevel::Comprehensive,
                    CheckpointTrigger::Final,
                )
                .await?,
            )
        } else {
            None
        };

        self.active.write().await.remove(&context.execution_id);
        info!(
            execution_id = %context.execution_id,
            status = %context.status,
            final_checkpoint,
            "State manager released execution"
        );
        Ok(last)
    }

    /// Retained checkpoints of an active execution, oldest first.
    pub async fn checkpoints(&self, execution_id: Uuid) -> Vec<StateCheckpoint> {
        self.active
            .read()
            .await
            .get(&execution_id)
            .map(|m| m.checkpoints.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Newest retained checkpoint that passes its integrity check.
    pub async fn latest_valid_checkpoint(&self, execution_id: Uuid) -> Option<StateCheckpoint> {
        let checkpoints = self.checkpoints(execution_id).await;
        Self::newest_valid(checkpoints.into_iter().rev())
    }

    fn newest_valid(
        candidates: impl Iterator<Item = StateCheckpoint>,
    ) -> Option<StateCheckpoint> {
        for checkpoint in candidates {
            match checkpoint.verify() {
                Ok(()) => return Some(checkpoint),
                Err(e) => warn!(
                    checkpoint_id = %checkpoint.checkpoint_id,
                    error = %e,
                    "Skipping corrupt checkpoint"
                ),
            }
        }
        None
    }

    /// Rebuild an execution context from the newest valid checkpoint held
    /// in memory or in the store.
    pub async fn recover_execution(&self, execution_id: Uuid) -> ConductorResult<ExecutionContext> {
        let mut candidates = self.checkpoints(execution_id).await;
        if let Some(store) = &self.store {
            let known: HashSet<Uuid> = candidates.iter().map(|c| c.checkpoint_id).collect();
            let stored = store.load(execution_id).await?;
            candidates.extend(
                stored
                    .into_iter()
                    .filter(|c| !known.contains(&c.checkpoint_id)),
            );
        }

        if candidates.is_empty() {
            return Err(ConductorError::NotFound(format!(
                "no checkpoints for execution {execution_id}"
            )));
        }

        let total = candidates.len();
        candidates.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.checkpoint_level.cmp(&a.checkpoint_level))
        });
        let checkpoint = Self::newest_valid(candidates.into_iter()).ok_or_else(|| {
            ConductorError::CheckpointIntegrity(format!(
                "all {total} checkpoints of execution {execution_id} failed verification"
            ))
        })?;

        info!(
            execution_id = %execution_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            level = ?checkpoint.checkpoint_level,
            "Recovered execution from checkpoint"
        );
        Ok(checkpoint.restore_context())
    }
}

impl Default for WorkflowStateManager {
    fn default() -> Self {
        Self::new(StateManagerConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::checkpoint::StateSnapshot;
    use crate::context::ExecutionStatus;
    use crate::store::InMemoryCheckpointStore;
    use serde_json::json;
    use std::time::Duration;

    fn manager(interval: u64, max: usize) -> WorkflowStateManager {
        WorkflowStateManager::new(StateManagerConfig {
            checkpoint_interval: interval,
            max_checkpoints_per_execution: max,
            default_level: CheckpointLevel::Standard,
        })
    }

    #[tokio::test]
    async fn test_register_and_release() {
        let mgr = manager(5, 10);
        let ctx = ExecutionContext::new("wf", json!(null));
        mgr.start_managing_execution(&ctx).await;
        assert!(mgr.is_managing(ctx.execution_id).await);
        assert_eq!(mgr.active_count().await, 1);

        let last = mgr.stop_managing_execution(&ctx, false).await.unwrap();
        assert!(last.is_none());
        assert!(!mgr.is_managing(ctx.execution_id).await);
    }

    #[tokio::test]
    async fn test_checkpoint_requires_registration() {
        let mgr = manager(5, 10);
        let ctx = ExecutionContext::new("wf", json!(null));
        let err = mgr
            .create_checkpoint(&ctx, CheckpointLevel::Minimal, CheckpointTrigger::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_ring_buffer_evicts_oldest() {
        let mgr = manager(0, 3);
        let mut ctx = ExecutionContext::new("wf", json!(null));
        mgr.start_managing_execution(&ctx).await;

        let mut ids = Vec::new();
        for i in 0..5 {
            ctx.set_variable("i", json!(i));
            let cp = mgr
                .create_checkpoint(&ctx, CheckpointLevel::Standard, CheckpointTrigger::Manual)
                .await
                .unwrap();
            ids.push(cp.checkpoint_id);
        }

        let kept: Vec<Uuid> = mgr
            .checkpoints(ctx.execution_id)
            .await
            .iter()
            .map(|c| c.checkpoint_id)
            .collect();
        assert_eq!(kept, ids[2..].to_vec());
    }

    #[tokio::test]
    async fn test_interval_checkpoints() {
        let mgr = manager(2, 10);
        let mut ctx = ExecutionContext::new("wf", json!(null));
        mgr.start_managing_execution(&ctx).await;

        ctx.mark_step_completed("a", None);
        assert!(mgr.maybe_checkpoint(&ctx).await.unwrap().is_none());

        ctx.mark_step_completed("b", None);
        let cp = mgr.maybe_checkpoint(&ctx).await.unwrap().unwrap();
        assert_eq!(cp.trigger, CheckpointTrigger::Interval);
        assert_eq!(cp.checkpoint_level, CheckpointLevel::Standard);

        // Manual checkpoints do not shift the interval cadence.
        mgr.create_checkpoint(&ctx, CheckpointLevel::Minimal, CheckpointTrigger::Manual)
            .await
            .unwrap();
        ctx.mark_step_completed("c", None);
        assert!(mgr.maybe_checkpoint(&ctx).await.unwrap().is_none());
        ctx.mark_step_completed("d", None);
        assert!(mgr.maybe_checkpoint(&ctx).await.unwrap().is_some());
        assert_eq!(mgr.checkpoints(ctx.execution_id).await.len(), 3);
    }

    #[tokio::test]
    async fn test_interval_disabled() {
        let mgr = manager(0, 10);
        let mut ctx = ExecutionContext::new("wf", json!(null));
        mgr.start_managing_execution(&ctx).await;
        for step in ["a", "b", "c"] {
            ctx.mark_step_completed(step, None);
        }
        assert!(mgr.maybe_checkpoint(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_valid_skips_corrupt() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mgr = manager(0, 10).with_store(store.clone());
        let mut ctx = ExecutionContext::new("wf", json!(null));
        mgr.start_managing_execution(&ctx).await;

        ctx.set_variable("v", json!(1));
        let good = mgr
            .create_checkpoint(&ctx, CheckpointLevel::Standard, CheckpointTrigger::Manual)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        ctx.set_variable("v", json!(2));
        mgr.create_checkpoint(&ctx, CheckpointLevel::Standard, CheckpointTrigger::Manual)
            .await
            .unwrap();
        mgr.stop_managing_execution(&ctx, false).await.unwrap();

        // Corrupt the newest stored record.
        store
            .with_checkpoints_mut(ctx.execution_id, |list| {
                if let Some(StateSnapshot::Standard(s)) =
                    list.last_mut().map(|c| &mut c.state_data)
                {
                    s.variables.insert("v".into(), json!(99));
                }
            })
            .await;

        let recovered = mgr.recover_execution(ctx.execution_id).await.unwrap();
        assert_eq!(recovered.get_variable("v"), Some(&json!(1)));
        assert!(good.validate_integrity());
    }

    #[tokio::test]
    async fn test_recover_all_corrupt() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mgr = manager(0, 10).with_store(store.clone());
        let ctx = ExecutionContext::new("wf", json!(null));
        mgr.start_managing_execution(&ctx).await;
        mgr.create_checkpoint(&ctx, CheckpointLevel::Minimal, CheckpointTrigger::Manual)
            .await
            .unwrap();
        mgr.stop_managing_execution(&ctx, false).await.unwrap();

        store
            .with_checkpoints_mut(ctx.execution_id, |list| {
                for cp in list.iter_mut() {
                    cp.digest = "0".repeat(64);
                }
            })
            .await;

        let err = mgr.recover_execution(ctx.execution_id).await.unwrap_err();
        assert!(matches!(err, ConductorError::CheckpointIntegrity(_)));
    }

    #[tokio::test]
    async fn test_recover_unknown() {
        let mgr = manager(5, 10);
        let err = mgr.recover_execution(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ConductorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_final_checkpoint_survives_release() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mgr = manager(5, 10).with_store(store.clone());
        let mut ctx = ExecutionContext::new("wf", json!({"k": "v"}));
        mgr.start_managing_execution(&ctx).await;
        ctx.set_status(ExecutionStatus::Running);
        ctx.pause();

        let last = mgr.stop_managing_execution(&ctx, true).await.unwrap().unwrap();
        assert_eq!(last.checkpoint_level, CheckpointLevel::Comprehensive);
        assert_eq!(last.trigger, CheckpointTrigger::Final);

        let recovered = mgr.recover_execution(ctx.execution_id).await.unwrap();
        assert!(recovered.is_paused);
        assert_eq!(recovered.input_data, json!({"k": "v"}));
    }

    #[tokio::test]
    async fn test_store_mirrors_retention() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mgr = manager(0, 2).with_store(store.clone());
        let ctx = ExecutionContext::new("wf", json!(null));
        mgr.start_managing_execution(&ctx).await;
        for _ in 0..4 {
            mgr.create_checkpoint(&ctx, CheckpointLevel::Minimal, CheckpointTrigger::Manual)
                .await
                .unwrap();
        }
        assert_eq!(store.count(ctx.execution_id).await, 2);
        let info = mgr.execution_info(ctx.execution_id).await.unwrap();
        assert_eq!(info.checkpoint_count, 2);
    }
}
