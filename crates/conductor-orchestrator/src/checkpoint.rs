use crate::context::{CompletedStep, ExecutionContext, ExecutionPhase, ExecutionStatus};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// How much of an execution a checkpoint captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointLevel {
    /// Identity and lifecycle flags.
    Minimal,
    /// Adds variables and step progress.
    #[default]
    Standard,
    /// Adds global context, step results and input.
    Comprehensive,
}

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    /// Requested through the engine or state manager.
    Manual,
    /// Taken after `checkpoint_interval` progress units.
    Interval,
    /// Taken after a step marked `checkpoint_after`.
    StepCompleted,
    /// Taken when the execution pauses.
    Pause,
    /// Taken when the execution resumes.
    Resume,
    /// Taken when management of the execution stops.
    Final,
}

/// Identity and lifecycle flags only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimalSnapshot {
    /// Execution the snapshot belongs to.
    pub execution_id: Uuid,
    /// Workflow being executed.
    pub workflow_id: String,
    /// Status at capture time.
    pub status: ExecutionStatus,
    /// Phase at capture time.
    pub phase: ExecutionPhase,
    /// Whether the execution was paused.
    pub is_paused: bool,
}

/// Minimal plus user variables and step progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardSnapshot {
    /// Minimal fields.
    #[serde(flatten)]
    pub minimal: MinimalSnapshot,
    /// User variables.
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Steps completed so far.
    pub completed_steps: BTreeMap<String, CompletedStep>,
    /// Progress counter.
    pub progress: u64,
}

/// Everything needed to rebuild the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComprehensiveSnapshot {
    /// Standard fields.
    #[serde(flatten)]
    pub standard: StandardSnapshot,
    /// Context shared across steps.
    pub global_context: BTreeMap<String, serde_json::Value>,
    /// Step results keyed by step id.
    pub step_results: BTreeMap<String, serde_json::Value>,
    /// Execution input.
    pub input_data: serde_json::Value,
}

/// Captured execution state; each level owns exactly its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum StateSnapshot {
    /// Minimal snapshot.
    Minimal(MinimalSnapshot),
    /// Standard snapshot.
    Standard(StandardSnapshot),
    /// Comprehensive snapshot.
    Comprehensive(ComprehensiveSnapshot),
}

impl StateSnapshot {
    /// Capture `context` at `level`.
    pub fn capture(context: &ExecutionContext, level: CheckpointLevel) -> Self {
        let minimal = MinimalSnapshot {
            execution_id: context.execution_id,
            workflow_id: context.workflow_id.clone(),
            status: context.status,
            phase: context.phase,
            is_paused: context.is_paused,
        };
        if level == CheckpointLevel::Minimal {
            return StateSnapshot::Minimal(minimal);
        }

        let standard = StandardSnapshot {
            minimal,
            variables: context.variables.clone(),
            completed_steps: context.completed_steps.clone(),
            progress: context.progress,
        };
        if level == CheckpointLevel::Standard {
            return StateSnapshot::Standard(standard);
        }

        StateSnapshot::Comprehensive(ComprehensiveSnapshot {
            standard,
            global_context: context.global_context.clone(),
            step_results: context.step_results.clone(),
            input_data: context.input_data.clone(),
        })
    }

    /// Level this snapshot was captured at.
    pub fn level(&self) -> CheckpointLevel {
        match self {
            StateSnapshot::Minimal(_) => CheckpointLevel::Minimal,
            StateSnapshot::Standard(_) => CheckpointLevel::Standard,
            StateSnapshot::Comprehensive(_) => CheckpointLevel::Comprehensive,
        }
    }

    /// Minimal fields, present at every level.
    pub fn minimal(&self) -> &MinimalSnapshot {
        match self {
            StateSnapshot::Minimal(m) => m,
            StateSnapshot::Standard(s) => &s.minimal,
            StateSnapshot::Comprehensive(c) => &c.standard.minimal,
        }
    }

    /// Standard fields, if captured at standard level or above.
    pub fn standard(&self) -> Option<&StandardSnapshot> {
        match self {
            StateSnapshot::Minimal(_) => None,
            StateSnapshot::Standard(s) => Some(s),
            StateSnapshot::Comprehensive(c) => Some(&c.standard),
        }
    }

    /// Canonical encoding the digest is computed over.
    fn canonical_bytes(&self) -> ConductorResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// An integrity-checked snapshot of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateCheckpoint {
    /// Unique id of this checkpoint.
    pub checkpoint_id: Uuid,
    /// Execution the checkpoint belongs to.
    pub execution_id: Uuid,
    /// Capture time. Recovery prefers the newest.
    pub timestamp: DateTime<Utc>,
    /// Level of `state_data`.
    pub checkpoint_level: CheckpointLevel,
    /// What caused the capture.
    pub trigger: CheckpointTrigger,
    /// Captured state.
    pub state_data: StateSnapshot,
    /// Length of the canonical `state_data` encoding.
    pub size_bytes: usize,
    /// Hex SHA-256 of the canonical `state_data` encoding at creation.
    pub digest: String,
}

fn digest_of(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl StateCheckpoint {
    /// Snapshot `context` and seal it with a digest.
    pub fn capture(
        context: &ExecutionContext,
        level: CheckpointLevel,
        trigger: CheckpointTrigger,
    ) -> ConductorResult<Self> {
        let state_data = StateSnapshot::capture(context, level);
        let bytes = state_data.canonical_bytes()?;
        Ok(Self {
            checkpoint_id: Uuid::new_v4(),
            execution_id: context.execution_id,
            timestamp: Utc::now(),
            checkpoint_level: level,
            trigger,
            size_bytes: bytes.len(),
            digest: digest_of(&bytes),
            state_data,
        })
    }

    /// Recompute the digest over `state_data` and compare.
    pub fn validate_integrity(&self) -> bool {
        match self.state_data.canonical_bytes() {
            Ok(bytes) => {
                self.state_data.level() == self.checkpoint_level
                    && self.state_data.minimal().execution_id == self.execution_id
                    && digest_of(&bytes) == self.digest
            }
            Err(_) => false,
        }
    }

    /// [`validate_integrity`](Self::validate_integrity) as a `Result`.
    pub fn verify(&self) -> ConductorResult<()> {
        if self.validate_integrity() {
            Ok(())
        } else {
            Err(ConductorError::CheckpointIntegrity(format!(
                "checkpoint {} of execution {} failed digest verification",
                self.checkpoint_id, self.execution_id
            )))
        }
    }

    /// Rebuild an execution context from the captured fields.
    ///
    /// Fields the level did not capture come back empty.
    pub fn restore_context(&self) -> ExecutionContext {
        let minimal = self.state_data.minimal();
        let input = match &self.state_data {
            StateSnapshot::Comprehensive(c) => c.input_data.clone(),
            _ => serde_json::Value::Null,
        };
        let mut context =
            ExecutionContext::with_id(minimal.execution_id, minimal.workflow_id.clone(), input);
        context.status = minimal.status;
        context.phase = minimal.phase;
        context.is_paused = minimal.is_paused;

        if let Some(standard) = self.state_data.standard() {
            context.variables = standard.variables.clone();
            context.completed_steps = standard.completed_steps.clone();
            context.progress = standard.progress;
        }
        if let StateSnapshot::Comprehensive(c) = &self.state_data {
            context.global_context = c.global_context.clone();
            context.step_results = c.step_results.clone();
        }
        context
    }
}
