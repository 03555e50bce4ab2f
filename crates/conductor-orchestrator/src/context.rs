use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not started.
    Pending,
    /// Admitting steps.
    Running,
    /// Paused; no new steps start.
    Paused,
    /// Every step completed.
    Completed,
    /// A step failed or an error stopped the run.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl ExecutionStatus {
    /// True for completed, failed and cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Coarse phase of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    /// Validating the graph and preparing.
    Planning,
    /// Running steps.
    Execution,
    /// All steps done.
    Completion,
    /// Stopped on an error.
    Failed,
}

/// Record of a completed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedStep {
    /// Step duration, if measured.
    pub duration_ms: Option<u64>,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
}

/// Mutable state of one in-flight workflow execution.
///
/// Owned by a single engine loop. Agent tasks never write here directly;
/// the coordinator's aggregated output is merged by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Unique id of the execution.
    pub execution_id: Uuid,
    /// Workflow being executed.
    pub workflow_id: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// Input the execution started with.
    pub input_data: serde_json::Value,
    /// User variables.
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Context shared across steps.
    pub global_context: BTreeMap<String, serde_json::Value>,
    /// Step results keyed by step id.
    pub step_results: BTreeMap<String, serde_json::Value>,
    /// Completed steps keyed by step id.
    pub completed_steps: BTreeMap<String, CompletedStep>,
    /// Current phase.
    pub phase: ExecutionPhase,
    /// Set while paused.
    pub is_paused: bool,
    /// Monotonic progress counter, one unit per completed step.
    pub progress: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last mutation.
    pub updated_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// New pending context with a fresh id.
    pub fn new(workflow_id: impl Into<String>, input_data: serde_json::Value) -> Self {
        Self::with_id(Uuid::new_v4(), workflow_id, input_data)
    }

    /// New pending context with a given id.
    pub fn with_id(
        execution_id: Uuid,
        workflow_id: impl Into<String>,
        input_data: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            input_data,
            variables: BTreeMap::new(),
            global_context: BTreeMap::new(),
            step_results: BTreeMap::new(),
            completed_steps: BTreeMap::new(),
            phase: ExecutionPhase::Planning,
            is_paused: false,
            progress: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Set a user variable.
    pub fn set_variable(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.variables.insert(key.into(), value);
        self.touch();
    }

    /// Read a user variable.
    pub fn get_variable(&self, key: &str) -> Option<&serde_json::Value> {
        self.variables.get(key)
    }

    /// Set a shared context value.
    pub fn set_global(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.global_context.insert(key.into(), value);
        self.touch();
    }

    /// Store a step's result.
    pub fn record_step_result(&mut self, step_id: impl Into<String>, result: serde_json::Value) {
        self.step_results.insert(step_id.into(), result);
        self.touch();
    }

    /// Mark a step as completed. Re-marking a step keeps the first record.
    pub fn mark_step_completed(&mut self, step_id: impl Into<String>, duration: Option<Duration>) {
        let step_id = step_id.into();
        if self.completed_steps.contains_key(&step_id) {
            return;
        }
        self.completed_steps.insert(
            step_id,
            CompletedStep {
                duration_ms: duration.map(|d| d.as_millis() as u64),
                completed_at: Utc::now(),
            },
        );
        self.progress += 1;
        self.touch();
    }

    /// True if `step_id` has completed.
    pub fn is_step_completed(&self, step_id: &str) -> bool {
        self.completed_steps.contains_key(step_id)
    }

    /// Number of completed steps.
    pub fn completed_count(&self) -> usize {
        self.completed_steps.len()
    }

    /// Durations of completed steps that recorded one, keyed by step id.
    pub fn step_durations(&self) -> impl Iterator<Item = (&str, Duration)> {
        self.completed_steps.iter().filter_map(|(id, step)| {
            step.duration_ms
                .map(|ms| (id.as_str(), Duration::from_millis(ms)))
        })
    }

    /// Move to `phase`.
    pub fn set_phase(&mut self, phase: ExecutionPhase) {
        self.phase = phase;
        self.touch();
    }

    /// Set the status.
    pub fn set_status(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.touch();
    }

    /// Stop admission of new steps. In-flight agent tasks are untouched.
    pub fn pause(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.is_paused = true;
        self.status = ExecutionStatus::Paused;
        self.touch();
    }

    /// Allow steps to start again.
    pub fn resume(&mut self) {
        if !self.is_paused {
            return;
        }
        self.is_paused = false;
        if self.status == ExecutionStatus::Paused {
            self.status = ExecutionStatus::Running;
        }
        self.touch();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_context() {
        let ctx = ExecutionContext::new("deploy", json!({"repo": "x"}));
        assert_eq!(ctx.status, ExecutionStatus::Pending);
        assert_eq!(ctx.phase, ExecutionPhase::Planning);
        assert!(!ctx.is_paused);
        assert_eq!(ctx.completed_count(), 0);
    }

    #[test]
    fn test_variables() {
        let mut ctx = ExecutionContext::new("wf", json!(null));
        ctx.set_variable("branch", json!("main"));
        assert_eq!(ctx.get_variable("branch"), Some(&json!("main")));
        assert!(ctx.get_variable("missing").is_none());
    }

    #[test]
    fn test_mark_step_completed() {
        let mut ctx = ExecutionContext::new("wf", json!(null));
        ctx.mark_step_completed("build", Some(Duration::from_secs(5)));
        ctx.mark_step_completed("lint", None);
        assert!(ctx.is_step_completed("build"));
        assert_eq!(ctx.completed_count(), 2);
        assert_eq!(ctx.progress, 2);

        let durations: Vec<_> = ctx.step_durations().collect();
        assert_eq!(durations, vec![("build", Duration::from_secs(5))]);
    }

    #[test]
    fn test_mark_step_completed_is_idempotent() {
        let mut ctx = ExecutionContext::new("wf", json!(null));
        ctx.mark_step_completed("build", Some(Duration::from_secs(1)));
        ctx.mark_step_completed("build", Some(Duration::from_secs(9)));
        assert_eq!(ctx.progress, 1);
        assert_eq!(ctx.completed_steps["build"].duration_ms, Some(1000));
    }

    #[test]
    fn test_pause_and_resume() {
        let mut ctx = ExecutionContext::new("wf", json!(null));
        ctx.set_status(ExecutionStatus::Running);
        ctx.pause();
        assert!(ctx.is_paused);
        assert_eq!(ctx.status, ExecutionStatus::Paused);
        ctx.resume();
        assert!(!ctx.is_paused);
        assert_eq!(ctx.status, ExecutionStatus::Running);
    }

    #[test]
    fn test_pause_ignored_when_terminal() {
        let mut ctx = ExecutionContext::new("wf", json!(null));
        ctx.set_status(ExecutionStatus::Completed);
        ctx.pause();
        assert!(!ctx.is_paused);
        assert_eq!(ctx.status, ExecutionStatus::Completed);
    }
}
