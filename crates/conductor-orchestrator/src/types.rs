use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// How a step's work is distributed among its selected agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationStrategy {
    /// All agents run concurrently; partial success is valid.
    #[default]
    Parallel,
    /// Agents run one after another in selection order.
    Sequential,
    /// Each agent enriches the payload produced by the previous one.
    Pipeline,
    /// Input is partitioned across agents and the fragments recombined.
    ScatterGather,
}

impl std::fmt::Display for CoordinationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinationStrategy::Parallel => write!(f, "parallel"),
            CoordinationStrategy::Sequential => write!(f, "sequential"),
            CoordinationStrategy::Pipeline => write!(f, "pipeline"),
            CoordinationStrategy::ScatterGather => write!(f, "scatter_gather"),
        }
    }
}

/// Dispatch priority of an agent task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
/// Dispatch priority of an agent task.
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Ahead of normal work.
    High,
    /// Ahead of everything else.
    Critical,
}

/// Retry behaviour for a single agent task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts allowed, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Cap for the exponential backoff.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff to wait after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(exp));
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Lifecycle of an agent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTaskState {
    /// Created and bound to an agent.
    Assigned,
    /// An attempt is running.
    Executing,
    /// Finished with a result.
    Completed,
    /// Last attempt failed.
    Failed,
}

/// One unit of work dispatched to one agent for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    /// Unique id of the task.
    pub task_id: Uuid,
    /// Agent that runs it.
    pub agent_id: String,
    /// Step it belongs to.
    pub step_id: String,
    /// Task kind passed to the executor.
    pub task_type: String,
    /// Payload for the agent.
    pub input_data: serde_json::Value,
    /// Step configuration.
    pub config: serde_json::Value,
    /// Dispatch priority.
    pub priority: TaskPriority,
    /// Retry policy.
    pub retry_config: RetryConfig,
    /// Per-attempt deadline.
    pub timeout_ms: Option<u64>,
    /// Lifecycle state.
    pub state: AgentTaskState,
    /// Attempts started so far.
    pub attempts: u32,
    /// Start of the first attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Result of the successful attempt.
    pub result: Option<serde_json::Value>,
    /// Error of the last failed attempt.
    pub error: Option<String>,
}

impl AgentTask {
    /// Task in the assigned state with no attempts.
    pub fn new(
        agent_id: impl Into<String>,
        step_id: impl Into<String>,
        task_type: impl Into<String>,
        input_data: serde_json::Value,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            step_id: step_id.into(),
            task_type: task_type.into(),
            input_data,
            config: serde_json::Value::Null,
            priority: TaskPriority::Normal,
            retry_config: RetryConfig::default(),
            timeout_ms: None,
            state: AgentTaskState::Assigned,
            attempts: 0,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Set the step configuration.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry_config = retry;
        self
    }

    /// Set the per-attempt deadline.
    pub fn with_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Start a new attempt. Returns `false` once `max_attempts` is exhausted.
    pub fn begin_attempt(&mut self) -> bool {
        if self.attempts >= self.retry_config.max_attempts {
            return false;
        }
        self.attempts += 1;
        self.state = AgentTaskState::Executing;
        self.error = None;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        true
    }

    /// Record a successful attempt.
    pub fn complete(&mut self, result: serde_json::Value) {
        self.state = AgentTaskState::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    /// Record a failed attempt.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.state = AgentTaskState::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    /// True iff the task failed and has attempts left.
    pub fn can_retry(&self) -> bool {
        self.state == AgentTaskState::Failed && self.attempts < self.retry_config.max_attempts
    }

    /// True once the task succeeded or ran out of attempts.
    pub fn is_finished(&self) -> bool {
        match self.state {
            AgentTaskState::Completed => true,
            AgentTaskState::Failed => !self.can_retry(),
            _ => false,
        }
    }

    /// Wall time between the first attempt and the final outcome.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().try_into().ok(),
            _ => None,
        }
    }
}
