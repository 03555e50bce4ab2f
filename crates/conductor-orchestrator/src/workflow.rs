use crate::agent::AgentRequirements;
use crate::context::ExecutionStatus;
use crate::types::{CoordinationStrategy, RetryConfig, TaskPriority};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

/// One node of a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique id within the workflow.
    pub step_id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Tie-break among steps that become ready together (lower first).
    #[serde(default)]
    pub step_order: u32,
    /// Steps that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Agents the step needs.
    #[serde(default)]
    pub agent_requirements: AgentRequirements,
    /// Overrides the workflow's default strategy.
    #[serde(default)]
    pub strategy: Option<CoordinationStrategy>,
    /// Task kind passed to agents.
    #[serde(default = "default_task_type")]
    pub task_type: String,
    /// Step payload. Falls back to the execution's input data.
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    /// Step configuration passed to agents.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Step deadline. Falls back to the engine default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Retry policy. Falls back to the coordinator default.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Priority of the step's tasks.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Keep running SEQUENTIAL/PIPELINE agents after an exhausted failure.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Take an on-demand checkpoint once this step completes.
    #[serde(default)]
    pub checkpoint_after: bool,
}

fn default_task_type() -> String {
    "default".to_string()
}

impl WorkflowStep {
    /// Step with no dependencies and default requirements.
    pub fn new(step_id: impl Into<String>) -> Self {
        let step_id = step_id.into();
        Self {
            name: step_id.clone(),
            step_id,
            step_order: 0,
            depends_on: Vec::new(),
            agent_requirements: AgentRequirements::default(),
            strategy: None,
            task_type: default_task_type(),
            input: None,
            config: serde_json::Value::Null,
            timeout_ms: None,
            retry: None,
            priority: TaskPriority::Normal,
            continue_on_error: false,
            checkpoint_after: false,
        }
    }

    /// Set the tie-break order.
    pub fn with_order(mut self, order: u32) -> Self {
        self.step_order = order;
        self
    }

    /// Set the dependencies.
    pub fn with_dependencies(mut self, deps: Vec<&str>) -> Self {
        self.depends_on = deps.into_iter().map(String::from).collect();
        self
    }

    /// Set the agent requirements.
    pub fn with_requirements(mut self, requirements: AgentRequirements) -> Self {
        self.agent_requirements = requirements;
        self
    }

    /// Set the strategy.
    pub fn with_strategy(mut self, strategy: CoordinationStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Set the task kind.
    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    /// Set the step payload.
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the step deadline.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Keep going after an agent exhausts its retries.
    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    /// Take a checkpoint after the step completes.
    pub fn checkpoint_after(mut self) -> Self {
        self.checkpoint_after = true;
        self
    }

    /// Ready when every dependency has completed.
    pub fn is_ready(&self, completed: &HashSet<&str>) -> bool {
        self.depends_on.iter().all(|d| completed.contains(d.as_str()))
    }
}

/// A directed acyclic graph of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique id of the workflow.
    pub workflow_id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Strategy for steps that set none. Falls back to the engine default.
    #[serde(default)]
    pub default_strategy: Option<CoordinationStrategy>,
    /// Steps of the graph.
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    /// Workflow over `steps`.
    pub fn new(workflow_id: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        let workflow_id = workflow_id.into();
        Self {
            name: workflow_id.clone(),
            workflow_id,
            description: String::new(),
            default_strategy: None,
            steps,
        }
    }

    /// Set the default strategy.
    pub fn with_default_strategy(mut self, strategy: CoordinationStrategy) -> Self {
        self.default_strategy = Some(strategy);
        self
    }

    /// Parse a TOML definition.
    pub fn from_toml_str(raw: &str) -> ConductorResult<Self> {
        let def: Self = toml::from_str(raw)?;
        def.validate()?;
        Ok(def)
    }

    /// Parse a JSON definition.
    pub fn from_json_str(raw: &str) -> ConductorResult<Self> {
        let def: Self = serde_json::from_str(raw)?;
        def.validate()?;
        Ok(def)
    }

    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Strategy a step runs under: its own, the workflow's, then `fallback`.
    pub fn strategy_for(
        &self,
        step: &WorkflowStep,
        fallback: CoordinationStrategy,
    ) -> CoordinationStrategy {
        step.strategy.or(self.default_strategy).unwrap_or(fallback)
    }

    /// Reject empty, duplicate-id, dangling-dependency and cyclic graphs.
    pub fn validate(&self) -> ConductorResult<()> {
        if self.workflow_id.trim().is_empty() {
            return Err(ConductorError::WorkflowExecution(
                "workflow id must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(ConductorError::WorkflowExecution(format!(
                "workflow '{}' has no steps",
                self.workflow_id
            )));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.step_id.as_str()) {
                return Err(ConductorError::WorkflowExecution(format!(
                    "duplicate step id '{}'",
                    step.step_id
                )));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(ConductorError::WorkflowExecution(format!(
                        "step '{}' depends on unknown step '{dep}'",
                        step.step_id
                    )));
                }
            }
        }
        if let Some(step_id) = self.find_cycle() {
            return Err(ConductorError::WorkflowExecution(format!(
                "dependency cycle detected through step '{step_id}'"
            )));
        }
        Ok(())
    }

    /// Returns a step on a dependency cycle, if any.
    pub fn find_cycle(&self) -> Option<&str> {
        let index: HashMap<&str, &WorkflowStep> =
            self.steps.iter().map(|s| (s.step_id.as_str(), s)).collect();
        let mut visited = HashMap::new();
        for step in &self.steps {
            if Self::dfs_cycle(&index, step.step_id.as_str(), &mut visited) {
                return Some(step.step_id.as_str());
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        index: &HashMap<&'a str, &'a WorkflowStep>,
        id: &'a str,
        visited: &mut HashMap<&'a str, u8>,
    ) -> bool {
        match visited.get(id) {
            Some(1) => return true,  // back edge
            Some(2) => return false, // done
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(step) = index.get(id) {
            for dep in &step.depends_on {
                if Self::dfs_cycle(index, dep.as_str(), visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }

    /// Steps whose dependencies are satisfied and that have not been
    /// attempted, ordered by `(step_order, step_id)`.
    pub fn ready_steps(
        &self,
        completed: &HashSet<&str>,
        attempted: &HashSet<&str>,
    ) -> Vec<&WorkflowStep> {
        let mut ready: Vec<&WorkflowStep> = self
            .steps
            .iter()
            .filter(|s| !attempted.contains(s.step_id.as_str()))
            .filter(|s| !completed.contains(s.step_id.as_str()))
            .filter(|s| s.is_ready(completed))
            .collect();
        ready.sort_by(|a, b| {
            a.step_order
                .cmp(&b.step_order)
                .then_with(|| a.step_id.cmp(&b.step_id))
        });
        ready
    }
}

/// Outcome of one step within an execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Step the outcome is for.
    pub step_id: String,
    /// Strategy the step ran under.
    pub strategy: CoordinationStrategy,
    /// Whether the step succeeded.
    pub succeeded: bool,
    /// Successful agent tasks.
    pub success_count: usize,
    /// Agent tasks dispatched.
    pub total_count: usize,
    /// Errors of failed agent tasks.
    pub errors: Vec<String>,
    /// Step wall time.
    pub duration_ms: u64,
}

/// Persistent record of a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique id of the execution.
    pub execution_id: Uuid,
    /// Workflow executed.
    pub workflow_id: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Set once the execution reaches a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Outcomes keyed by step id.
    pub step_outcomes: BTreeMap<String, StepOutcome>,
    /// Step results keyed by step id.
    pub output: serde_json::Value,
    /// Error that stopped the execution.
    pub error: Option<String>,
}

impl WorkflowExecution {
    /// Pending record started now.
    pub fn new(execution_id: Uuid, workflow_id: impl Into<String>) -> Self {
        Self {
            execution_id,
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            step_outcomes: BTreeMap::new(),
            output: serde_json::Value::Null,
            error: None,
        }
    }

    /// True if the execution completed.
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Source of workflow definitions and sink for execution records.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Look up a definition.
    async fn get(&self, workflow_id: &str) -> ConductorResult<Option<WorkflowDefinition>>;
    /// Store a new execution record.
    async fn create_execution(&self, record: &WorkflowExecution) -> ConductorResult<()>;
    /// Replace an execution record.
    async fn update_execution(&self, record: &WorkflowExecution) -> ConductorResult<()>;
    /// Look up an execution record.
    async fn get_execution(&self, execution_id: Uuid)
        -> ConductorResult<Option<WorkflowExecution>>;
}

/// In-memory repository.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
    executions: RwLock<HashMap<Uuid, WorkflowExecution>>,
}

impl InMemoryWorkflowRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a definition, replacing any with the same id.
    pub async fn insert(&self, definition: WorkflowDefinition) -> ConductorResult<()> {
        definition.validate()?;
        self.definitions
            .write()
            .await
            .insert(definition.workflow_id.clone(), definition);
        Ok(())
    }

    /// Number of stored execution records.
    pub async fn execution_count(&self) -> usize {
        self.executions.read().await.len()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn get(&self, workflow_id: &str) -> ConductorResult<Option<WorkflowDefinition>> {
        Ok(self.definitions.read().await.get(workflow_id).cloned())
    }

    async fn create_execution(&self, record: &WorkflowExecution) -> ConductorResult<()> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&record.execution_id) {
            return Err(ConductorError::Store(format!(
                "execution {} already exists",
                record.execution_id
            )));
        }
        executions.insert(record.execution_id, record.clone());
        Ok(())
    }

    async fn update_execution(&self, record: &WorkflowExecution) -> ConductorResult<()> {
        self.executions
            .write()
            .await
            .insert(record.execution_id, record.clone());
        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> ConductorResult<Option<WorkflowExecution>> {
        Ok(self.executions.read().await.get(&execution_id).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn chain() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "release",
            vec![
                WorkflowStep::new("spec"),
                WorkflowStep::new("code").with_dependencies(vec!["spec"]),
                WorkflowStep::new("test").with_dependencies(vec!["code"]),
                WorkflowStep::new("review").with_dependencies(vec!["code", "test"]),
            ],
        )
    }

    #[test]
    fn test_valid_chain() {
        assert!(chain().validate().is_ok());
        assert!(chain().find_cycle().is_none());
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let err = WorkflowDefinition::new("empty", vec![]).validate().unwrap_err();
        assert!(matches!(err, ConductorError::WorkflowExecution(_)));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let def = WorkflowDefinition::new(
            "dup",
            vec![WorkflowStep::new("a"), WorkflowStep::new("a")],
        );
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let def = WorkflowDefinition::new(
            "dangling",
            vec![WorkflowStep::new("a").with_dependencies(vec!["ghost"])],
        );
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_cycle_detection() {
        let def = WorkflowDefinition::new(
            "cyclic",
            vec![
                WorkflowStep::new("a").with_dependencies(vec!["b"]),
                WorkflowStep::new("b").with_dependencies(vec!["a"]),
            ],
        );
        assert!(def.find_cycle().is_some());
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_ready_steps_follow_dependencies() {
        let def = chain();
        let mut completed = HashSet::new();
        let attempted = HashSet::new();

        let ready: Vec<&str> = def
            .ready_steps(&completed, &attempted)
            .iter()
            .map(|s| s.step_id.as_str())
            .collect();
        assert_eq!(ready, vec!["spec"]);

        completed.insert("spec");
        completed.insert("code");
        let ready: Vec<&str> = def
            .ready_steps(&completed, &attempted)
            .iter()
            .map(|s| s.step_id.as_str())
            .collect();
        assert_eq!(ready, vec!["test"]);
    }

    #[test]
    fn test_ready_steps_tie_break_by_order() {
        let def = WorkflowDefinition::new(
            "fan",
            vec![
                WorkflowStep::new("c").with_order(3),
                WorkflowStep::new("a").with_order(2),
                WorkflowStep::new("b").with_order(1),
                WorkflowStep::new("d").with_order(1),
            ],
        );
        let ready: Vec<&str> = def
            .ready_steps(&HashSet::new(), &HashSet::new())
            .iter()
            .map(|s| s.step_id.as_str())
            .collect();
        assert_eq!(ready, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_ready_steps_skip_attempted() {
        let def = chain();
        let attempted: HashSet<&str> = ["spec"].into_iter().collect();
        assert!(def.ready_steps(&HashSet::new(), &attempted).is_empty());
    }

    #[test]
    fn test_from_toml() {
        let raw = r#"
workflow_id = "ci"
default_strategy = "sequential"

[[steps]]
step_id = "build"
step_order = 1
task_type = "compile"

[steps.agent_requirements]
capabilities = ["build"]
count = 2

[[steps]]
step_id = "deploy"
depends_on = ["build"]
strategy = "pipeline"
"#;
        let def = WorkflowDefinition::from_toml_str(raw).unwrap();
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.default_strategy, Some(CoordinationStrategy::Sequential));
        let build = def.step("build").unwrap();
        assert_eq!(build.agent_requirements.count, 2);
        assert_eq!(
            def.strategy_for(build, CoordinationStrategy::Parallel),
            CoordinationStrategy::Sequential
        );
        let deploy = def.step("deploy").unwrap();
        assert_eq!(
            def.strategy_for(deploy, CoordinationStrategy::Parallel),
            CoordinationStrategy::Pipeline
        );

        let unset = WorkflowDefinition::new("x", vec![WorkflowStep::new("a")]);
        assert_eq!(
            unset.strategy_for(&unset.steps[0], CoordinationStrategy::ScatterGather),
            CoordinationStrategy::ScatterGather
        );
    }

    #[test]
    fn test_from_toml_rejects_cycle() {
        let raw = r#"
workflow_id = "bad"

[[steps]]
step_id = "a"
depends_on = ["b"]

[[steps]]
step_id = "b"
depends_on = ["a"]
"#;
        assert!(WorkflowDefinition::from_toml_str(raw).is_err());
    }

    #[tokio::test]
    async fn test_repository_roundtrip() {
        let repo = InMemoryWorkflowRepository::new();
        repo.insert(chain()).await.unwrap();
        assert!(repo.get("release").await.unwrap().is_some());
        assert!(repo.get("missing").await.unwrap().is_none());

        let mut record = WorkflowExecution::new(Uuid::new_v4(), "release");
        repo.create_execution(&record).await.unwrap();
        assert!(repo.create_execution(&record).await.is_err());

        record.status = ExecutionStatus::Completed;
        repo.update_execution(&record).await.unwrap();
        let stored = repo.get_execution(record.execution_id).await.unwrap().unwrap();
        assert!(stored.is_success());
        assert_eq!(repo.execution_count().await, 1);
    }
}
