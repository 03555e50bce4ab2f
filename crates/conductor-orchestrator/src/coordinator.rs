use crate::agent::{AgentHandle, AgentRegistry};
use crate::context::ExecutionContext;
use crate::monitor::{
    PerformanceMonitor, TASK_COMPLETED_METRIC, TASK_DURATION_METRIC, TASK_FAILED_METRIC,
};
use crate::types::{AgentTask, CoordinationStrategy, RetryConfig};
use crate::workflow::WorkflowStep;
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Limits applied to every agent task the coordinator dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Agent tasks allowed in flight across all steps and executions.
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,
    /// Per-attempt deadline. `0` disables it.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Used when a step does not carry its own retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_max_concurrent_agents() -> usize {
    8
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: default_max_concurrent_agents(),
            task_timeout_ms: default_task_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

/// A successful agent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    /// Agent that produced the result.
    pub agent_id: String,
    /// Task the result belongs to.
    pub task_id: Uuid,
    /// Value returned by the executor.
    pub result: Value,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Wall time from the first attempt to completion.
    pub duration_ms: Option<u64>,
    /// Scatter chunk this output belongs to.
    pub chunk_index: Option<usize>,
}

/// An agent task that exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFailure {
    /// Agent whose task failed.
    pub agent_id: String,
    /// Task that failed.
    pub task_id: Uuid,
    /// Error of the last attempt.
    pub error: String,
    /// Attempts used before giving up.
    pub attempts: u32,
    /// Scatter chunk the task was handling.
    pub chunk_index: Option<usize>,
}

/// Combined outcome of one step across all selected agents.
///
/// Individual agent failures are reported here, never as an `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    /// Step the agents ran for.
    pub step_id: String,
    /// Strategy the step ran under.
    pub strategy: CoordinationStrategy,
    /// Successful tasks, in dispatch order.
    pub results: Vec<AgentOutput>,
    /// Tasks that exhausted their retries.
    pub errors: Vec<AgentFailure>,
    /// Number of successful tasks.
    pub success_count: usize,
    /// Number of tasks the step planned to run.
    pub total_count: usize,
    /// Agent ids in the order they were dispatched (SEQUENTIAL and PIPELINE).
    pub execution_order: Vec<String>,
    /// Agents never run because an earlier stage failed.
    pub skipped_agents: Vec<String>,
    /// Accumulated payload after each PIPELINE stage.
    pub pipeline_stages: Vec<Value>,
    /// Strategy-specific combined output recorded as the step result.
    pub output: Value,
    /// Set when SEQUENTIAL or PIPELINE stopped early.
    pub aborted: bool,
}

impl AggregatedResult {
    fn new(step_id: &str, strategy: CoordinationStrategy, total_count: usize) -> Self {
        Self {
            step_id: step_id.to_string(),
            strategy,
            results: Vec::new(),
            errors: Vec::new(),
            success_count: 0,
            total_count,
            execution_order: Vec::new(),
            skipped_agents: Vec::new(),
            pipeline_stages: Vec::new(),
            output: Value::Null,
            aborted: false,
        }
    }

    fn push(&mut self, outcome: Result<AgentOutput, AgentFailure>) {
        match outcome {
            Ok(output) => {
                self.success_count += 1;
                self.results.push(output);
            }
            Err(failure) => self.errors.push(failure),
        }
    }

    /// A step succeeds when it ran to the end and at least one agent succeeded.
    pub fn is_step_success(&self) -> bool {
        !self.aborted && self.success_count > 0
    }

    /// Result of one agent, if it succeeded.
    pub fn result_for(&self, agent_id: &str) -> Option<&Value> {
        self.results
            .iter()
            .find(|r| r.agent_id == agent_id)
            .map(|r| &r.result)
    }
}

/// Split `input` into `parts` chunks for scatter-gather.
///
/// Arrays and objects (by sorted key) are cut into contiguous chunks whose
/// sizes differ by at most one, the larger chunks first. Scalars are
/// replicated to every part.
pub fn partition_input(input: &Value, parts: usize) -> Vec<Value> {
    let parts = parts.max(1);
    match input {
        Value::Array(items) => {
            let mut chunks = Vec::with_capacity(parts);
            let mut start = 0;
            for size in chunk_sizes(items.len(), parts) {
                chunks.push(Value::Array(items[start..start + size].to_vec()));
                start += size;
            }
            chunks
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut chunks = Vec::with_capacity(parts);
            let mut start = 0;
            for size in chunk_sizes(keys.len(), parts) {
                let chunk: Map<String, Value> = keys[start..start + size]
                    .iter()
                    .filter_map(|k| map.get(*k).map(|v| ((*k).clone(), v.clone())))
                    .collect();
                chunks.push(Value::Object(chunk));
                start += size;
            }
            chunks
        }
        scalar => vec![scalar.clone(); parts],
    }
}

fn chunk_sizes(len: usize, parts: usize) -> Vec<usize> {
    let base = len / parts;
    let remainder = len % parts;
    (0..parts).map(|i| base + usize::from(i < remainder)).collect()
}

/// Runs one agent task to completion under its retry policy.
#[derive(Clone)]
struct TaskRunner {
    permits: Arc<Semaphore>,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl TaskRunner {
    /// Run the task on its own tokio task. Dropping the handle detaches it,
    /// so a cancelled caller does not abort work already handed out.
    fn spawn(
        &self,
        agent: AgentHandle,
        task: AgentTask,
        chunk_index: Option<usize>,
    ) -> JoinHandle<Result<AgentOutput, AgentFailure>> {
        let runner = self.clone();
        tokio::spawn(async move { runner.run(agent, task, chunk_index).await })
    }

    async fn run(
        &self,
        agent: AgentHandle,
        mut task: AgentTask,
        chunk_index: Option<usize>,
    ) -> Result<AgentOutput, AgentFailure> {
        let started = Instant::now();

        while task.begin_attempt() {
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    task.fail("agent admission closed");
                    break;
                }
            };
            let outcome = {
                let _load = agent.acquire_load();
                let call = agent.executor().execute(&task);
                match task.timeout_ms {
                    Some(ms) => tokio::time::timeout(Duration::from_millis(ms), call)
                        .await
                        .unwrap_or(Err(ConductorError::Timeout(ms))),
                    None => call.await,
                }
            };
            drop(permit);

            match outcome {
                Ok(result) => {
                    task.complete(result);
                    break;
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    task.fail(e.to_string());
                    if !retryable || !task.can_retry() {
                        break;
                    }
                    let delay = task.retry_config.backoff_for(task.attempts);
                    warn!(
                        agent_id = %task.agent_id,
                        step_id = %task.step_id,
                        attempt = task.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Agent task failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        if let Some(monitor) = &self.monitor {
            monitor.record_duration(TASK_DURATION_METRIC, started.elapsed());
        }

        match task.result.take() {
            Some(result) if task.error.is_none() => {
                if let Some(monitor) = &self.monitor {
                    monitor.increment(TASK_COMPLETED_METRIC);
                }
                debug!(
                    agent_id = %task.agent_id,
                    step_id = %task.step_id,
                    attempts = task.attempts,
                    "Agent task completed"
                );
                Ok(AgentOutput {
                    duration_ms: task.duration_ms(),
                    agent_id: task.agent_id,
                    task_id: task.task_id,
                    result,
                    attempts: task.attempts,
                    chunk_index,
                })
            }
            _ => {
                if let Some(monitor) = &self.monitor {
                    monitor.increment(TASK_FAILED_METRIC);
                }
                let error = task
                    .error
                    .unwrap_or_else(|| "retry budget exhausted".to_string());
                warn!(
                    agent_id = %task.agent_id,
                    step_id = %task.step_id,
                    attempts = task.attempts,
                    error = %error,
                    "Agent task failed permanently"
                );
                Err(AgentFailure {
                    agent_id: task.agent_id,
                    task_id: task.task_id,
                    error,
                    attempts: task.attempts,
                    chunk_index,
                })
            }
        }
    }
}

/// Dispatches a step's work across the agents selected for it.
pub struct MultiAgentCoordinator {
    config: CoordinatorConfig,
    registry: Arc<dyn AgentRegistry>,
    runner: TaskRunner,
}

impl MultiAgentCoordinator {
    /// Coordinator over `registry` with its own task permit pool.
    pub fn new(config: CoordinatorConfig, registry: Arc<dyn AgentRegistry>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_agents.max(1)));
        Self {
            config,
            registry,
            runner: TaskRunner {
                permits,
                monitor: None,
            },
        }
    }

    /// Record task metrics into `monitor`.
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.runner.monitor = Some(monitor);
        self
    }

    /// Current configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Agent registry used for selection.
    pub fn registry(&self) -> &Arc<dyn AgentRegistry> {
        &self.registry
    }

    /// Agent task slots currently free.
    pub fn available_permits(&self) -> usize {
        self.runner.permits.available_permits()
    }

    /// Select agents for `step` and run it under `strategy`.
    ///
    /// Fails with [`ConductorError::Coordination`] when fewer agents than the
    /// step's quorum are available. Agent failures are reported in the
    /// returned [`AggregatedResult`].
    pub async fn execute_multi_agent_step(
        &self,
        step: &WorkflowStep,
        context: &ExecutionContext,
        strategy: CoordinationStrategy,
    ) -> ConductorResult<AggregatedResult> {
        let requirements = &step.agent_requirements;
        let agents = self.registry.select_agents(requirements);
        let quorum = requirements.quorum();
        if agents.len() < quorum {
            return Err(ConductorError::Coordination(format!(
                "step '{}' needs at least {} agent(s) with {:?}, {} available",
                step.step_id,
                quorum,
                requirements.capabilities,
                agents.len()
            )));
        }

        info!(
            execution_id = %context.execution_id,
            step_id = %step.step_id,
            strategy = %strategy,
            agents = agents.len(),
            "Coordinating step"
        );

        let input = step
            .input
            .clone()
            .unwrap_or_else(|| context.input_data.clone());

        let aggregated = match strategy {
            CoordinationStrategy::Parallel => self.run_parallel(step, context, agents, input).await,
            CoordinationStrategy::Sequential => {
                self.run_sequential(step, context, agents, input).await
            }
            CoordinationStrategy::Pipeline => self.run_pipeline(step, context, agents, input).await,
            CoordinationStrategy::ScatterGather => {
                self.run_scatter_gather(step, context, agents, input).await
            }
        };

        info!(
            execution_id = %context.execution_id,
            step_id = %step.step_id,
            success = aggregated.success_count,
            total = aggregated.total_count,
            aborted = aggregated.aborted,
            "Step coordination finished"
        );
        Ok(aggregated)
    }

    fn build_task(
        &self,
        step: &WorkflowStep,
        context: &ExecutionContext,
        agent: &AgentHandle,
        input: Value,
    ) -> AgentTask {
        let mut config = match &step.config {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("step_config".into(), other.clone());
                map
            }
        };
        let dependencies: Map<String, Value> = step
            .depends_on
            .iter()
            .filter_map(|dep| {
                context
                    .step_results
                    .get(dep)
                    .map(|r| (dep.clone(), r.clone()))
            })
            .collect();
        config.insert("execution_id".into(), json!(context.execution_id));
        config.insert("workflow_id".into(), json!(context.workflow_id));
        config.insert("variables".into(), json!(context.variables));
        config.insert("dependencies".into(), Value::Object(dependencies));

        let timeout_ms = match self.config.task_timeout_ms {
            0 => None,
            ms => Some(ms),
        };

        AgentTask::new(
            agent.agent_id(),
            step.step_id.clone(),
            step.task_type.clone(),
            input,
        )
        .with_config(Value::Object(config))
        .with_priority(step.priority)
        .with_retry(step.retry.clone().unwrap_or_else(|| self.config.retry.clone()))
        .with_timeout_ms(timeout_ms)
    }

    /// Dispatch one task and wait for it.
    async fn dispatch(
        &self,
        agent: AgentHandle,
        task: AgentTask,
        chunk_index: Option<usize>,
    ) -> Result<AgentOutput, AgentFailure> {
        let aborted = aborted_failure(&task, chunk_index);
        join_outcome(self.runner.spawn(agent, task, chunk_index), aborted).await
    }

    /// Dispatch every unit at once and collect outcomes in unit order.
    async fn fan_out(
        &self,
        units: Vec<(AgentHandle, AgentTask, Option<usize>)>,
    ) -> Vec<(usize, Result<AgentOutput, AgentFailure>)> {
        let handles: Vec<_> = units
            .into_iter()
            .map(|(agent, task, chunk_index)| {
                let aborted = aborted_failure(&task, chunk_index);
                (self.runner.spawn(agent, task, chunk_index), aborted)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (index, (handle, aborted)) in handles.into_iter().enumerate() {
            outcomes.push((index, join_outcome(handle, aborted).await));
        }
        outcomes
    }

    async fn run_parallel(
        &self,
        step: &WorkflowStep,
        context: &ExecutionContext,
        agents: Vec<AgentHandle>,
        input: Value,
    ) -> AggregatedResult {
        let mut aggregated =
            AggregatedResult::new(&step.step_id, CoordinationStrategy::Parallel, agents.len());
        let units = agents
            .iter()
            .map(|agent| {
                let task = self.build_task(step, context, agent, input.clone());
                (agent.clone(), task, None)
            })
            .collect();

        for (_, outcome) in self.fan_out(units).await {
            aggregated.push(outcome);
        }
        aggregated.output = Value::Object(
            aggregated
                .results
                .iter()
                .map(|r| (r.agent_id.clone(), r.result.clone()))
                .collect(),
        );
        aggregated
    }

    async fn run_sequential(
        &self,
        step: &WorkflowStep,
        context: &ExecutionContext,
        agents: Vec<AgentHandle>,
        input: Value,
    ) -> AggregatedResult {
        let mut aggregated =
            AggregatedResult::new(&step.step_id, CoordinationStrategy::Sequential, agents.len());
        let mut previous = Value::Null;

        for (position, agent) in agents.iter().enumerate() {
            let payload = json!({ "input": input, "previous": previous });
            let task = self.build_task(step, context, agent, payload);
            aggregated.execution_order.push(agent.agent_id().to_string());

            let outcome = self.dispatch(agent.clone(), task, None).await;
            let failed = outcome.is_err();
            if let Ok(output) = &outcome {
                previous = output.result.clone();
            }
            aggregated.push(outcome);

            if failed && !step.continue_on_error {
                aggregated.skipped_agents = agents[position + 1..]
                    .iter()
                    .map(|a| a.agent_id().to_string())
                    .collect();
                aggregated.aborted = true;
                break;
            }
        }

        aggregated.output = Value::Object(
            aggregated
                .results
                .iter()
                .map(|r| (r.agent_id.clone(), r.result.clone()))
                .collect(),
        );
        aggregated
    }

    async fn run_pipeline(
        &self,
        step: &WorkflowStep,
        context: &ExecutionContext,
        agents: Vec<AgentHandle>,
        input: Value,
    ) -> AggregatedResult {
        let mut aggregated =
            AggregatedResult::new(&step.step_id, CoordinationStrategy::Pipeline, agents.len());
        let mut payload = match input {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("input".into(), other);
                map
            }
        };

        for (position, agent) in agents.iter().enumerate() {
            let task = self.build_task(step, context, agent, Value::Object(payload.clone()));
            aggregated.execution_order.push(agent.agent_id().to_string());

            let outcome = self.dispatch(agent.clone(), task, None).await;
            match &outcome {
                Ok(output) => {
                    match &output.result {
                        Value::Object(fields) => {
                            for (key, value) in fields {
                                payload.insert(key.clone(), value.clone());
                            }
                        }
                        other => {
                            payload.insert(agent.agent_id().to_string(), other.clone());
                        }
                    }
                    aggregated.pipeline_stages.push(Value::Object(payload.clone()));
                }
                Err(_) if !step.continue_on_error => {
                    aggregated.skipped_agents = agents[position + 1..]
                        .iter()
                        .map(|a| a.agent_id().to_string())
                        .collect();
                    aggregated.aborted = true;
                }
                Err(_) => {}
            }
            aggregated.push(outcome);
            if aggregated.aborted {
                break;
            }
        }

        aggregated.output = Value::Object(payload);
        aggregated
    }

    async fn run_scatter_gather(
        &self,
        step: &WorkflowStep,
        context: &ExecutionContext,
        agents: Vec<AgentHandle>,
        input: Value,
    ) -> AggregatedResult {
        let mut aggregated = AggregatedResult::new(
            &step.step_id,
            CoordinationStrategy::ScatterGather,
            agents.len(),
        );
        let chunks = partition_input(&input, agents.len());
        let units = agents
            .iter()
            .zip(chunks)
            .enumerate()
            .map(|(index, (agent, chunk))| {
                let mut task = self.build_task(step, context, agent, chunk);
                if let Value::Object(config) = &mut task.config {
                    config.insert("chunk_index".into(), json!(index));
                    config.insert("chunk_count".into(), json!(agents.len()));
                }
                (agent.clone(), task, Some(index))
            })
            .collect();

        for (_, outcome) in self.fan_out(units).await {
            aggregated.push(outcome);
        }

        let mut combined = Vec::new();
        for fragment in &aggregated.results {
            match &fragment.result {
                Value::Array(items) => combined.extend(items.iter().cloned()),
                other => combined.push(other.clone()),
            }
        }
        let failed_chunks: Vec<usize> = aggregated
            .errors
            .iter()
            .filter_map(|f| f.chunk_index)
            .collect();
        aggregated.output = json!({
            "combined_results": combined,
            "failed_chunks": failed_chunks,
        });
        aggregated
    }
}

fn aborted_failure(task: &AgentTask, chunk_index: Option<usize>) -> AgentFailure {
    AgentFailure {
        agent_id: task.agent_id.clone(),
        task_id: task.task_id,
        error: "agent task aborted".to_string(),
        attempts: 0,
        chunk_index,
    }
}

/// A panicked task is reported as an aborted failure.
async fn join_outcome(
    handle: JoinHandle<Result<AgentOutput, AgentFailure>>,
    aborted: AgentFailure,
) -> Result<AgentOutput, AgentFailure> {
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(agent_id = %aborted.agent_id, error = %e, "Agent task join failed");
            Err(aborted)
        }
    }
}
