use crate::agent::AgentRegistry;
use crate::checkpoint::{CheckpointLevel, CheckpointTrigger, StateCheckpoint};
use crate::context::{ExecutionContext, ExecutionPhase, ExecutionStatus};
use crate::coordinator::{AggregatedResult, CoordinatorConfig, MultiAgentCoordinator};
use crate::monitor::{
    MonitorConfig, PerformanceMonitor, WORKFLOW_COMPLETED_METRIC, WORKFLOW_FAILED_METRIC,
};
use crate::state::{StateManagerConfig, WorkflowStateManager};
use crate::store::CheckpointStore;
use crate::types::CoordinationStrategy;
use crate::workflow::{
    StepOutcome, WorkflowDefinition, WorkflowExecution, WorkflowRepository, WorkflowStep,
};
use chrono::Utc;
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Admission and timing limits of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Executions allowed to run at once.
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,
    /// Applied to steps without their own `timeout_ms`. `0` disables it.
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    /// How long shutdown waits for running executions.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Strategy for workflows that set no default of their own.
    #[serde(default)]
    pub default_strategy: CoordinationStrategy,
}

fn default_max_concurrent_workflows() -> usize {
    4
}

fn default_step_timeout_ms() -> u64 {
    300_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            step_timeout_ms: default_step_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            default_strategy: CoordinationStrategy::default(),
        }
    }
}

/// A workflow running in the background.
pub struct ExecutionHandle {
    /// Id of the running execution.
    pub execution_id: Uuid,
    /// Resolves with the final execution record.
    pub join: JoinHandle<ConductorResult<WorkflowExecution>>,
}

/// What [`WorkflowEngine::shutdown`] found.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Every execution finished or parked within the timeout.
    pub drained: bool,
    /// Executions still running at the deadline that got a final checkpoint.
    pub checkpointed: Vec<Uuid>,
}

#[derive(Clone)]
struct ExecutionSlot {
    execution_id: Uuid,
    context: Arc<RwLock<ExecutionContext>>,
    resumed: Arc<Notify>,
}

enum StepLoopOutcome {
    Completed,
    Failed(String),
    Parked,
}

/// Drives workflow executions step by step through the coordinator.
pub struct WorkflowEngine {
    config: EngineConfig,
    repository: Arc<dyn WorkflowRepository>,
    coordinator: Arc<MultiAgentCoordinator>,
    state: Arc<WorkflowStateManager>,
    monitor: Arc<PerformanceMonitor>,
    admission: Arc<Semaphore>,
    active: SyncRwLock<HashMap<Uuid, ExecutionSlot>>,
    idle: Notify,
    shutting_down: AtomicBool,
    /// Set once the shutdown deadline passes; running executions park at
    /// their next step boundary.
    halted: AtomicBool,
    shutdown_signal: watch::Sender<bool>,
}

impl WorkflowEngine {
    /// Build an engine with default coordinator, state manager and monitor.
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn WorkflowRepository>,
        registry: Arc<dyn AgentRegistry>,
        store: Option<Arc<dyn CheckpointStore>>,
    ) -> Self {
        let monitor = Arc::new(PerformanceMonitor::new(MonitorConfig::default()));
        let coordinator = Arc::new(
            MultiAgentCoordinator::new(CoordinatorConfig::default(), registry)
                .with_monitor(Arc::clone(&monitor)),
        );
        let mut state = WorkflowStateManager::new(StateManagerConfig::default());
        if let Some(store) = store {
            state = state.with_store(store);
        }
        Self::with_components(config, repository, coordinator, Arc::new(state), monitor)
    }

    /// Engine over explicit components.
    pub fn with_components(
        config: EngineConfig,
        repository: Arc<dyn WorkflowRepository>,
        coordinator: Arc<MultiAgentCoordinator>,
        state: Arc<WorkflowStateManager>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        let admission = Arc::new(Semaphore::new(config.max_concurrent_workflows.max(1)));
        let (shutdown_signal, _) = watch::channel(false);
        Self {
            config,
            repository,
            coordinator,
            state,
            monitor,
            admission,
            active: SyncRwLock::new(HashMap::new()),
            idle: Notify::new(),
            shutting_down: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            shutdown_signal,
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Coordinator that dispatches agent tasks.
    pub fn coordinator(&self) -> &Arc<MultiAgentCoordinator> {
        &self.coordinator
    }

    /// Checkpoint manager.
    pub fn state_manager(&self) -> &Arc<WorkflowStateManager> {
        &self.state
    }

    /// Performance monitor.
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Start the monitor's background sampling loop.
    pub fn start_monitoring(&self) -> bool {
        self.monitor.start()
    }

    /// Ids of executions currently registered.
    pub fn active_executions(&self) -> Vec<Uuid> {
        self.active.read().keys().copied().collect()
    }

    /// Current context of an active execution.
    pub async fn execution_context(&self, execution_id: Uuid) -> Option<ExecutionContext> {
        let slot = self.active.read().get(&execution_id).cloned()?;
        let context = slot.context.read().await;
        Some(context.clone())
    }

    /// Run a workflow to completion, failure or a shutdown park.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> ConductorResult<WorkflowExecution> {
        let slot = self.register(ExecutionContext::new(workflow_id, input))?;
        self.run_registered(slot, false).await
    }

    /// Start a workflow in the background.
    ///
    /// The execution is registered before this returns, so it can be
    /// paused right away.
    pub fn submit_workflow(
        self: &Arc<Self>,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> ConductorResult<ExecutionHandle> {
        let slot = self.register(ExecutionContext::new(workflow_id, input))?;
        let execution_id = slot.execution_id;
        let engine = Arc::clone(self);
        let join = tokio::spawn(async move { engine.run_registered(slot, false).await });
        Ok(ExecutionHandle { execution_id, join })
    }

    /// Resume an execution from its newest valid checkpoint.
    ///
    /// Steps recorded as completed in the checkpoint are not re-run. An
    /// execution that was paused when checkpointed stays paused until
    /// [`resume_execution`](Self::resume_execution) is called, so use
    /// [`submit_recovery`](Self::submit_recovery) for those.
    pub async fn recover_execution(
        &self,
        execution_id: Uuid,
    ) -> ConductorResult<WorkflowExecution> {
        let slot = self.prepare_recovery(execution_id).await?;
        self.run_registered(slot, true).await
    }

    /// [`recover_execution`](Self::recover_execution) in the background.
    ///
    /// The execution is registered before this returns, so it can be
    /// resumed right away.
    pub async fn submit_recovery(
        self: &Arc<Self>,
        execution_id: Uuid,
    ) -> ConductorResult<ExecutionHandle> {
        let slot = self.prepare_recovery(execution_id).await?;
        let engine = Arc::clone(self);
        let join = tokio::spawn(async move { engine.run_registered(slot, true).await });
        Ok(ExecutionHandle { execution_id, join })
    }

    /// Stop admitting new steps for an execution. In-flight agent tasks
    /// run to completion.
    pub async fn pause_execution(
        &self,
        execution_id: Uuid,
    ) -> ConductorResult<Option<StateCheckpoint>> {
        let slot = self.slot(execution_id)?;
        let snapshot = {
            let mut context = slot.context.write().await;
            if context.status.is_terminal() {
                return Err(ConductorError::WorkflowExecution(format!(
                    "execution {execution_id} already finished with status {}",
                    context.status
                )));
            }
            context.pause();
            context.clone()
        };
        info!(execution_id = %execution_id, "Execution paused");
        self.checkpoint_if_managed(&snapshot, CheckpointTrigger::Pause)
            .await
    }

    /// Clear the pause flag and let the execution admit steps again.
    pub async fn resume_execution(
        &self,
        execution_id: Uuid,
    ) -> ConductorResult<Option<StateCheckpoint>> {
        let slot = self.slot(execution_id)?;
        let snapshot = {
            let mut context = slot.context.write().await;
            context.resume();
            context.clone()
        };
        slot.resumed.notify_one();
        info!(execution_id = %execution_id, "Execution resumed");
        self.checkpoint_if_managed(&snapshot, CheckpointTrigger::Resume)
            .await
    }

    /// Stop admitting workflows, wait for running ones, checkpoint stragglers
    /// and stop the monitor.
    ///
    /// Paused executions return with status `Paused` and a final
    /// comprehensive checkpoint, ready for [`recover_execution`](Self::recover_execution).
    /// Executions still running at the deadline stop admitting steps; their
    /// in-flight step finishes and they park with a final checkpoint.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown_signal.send_replace(true);
        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        info!(
            active = self.active.read().len(),
            timeout_ms = self.config.shutdown_timeout_ms,
            "Engine shutting down"
        );

        let drained = tokio::time::timeout(timeout, async {
            loop {
                let idle = self.idle.notified();
                if self.active.read().is_empty() {
                    break;
                }
                idle.await;
            }
        })
        .await
        .is_ok();

        let mut report = ShutdownReport {
            drained,
            checkpointed: Vec::new(),
        };
        if !drained {
            self.halted.store(true, Ordering::SeqCst);
            let stragglers: Vec<ExecutionSlot> = self.active.read().values().cloned().collect();
            for slot in stragglers {
                let snapshot = slot.context.read().await.clone();
                match self.checkpoint_if_managed(&snapshot, CheckpointTrigger::Final).await {
                    Ok(Some(_)) => report.checkpointed.push(slot.execution_id),
                    Ok(None) => {}
                    Err(e) => warn!(
                        execution_id = %slot.execution_id,
                        error = %e,
                        "Final checkpoint failed during shutdown"
                    ),
                }
            }
            warn!(
                remaining = report.checkpointed.len(),
                "Shutdown timeout reached with executions still running"
            );
        }

        self.monitor.stop().await;
        info!(drained, "Engine shut down");
        report
    }

    // --- Internals ---

    async fn prepare_recovery(&self, execution_id: Uuid) -> ConductorResult<ExecutionSlot> {
        if self.active.read().contains_key(&execution_id) {
            return Err(ConductorError::WorkflowExecution(format!(
                "execution {execution_id} is still active"
            )));
        }
        let context = self.state.recover_execution(execution_id).await?;
        info!(
            execution_id = %execution_id,
            workflow_id = %context.workflow_id,
            completed_steps = context.completed_count(),
            paused = context.is_paused,
            "Recovering execution"
        );
        self.register(context)
    }

    fn register(&self, context: ExecutionContext) -> ConductorResult<ExecutionSlot> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ConductorError::WorkflowExecution(
                "engine is shutting down".to_string(),
            ));
        }
        let execution_id = context.execution_id;
        let slot = ExecutionSlot {
            execution_id,
            context: Arc::new(RwLock::new(context)),
            resumed: Arc::new(Notify::new()),
        };
        let mut active = self.active.write();
        if active.contains_key(&execution_id) {
            return Err(ConductorError::WorkflowExecution(format!(
                "execution {execution_id} is already active"
            )));
        }
        active.insert(execution_id, slot.clone());
        Ok(slot)
    }

    fn deregister(&self, execution_id: Uuid) {
        let mut active = self.active.write();
        active.remove(&execution_id);
        if active.is_empty() {
            self.idle.notify_waiters();
        }
    }

    fn slot(&self, execution_id: Uuid) -> ConductorResult<ExecutionSlot> {
        self.active
            .read()
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| ConductorError::NotFound(format!("execution {execution_id}")))
    }

    async fn checkpoint_if_managed(
        &self,
        context: &ExecutionContext,
        trigger: CheckpointTrigger,
    ) -> ConductorResult<Option<StateCheckpoint>> {
        if !self.state.is_managing(context.execution_id).await {
            return Ok(None);
        }
        self.state
            .create_checkpoint(context, CheckpointLevel::Comprehensive, trigger)
            .await
            .map(Some)
    }

    async fn load_definition(&self, workflow_id: &str) -> ConductorResult<WorkflowDefinition> {
        let definition = self
            .repository
            .get(workflow_id)
            .await
            .map_err(repository_unavailable)?
            .ok_or_else(|| {
                ConductorError::WorkflowExecution(format!("workflow '{workflow_id}' not found"))
            })?;
        definition.validate()?;
        Ok(definition)
    }

    async fn run_registered(
        &self,
        slot: ExecutionSlot,
        recovered: bool,
    ) -> ConductorResult<WorkflowExecution> {
        let result = self.run(&slot, recovered).await;
        self.deregister(slot.execution_id);
        if let Err(e) = &result {
            error!(execution_id = %slot.execution_id, error = %e, "Workflow execution error");
        }
        result
    }

    async fn run(
        &self,
        slot: &ExecutionSlot,
        recovered: bool,
    ) -> ConductorResult<WorkflowExecution> {
        let (execution_id, workflow_id) = {
            let context = slot.context.read().await;
            (context.execution_id, context.workflow_id.clone())
        };
        let definition = self.load_definition(&workflow_id).await?;

        let existing = if recovered {
            self.repository
                .get_execution(execution_id)
                .await
                .map_err(repository_unavailable)?
        } else {
            None
        };
        let mut record = match existing {
            Some(mut record) => {
                record.completed_at = None;
                record.error = None;
                record
            }
            None => {
                let record = WorkflowExecution::new(execution_id, workflow_id.clone());
                self.repository
                    .create_execution(&record)
                    .await
                    .map_err(repository_unavailable)?;
                record
            }
        };

        let _permit = Arc::clone(&self.admission)
            .acquire_owned()
            .await
            .map_err(|_| ConductorError::WorkflowExecution("admission closed".to_string()))?;

        let snapshot = {
            let mut context = slot.context.write().await;
            let status = if context.is_paused {
                ExecutionStatus::Paused
            } else {
                ExecutionStatus::Running
            };
            context.set_status(status);
            context.set_phase(ExecutionPhase::Execution);
            context.clone()
        };
        record.status = snapshot.status;
        self.state.start_managing_execution(&snapshot).await;
        self.monitor.start_workflow_profiling(&snapshot);

        info!(
            execution_id = %execution_id,
            workflow_id = %workflow_id,
            steps = definition.steps.len(),
            recovered,
            "Workflow execution started"
        );

        let started = Instant::now();
        let outcome = self.run_steps(&definition, slot, &mut record).await;

        let snapshot = {
            let mut context = slot.context.write().await;
            match &outcome {
                StepLoopOutcome::Completed => {
                    context.set_status(ExecutionStatus::Completed);
                    context.set_phase(ExecutionPhase::Completion);
                }
                StepLoopOutcome::Failed(message) => {
                    context.set_status(ExecutionStatus::Failed);
                    context.set_phase(ExecutionPhase::Failed);
                    record.error = Some(message.clone());
                }
                StepLoopOutcome::Parked => {}
            }
            context.clone()
        };

        record.status = snapshot.status;
        record.output = serde_json::to_value(&snapshot.step_results)?;
        if snapshot.status.is_terminal() {
            record.completed_at = Some(Utc::now());
        }

        self.monitor.complete_workflow_profiling(&snapshot);
        match snapshot.status {
            ExecutionStatus::Completed => {
                self.monitor.increment(WORKFLOW_COMPLETED_METRIC);
            }
            ExecutionStatus::Failed => {
                self.monitor.increment(WORKFLOW_FAILED_METRIC);
            }
            _ => {}
        }
        if let Err(e) = self.state.stop_managing_execution(&snapshot, true).await {
            warn!(execution_id = %execution_id, error = %e, "Final checkpoint failed");
        }

        self.repository
            .update_execution(&record)
            .await
            .map_err(repository_unavailable)?;

        info!(
            execution_id = %execution_id,
            status = %record.status,
            duration_ms = started.elapsed().as_millis() as u64,
            completed_steps = snapshot.completed_count(),
            "Workflow execution finished"
        );
        Ok(record)
    }

    async fn run_steps(
        &self,
        definition: &WorkflowDefinition,
        slot: &ExecutionSlot,
        record: &mut WorkflowExecution,
    ) -> StepLoopOutcome {
        let mut attempted: HashSet<String> = HashSet::new();

        loop {
            if !self.wait_while_paused(slot).await {
                info!(execution_id = %slot.execution_id, "Paused execution parked for shutdown");
                return StepLoopOutcome::Parked;
            }
            if self.halted.load(Ordering::SeqCst)
                && slot.context.read().await.completed_count() < definition.steps.len()
            {
                info!(execution_id = %slot.execution_id, "Execution parked at shutdown deadline");
                return StepLoopOutcome::Parked;
            }

            let step = {
                let context = slot.context.read().await;
                if context.completed_count() >= definition.steps.len() {
                    return StepLoopOutcome::Completed;
                }
                let completed: HashSet<&str> =
                    context.completed_steps.keys().map(String::as_str).collect();
                let attempted_ids: HashSet<&str> = attempted.iter().map(String::as_str).collect();
                let ready = definition.ready_steps(&completed, &attempted_ids);
                match ready.first() {
                    Some(step) => (*step).clone(),
                    None => {
                        return StepLoopOutcome::Failed(format!(
                            "no runnable steps left with {} of {} completed",
                            context.completed_count(),
                            definition.steps.len()
                        ))
                    }
                }
            };
            attempted.insert(step.step_id.clone());

            let strategy = definition.strategy_for(&step, self.config.default_strategy);
            let snapshot = slot.context.read().await.clone();
            let started = Instant::now();
            let result = self.run_step(&step, &snapshot, strategy).await;
            let elapsed = started.elapsed();

            match result {
                Ok(aggregated) => {
                    record.step_outcomes.insert(
                        step.step_id.clone(),
                        step_outcome(&aggregated, elapsed),
                    );
                    if !aggregated.is_step_success() {
                        let message = describe_failure(&aggregated);
                        warn!(
                            execution_id = %slot.execution_id,
                            step_id = %step.step_id,
                            reason = %message,
                            "Step failed"
                        );
                        return StepLoopOutcome::Failed(message);
                    }
                    self.complete_step(slot, &step, aggregated.output, elapsed)
                        .await;
                }
                Err(e) => {
                    record.step_outcomes.insert(
                        step.step_id.clone(),
                        StepOutcome {
                            step_id: step.step_id.clone(),
                            strategy,
                            succeeded: false,
                            success_count: 0,
                            total_count: 0,
                            errors: vec![e.to_string()],
                            duration_ms: elapsed.as_millis() as u64,
                        },
                    );
                    warn!(
                        execution_id = %slot.execution_id,
                        step_id = %step.step_id,
                        error = %e,
                        "Step could not be coordinated"
                    );
                    return StepLoopOutcome::Failed(format!("step '{}': {e}", step.step_id));
                }
            }
        }
    }

    async fn run_step(
        &self,
        step: &WorkflowStep,
        context: &ExecutionContext,
        strategy: CoordinationStrategy,
    ) -> ConductorResult<AggregatedResult> {
        let timeout_ms = step.timeout_ms.unwrap_or(self.config.step_timeout_ms);
        let call = self
            .coordinator
            .execute_multi_agent_step(step, context, strategy);
        if timeout_ms == 0 {
            return call.await;
        }
        tokio::time::timeout(Duration::from_millis(timeout_ms), call)
            .await
            .unwrap_or(Err(ConductorError::Timeout(timeout_ms)))
    }

    async fn complete_step(
        &self,
        slot: &ExecutionSlot,
        step: &WorkflowStep,
        output: serde_json::Value,
        elapsed: Duration,
    ) {
        let snapshot = {
            let mut context = slot.context.write().await;
            context.record_step_result(step.step_id.clone(), output);
            context.mark_step_completed(step.step_id.clone(), Some(elapsed));
            context.clone()
        };
        self.monitor.update_workflow_progress(&snapshot);

        info!(
            execution_id = %slot.execution_id,
            step_id = %step.step_id,
            duration_ms = elapsed.as_millis() as u64,
            progress = snapshot.progress,
            "Step completed"
        );

        if step.checkpoint_after {
            let level = self.state.config().default_level;
            if let Err(e) = self
                .state
                .create_checkpoint(&snapshot, level, CheckpointTrigger::StepCompleted)
                .await
            {
                warn!(step_id = %step.step_id, error = %e, "Step checkpoint failed");
            }
        }
        if let Err(e) = self.state.maybe_checkpoint(&snapshot).await {
            warn!(step_id = %step.step_id, error = %e, "Interval checkpoint failed");
        }
    }

    /// Block while the execution is paused. Returns `false` when shutdown
    /// arrives first.
    async fn wait_while_paused(&self, slot: &ExecutionSlot) -> bool {
        loop {
            let mut shutdown = self.shutdown_signal.subscribe();
            if !slot.context.read().await.is_paused {
                return true;
            }
            if self.shutting_down.load(Ordering::SeqCst) {
                return false;
            }
            tokio::select! {
                _ = slot.resumed.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

fn repository_unavailable(e: ConductorError) -> ConductorError {
    ConductorError::WorkflowExecution(format!("repository unavailable: {e}"))
}

fn step_outcome(aggregated: &AggregatedResult, elapsed: Duration) -> StepOutcome {
    StepOutcome {
        step_id: aggregated.step_id.clone(),
        strategy: aggregated.strategy,
        succeeded: aggregated.is_step_success(),
        success_count: aggregated.success_count,
        total_count: aggregated.total_count,
        errors: aggregated
            .errors
            .iter()
            .map(|f| format!("{}: {}", f.agent_id, f.error))
            .collect(),
        duration_ms: elapsed.as_millis() as u64,
    }
}

fn describe_failure(aggregated: &AggregatedResult) -> String {
    let first = aggregated
        .errors
        .first()
        .map(|f| format!(" ({}: {})", f.agent_id, f.error))
        .unwrap_or_default();
    if aggregated.aborted {
        format!(
            "step '{}' aborted after {} of {} agents{first}",
            aggregated.step_id,
            aggregated.execution_order.len(),
            aggregated.total_count
        )
    } else {
        format!(
            "step '{}' failed: no agent succeeded out of {}{first}",
            aggregated.step_id, aggregated.total_count
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::agent::{AgentDescriptor, AgentPool, AgentRequirements, AgentTaskExecutor};
    use crate::sampler::ScriptedSampler;
    use crate::store::InMemoryCheckpointStore;
    use crate::types::{AgentTask, RetryConfig};
    use crate::workflow::InMemoryWorkflowRepository;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct Echo;

    #[async_trait]
    impl AgentTaskExecutor for Echo {
        async fn execute(&self, task: &AgentTask) -> ConductorResult<serde_json::Value> {
            Ok(json!({ "step": task.step_id, "agent": task.agent_id }))
        }
    }

    struct Broken;

    #[async_trait]
    impl AgentTaskExecutor for Broken {
        async fn execute(&self, _task: &AgentTask) -> ConductorResult<serde_json::Value> {
            Err(ConductorError::AgentTask("boom".into()))
        }
    }

    /// Sleeps, then counts the call.
    struct Slow {
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AgentTaskExecutor for Slow {
        async fn execute(&self, task: &AgentTask) -> ConductorResult<serde_json::Value> {
            tokio::time::sleep(self.delay).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(task.step_id))
        }
    }

    struct Harness {
        engine: Arc<WorkflowEngine>,
        repo: Arc<InMemoryWorkflowRepository>,
        pool: Arc<AgentPool>,
        store: Arc<InMemoryCheckpointStore>,
    }

    fn harness(engine_config: EngineConfig) -> Harness {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let pool = Arc::new(AgentPool::new());
        let store = Arc::new(InMemoryCheckpointStore::new());
        let monitor = Arc::new(PerformanceMonitor::with_sampler(
            MonitorConfig::default(),
            Box::new(ScriptedSampler::constant(5.0, 5.0)),
        ));
        let coordinator = Arc::new(
            MultiAgentCoordinator::new(
                CoordinatorConfig {
                    retry: RetryConfig::no_retry(),
                    ..CoordinatorConfig::default()
                },
                pool.clone(),
            )
            .with_monitor(monitor.clone()),
        );
        let state = Arc::new(
            WorkflowStateManager::new(StateManagerConfig {
                checkpoint_interval: 1,
                ..StateManagerConfig::default()
            })
            .with_store(store.clone()),
        );
        let engine = Arc::new(WorkflowEngine::with_components(
            engine_config,
            repo.clone(),
            coordinator,
            state,
            monitor,
        ));
        Harness {
            engine,
            repo,
            pool,
            store,
        }
    }

    /// A fresh engine over the harness's store, repository and agents.
    fn restart(h: &Harness) -> Arc<WorkflowEngine> {
        let coordinator = Arc::new(MultiAgentCoordinator::new(
            CoordinatorConfig::default(),
            h.pool.clone(),
        ));
        let state = Arc::new(WorkflowStateManager::default().with_store(h.store.clone()));
        let monitor = Arc::new(PerformanceMonitor::with_sampler(
            MonitorConfig::default(),
            Box::new(ScriptedSampler::constant(5.0, 5.0)),
        ));
        Arc::new(WorkflowEngine::with_components(
            EngineConfig::default(),
            h.repo.clone(),
            coordinator,
            state,
            monitor,
        ))
    }

    async fn wait_for_status(engine: &WorkflowEngine, id: Uuid, status: ExecutionStatus) {
        for _ in 0..200 {
            if let Some(ctx) = engine.execution_context(id).await {
                if ctx.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("execution {id} never reached {status}");
    }

    fn agent(pool: &AgentPool, id: &str, capability: &str, exec: Arc<dyn AgentTaskExecutor>) {
        pool.register(AgentDescriptor::new(id, "test").with_capability(capability, 0.9), exec)
            .unwrap();
    }

    fn needs(capability: &str) -> AgentRequirements {
        AgentRequirements::new(vec![capability.to_string()], 1)
    }

    fn chain() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "chain",
            vec![
                WorkflowStep::new("fetch").with_requirements(needs("io")),
                WorkflowStep::new("parse")
                    .with_dependencies(vec!["fetch"])
                    .with_requirements(needs("cpu")),
                WorkflowStep::new("store")
                    .with_dependencies(vec!["parse"])
                    .with_requirements(needs("io")),
            ],
        )
    }

    #[tokio::test]
    async fn test_execute_chain() {
        let h = harness(EngineConfig::default());
        agent(&h.pool, "io-1", "io", Arc::new(Echo));
        agent(&h.pool, "cpu-1", "cpu", Arc::new(Echo));
        h.repo.insert(chain()).await.unwrap();

        let record = h.engine.execute_workflow("chain", json!({})).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(record.is_success());
        assert_eq!(record.step_outcomes.len(), 3);
        assert_eq!(record.output["parse"]["cpu-1"]["step"], "parse");

        let stored = h.repo.get_execution(record.execution_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert!(h.engine.active_executions().is_empty());

        let monitor = h.engine.monitor();
        assert_eq!(monitor.counter_total(WORKFLOW_COMPLETED_METRIC), 1.0);
        let stats = monitor.workflow_stats(record.execution_id).unwrap();
        assert_eq!(stats.completed_steps, 3);
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_fatal() {
        let h = harness(EngineConfig::default());
        let err = h
            .engine
            .execute_workflow("missing", json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::WorkflowExecution(_)));
        assert_eq!(h.repo.execution_count().await, 0);
        assert!(h.engine.active_executions().is_empty());
    }

    #[tokio::test]
    async fn test_failing_step_fails_workflow() {
        let h = harness(EngineConfig::default());
        agent(&h.pool, "io-1", "io", Arc::new(Echo));
        agent(&h.pool, "cpu-1", "cpu", Arc::new(Broken));
        h.repo.insert(chain()).await.unwrap();

        let record = h.engine.execute_workflow("chain", json!({})).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("parse"));
        assert!(!record.step_outcomes["parse"].succeeded);
        assert!(!record.step_outcomes.contains_key("store"));
        assert_eq!(h.engine.monitor().counter_total(WORKFLOW_FAILED_METRIC), 1.0);
    }

    #[tokio::test]
    async fn test_missing_agents_fail_workflow() {
        let h = harness(EngineConfig::default());
        agent(&h.pool, "io-1", "io", Arc::new(Echo));
        h.repo.insert(chain()).await.unwrap();

        let record = h.engine.execute_workflow("chain", json!({})).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.unwrap().contains("Coordination"));
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let h = harness(EngineConfig::default());
        let slow = Arc::new(Slow {
            delay: Duration::from_millis(100),
            calls: AtomicU32::new(0),
        });
        agent(&h.pool, "slow", "io", slow.clone());
        h.repo
            .insert(WorkflowDefinition::new(
                "timed",
                vec![WorkflowStep::new("only")
                    .with_requirements(needs("io"))
                    .with_timeout_ms(20)],
            ))
            .await
            .unwrap();

        let record = h.engine.execute_workflow("timed", json!(null)).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.unwrap().contains("Timed out"));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 0);

        // The dispatched agent task is not cancelled with the step.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let h = harness(EngineConfig::default());
        let slow = Arc::new(Slow {
            delay: Duration::from_millis(100),
            calls: AtomicU32::new(0),
        });
        agent(&h.pool, "io-1", "io", slow.clone());
        agent(&h.pool, "cpu-1", "cpu", slow.clone());
        h.repo.insert(chain()).await.unwrap();

        let handle = h.engine.submit_workflow("chain", json!({})).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.engine.pause_execution(handle.execution_id).await.unwrap();

        // The in-flight step finishes; nothing new is admitted.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let ctx = h.engine.execution_context(handle.execution_id).await.unwrap();
        assert!(ctx.is_paused);
        assert_eq!(ctx.status, ExecutionStatus::Paused);
        assert!(ctx.is_step_completed("fetch"));
        assert!(!ctx.is_step_completed("parse"));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);

        h.engine.resume_execution(handle.execution_id).await.unwrap();
        let record = handle.join.await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(slow.calls.load(Ordering::SeqCst), 3);

        let triggers: Vec<CheckpointTrigger> = h
            .store
            .load(handle.execution_id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.trigger)
            .collect();
        assert!(triggers.contains(&CheckpointTrigger::Pause));
        assert!(triggers.contains(&CheckpointTrigger::Resume));
        assert!(triggers.contains(&CheckpointTrigger::Final));
    }

    #[tokio::test]
    async fn test_shutdown_parks_paused_and_recovery_stays_paused() {
        let h = harness(EngineConfig {
            shutdown_timeout_ms: 2_000,
            ..EngineConfig::default()
        });
        let slow = Arc::new(Slow {
            delay: Duration::from_millis(60),
            calls: AtomicU32::new(0),
        });
        agent(&h.pool, "io-1", "io", slow.clone());
        agent(&h.pool, "cpu-1", "cpu", slow.clone());
        h.repo.insert(chain()).await.unwrap();

        let handle = h.engine.submit_workflow("chain", json!({})).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.engine.pause_execution(handle.execution_id).await.unwrap();

        let report = h.engine.shutdown().await;
        assert!(report.drained);
        let parked = handle.join.await.unwrap().unwrap();
        assert_eq!(parked.status, ExecutionStatus::Paused);
        assert!(parked.completed_at.is_none());
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);

        assert!(h
            .engine
            .execute_workflow("chain", json!({}))
            .await
            .is_err());

        // The pause flag survives the restart.
        let restarted = restart(&h);
        let recovery = restarted
            .submit_recovery(handle.execution_id)
            .await
            .unwrap();
        wait_for_status(&restarted, handle.execution_id, ExecutionStatus::Paused).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        let ctx = restarted
            .execution_context(handle.execution_id)
            .await
            .unwrap();
        assert!(ctx.is_paused);
        assert!(ctx.is_step_completed("fetch"));

        restarted
            .resume_execution(handle.execution_id)
            .await
            .unwrap();
        let record = recovery.join.await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        // "fetch" is not re-run.
        assert_eq!(slow.calls.load(Ordering::SeqCst), 3);
        assert_eq!(record.output["fetch"]["io-1"], "fetch");
    }

    #[tokio::test]
    async fn test_shutdown_deadline_parks_running_execution() {
        let h = harness(EngineConfig {
            shutdown_timeout_ms: 20,
            ..EngineConfig::default()
        });
        let slow = Arc::new(Slow {
            delay: Duration::from_millis(50),
            calls: AtomicU32::new(0),
        });
        agent(&h.pool, "io-1", "io", slow.clone());
        agent(&h.pool, "cpu-1", "cpu", slow.clone());
        h.repo.insert(chain()).await.unwrap();

        let handle = h.engine.submit_workflow("chain", json!({})).unwrap();
        let report = h.engine.shutdown().await;
        assert!(!report.drained);
        assert_eq!(report.checkpointed, vec![handle.execution_id]);

        // Only the step in flight at the deadline finishes.
        let parked = handle.join.await.unwrap().unwrap();
        assert_eq!(parked.status, ExecutionStatus::Running);
        assert!(parked.completed_at.is_none());
        assert!(!parked.step_outcomes.contains_key("parse"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        let calls_after_park = slow.calls.load(Ordering::SeqCst);
        assert!(calls_after_park <= 1);

        let latest = h
            .store
            .load(handle.execution_id)
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(latest.trigger, CheckpointTrigger::Final);
        assert_eq!(
            latest.restore_context().completed_count() as u32,
            calls_after_park
        );

        let record = restart(&h)
            .recover_execution(handle.execution_id)
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(slow.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_pause_unknown_execution() {
        let h = harness(EngineConfig::default());
        let err = h.engine.pause_execution(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ConductorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_interval_checkpoints_per_step() {
        let h = harness(EngineConfig::default());
        agent(&h.pool, "io-1", "io", Arc::new(Echo));
        agent(&h.pool, "cpu-1", "cpu", Arc::new(Echo));
        h.repo.insert(chain()).await.unwrap();

        let record = h.engine.execute_workflow("chain", json!({})).await.unwrap();
        let stored = h.store.load(record.execution_id).await.unwrap();
        let intervals = stored
            .iter()
            .filter(|c| c.trigger == CheckpointTrigger::Interval)
            .count();
        assert_eq!(intervals, 3);
        assert!(stored.iter().all(|c| c.validate_integrity()));
    }

    #[tokio::test]
    async fn test_workflow_admission_bounded() {
        let h = harness(EngineConfig {
            max_concurrent_workflows: 1,
            ..EngineConfig::default()
        });
        let slow = Arc::new(Slow {
            delay: Duration::from_millis(50),
            calls: AtomicU32::new(0),
        });
        agent(&h.pool, "io-1", "io", slow.clone());
        h.repo
            .insert(WorkflowDefinition::new(
                "one",
                vec![WorkflowStep::new("only").with_requirements(needs("io"))],
            ))
            .await
            .unwrap();

        let started = Instant::now();
        let a = h.engine.submit_workflow("one", json!(1)).unwrap();
        let b = h.engine.submit_workflow("one", json!(2)).unwrap();
        assert_eq!(h.engine.active_executions().len(), 2);
        assert!(a.join.await.unwrap().unwrap().is_success());
        assert!(b.join.await.unwrap().unwrap().is_success());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
