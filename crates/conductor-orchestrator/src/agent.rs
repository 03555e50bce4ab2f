use crate::types::AgentTask;
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// The single capability every pluggable agent implements.
///
/// Errors are per-task failures; the coordinator decides whether to retry
/// them based on [`ConductorError::is_retryable`] and the task's policy.
#[async_trait]
pub trait AgentTaskExecutor: Send + Sync {
    /// Execute one task and return its result payload.
    async fn execute(&self, task: &AgentTask) -> ConductorResult<serde_json::Value>;
}

/// Static description of an agent registered in a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique id within the pool.
    pub agent_id: String,
    /// Agent variant, e.g. `"github"` or `"research"`.
    pub kind: String,
    /// Declared capabilities with a proficiency score in `[0, 1]`.
    #[serde(default)]
    pub capabilities: BTreeMap<String, f64>,
    /// Tasks this agent accepts at once.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

fn default_max_concurrent_tasks() -> usize {
    4
}

impl AgentDescriptor {
    /// Descriptor with no capabilities and the default task limit.
    pub fn new(agent_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind: kind.into(),
            capabilities: BTreeMap::new(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }

    /// Declare a capability with a score clamped to `[0, 1]`.
    pub fn with_capability(mut self, name: impl Into<String>, score: f64) -> Self {
        self.capabilities.insert(name.into(), score.clamp(0.0, 1.0));
        self
    }

    /// Set the concurrent task limit.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    /// True if every capability in `required` is declared.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains_key(c))
    }
}

/// What a step asks of the agent pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequirements {
    /// Every selected agent must declare all of these.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Number of agents wanted. `0` selects every matching agent.
    #[serde(default = "default_count")]
    pub count: usize,
    /// Minimum number of agents for the step to run at all.
    #[serde(default)]
    pub min_count: Option<usize>,
}

fn default_count() -> usize {
    1
}

impl Default for AgentRequirements {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            count: default_count(),
            min_count: None,
        }
    }
}

impl AgentRequirements {
    /// Require `count` agents that hold all of `capabilities`.
    pub fn new(capabilities: Vec<String>, count: usize) -> Self {
        Self {
            capabilities,
            count,
            min_count: None,
        }
    }

    /// Run the step once at least `min` agents are available.
    pub fn with_min_count(mut self, min: usize) -> Self {
        self.min_count = Some(min);
        self
    }

    /// Quorum below which a coordination strategy refuses to run.
    pub fn quorum(&self) -> usize {
        self.min_count.unwrap_or(1).max(1)
    }
}

/// A registered agent: descriptor, executor and live load counter.
#[derive(Clone)]
pub struct AgentHandle {
    descriptor: Arc<AgentDescriptor>,
    executor: Arc<dyn AgentTaskExecutor>,
    load: Arc<AtomicUsize>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("agent_id", &self.descriptor.agent_id)
            .field("kind", &self.descriptor.kind)
            .field("load", &self.current_load())
            .finish()
    }
}

impl AgentHandle {
    /// Pair a descriptor with the executor that runs its tasks.
    pub fn new(descriptor: AgentDescriptor, executor: Arc<dyn AgentTaskExecutor>) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            executor,
            load: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Id of the wrapped agent.
    pub fn agent_id(&self) -> &str {
        &self.descriptor.agent_id
    }

    /// Static description of the agent.
    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// Executor that runs this agent's tasks.
    pub fn executor(&self) -> &Arc<dyn AgentTaskExecutor> {
        &self.executor
    }

    /// Tasks currently running on this agent.
    pub fn current_load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    /// Count a task against this agent's load until the guard drops.
    pub fn acquire_load(&self) -> LoadGuard {
        self.load.fetch_add(1, Ordering::AcqRel);
        LoadGuard {
            load: Arc::clone(&self.load),
        }
    }

    /// Selection score: mean proficiency in the required capabilities,
    /// scaled by the free share of the agent's task capacity.
    pub fn score(&self, requirements: &AgentRequirements) -> f64 {
        let caps = &self.descriptor.capabilities;
        let proficiency = if requirements.capabilities.is_empty() {
            if caps.is_empty() {
                1.0
            } else {
                caps.values().sum::<f64>() / caps.len() as f64
            }
        } else {
            let total: f64 = requirements
                .capabilities
                .iter()
                .filter_map(|c| caps.get(c))
                .sum();
            total / requirements.capabilities.len() as f64
        };

        let max = self.descriptor.max_concurrent_tasks.max(1) as f64;
        let free = (1.0 - self.current_load() as f64 / max).clamp(0.0, 1.0);
        proficiency * free
    }
}

/// Releases one unit of agent load on drop.
pub struct LoadGuard {
    load: Arc<AtomicUsize>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.load.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The external agent pool consumed by the coordinator.
pub trait AgentRegistry: Send + Sync {
    /// Agents matching `requirements`, best first, at most `requirements.count`
    /// (all matches when the count is zero).
    fn select_agents(&self, requirements: &AgentRequirements) -> Vec<AgentHandle>;

    /// Resolve an agent by id.
    fn get(&self, agent_id: &str) -> Option<AgentHandle>;

    /// Ids of every registered agent.
    fn agent_ids(&self) -> Vec<String>;
}

/// In-process agent registry with load-balanced selection.
#[derive(Debug, Default)]
pub struct AgentPool {
    agents: RwLock<BTreeMap<String, AgentHandle>>,
}

impl AgentPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Ids must be unique within the pool.
    pub fn register(
        &self,
        descriptor: AgentDescriptor,
        executor: Arc<dyn AgentTaskExecutor>,
    ) -> ConductorResult<()> {
        let mut agents = self.agents.write();
        if agents.contains_key(&descriptor.agent_id) {
            return Err(ConductorError::Config(format!(
                "agent '{}' is already registered",
                descriptor.agent_id
            )));
        }
        info!(
            agent_id = %descriptor.agent_id,
            kind = %descriptor.kind,
            capabilities = descriptor.capabilities.len(),
            "Agent registered"
        );
        agents.insert(
            descriptor.agent_id.clone(),
            AgentHandle::new(descriptor, executor),
        );
        Ok(())
    }

    /// Remove an agent. Returns false if it was not registered.
    pub fn unregister(&self, agent_id: &str) -> bool {
        self.agents.write().remove(agent_id).is_some()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    /// True if no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Descriptors of every registered agent.
    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.agents
            .read()
            .values()
            .map(|h| h.descriptor().clone())
            .collect()
    }
}

impl AgentRegistry for AgentPool {
    fn select_agents(&self, requirements: &AgentRequirements) -> Vec<AgentHandle> {
        let agents = self.agents.read();
        let mut candidates: Vec<(f64, &AgentHandle)> = agents
            .values()
            .filter(|h| h.descriptor().has_capabilities(&requirements.capabilities))
            .map(|h| (h.score(requirements), h))
            .collect();

        candidates.sort_by(|(sa, a), (sb, b)| {
            sb.total_cmp(sa).then_with(|| a.agent_id().cmp(b.agent_id()))
        });

        let take = if requirements.count == 0 {
            candidates.len()
        } else {
            requirements.count
        };

        let selected: Vec<AgentHandle> = candidates
            .into_iter()
            .take(take)
            .map(|(_, h)| h.clone())
            .collect();

        debug!(
            capabilities = ?requirements.capabilities,
            wanted = requirements.count,
            selected = selected.len(),
            "Agents selected"
        );
        selected
    }

    fn get(&self, agent_id: &str) -> Option<AgentHandle> {
        self.agents.read().get(agent_id).cloned()
    }

    fn agent_ids(&self) -> Vec<String> {
        self.agents.read().keys().cloned().collect()
    }
}
