use crate::agent::{AgentDescriptor, AgentRegistry};
use crate::coordinator::{CoordinatorConfig, MultiAgentCoordinator};
use crate::engine::{EngineConfig, WorkflowEngine};
use crate::monitor::{MonitorConfig, PerformanceMonitor};
use crate::state::{StateManagerConfig, WorkflowStateManager};
use crate::store::CheckpointStore;
use crate::workflow::WorkflowRepository;
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Top-level configuration file (`conductor.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Engine limits.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Agent dispatch settings.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Checkpoint settings.
    #[serde(default)]
    pub state: StateManagerConfig,
    /// Performance monitor settings.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Log format and filter.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Agents to register at startup.
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
}

impl ConductorConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> ConductorResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Reject zero limits, duplicate agents and out-of-range capability scores.
    pub fn validate(&self) -> ConductorResult<()> {
        let limits = [
            ("engine.max_concurrent_workflows", self.engine.max_concurrent_workflows as u64),
            ("coordinator.max_concurrent_agents", self.coordinator.max_concurrent_agents as u64),
            ("coordinator.retry.max_attempts", u64::from(self.coordinator.retry.max_attempts)),
            (
                "state.max_checkpoints_per_execution",
                self.state.max_checkpoints_per_execution as u64,
            ),
            ("monitor.monitoring_interval_ms", self.monitor.monitoring_interval_ms),
            ("monitor.max_samples_per_metric", self.monitor.max_samples_per_metric as u64),
            ("monitor.event_capacity", self.monitor.event_capacity as u64),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(ConductorError::Config(format!("{name} must be greater than 0")));
            }
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.agent_id.trim().is_empty() {
                return Err(ConductorError::Config("agent_id must not be empty".to_string()));
            }
            if !seen.insert(agent.agent_id.as_str()) {
                return Err(ConductorError::Config(format!(
                    "agent '{}' is declared twice",
                    agent.agent_id
                )));
            }
            if agent.max_concurrent_tasks == 0 {
                return Err(ConductorError::Config(format!(
                    "agent '{}' needs max_concurrent_tasks > 0",
                    agent.agent_id
                )));
            }
            if let Some((cap, score)) = agent
                .capabilities
                .iter()
                .find(|(_, s)| !(0.0..=1.0).contains(*s))
            {
                return Err(ConductorError::Config(format!(
                    "agent '{}' capability '{cap}' score {score} is outside [0, 1]",
                    agent.agent_id
                )));
            }
        }
        Ok(())
    }

    /// Assemble an engine whose components follow this configuration.
    pub fn build_engine(
        &self,
        repository: Arc<dyn WorkflowRepository>,
        registry: Arc<dyn AgentRegistry>,
        store: Option<Arc<dyn CheckpointStore>>,
    ) -> WorkflowEngine {
        let monitor = Arc::new(PerformanceMonitor::new(self.monitor.clone()));
        let coordinator = Arc::new(
            MultiAgentCoordinator::new(self.coordinator.clone(), registry)
                .with_monitor(Arc::clone(&monitor)),
        );
        let mut state = WorkflowStateManager::new(self.state.clone());
        if let Some(store) = store {
            state = state.with_store(store);
        }
        WorkflowEngine::with_components(
            self.engine.clone(),
            repository,
            coordinator,
            Arc::new(state),
            monitor,
        )
    }
}
