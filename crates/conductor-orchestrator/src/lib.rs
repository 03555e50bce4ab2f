//! Multi-agent workflow coordination with checkpointing and performance monitoring.
//!
//! Runs workflows (DAGs of steps) by fanning each step out across agents
//! selected from a pool under one of four coordination strategies, takes
//! integrity-checked checkpoints so interrupted executions can resume, and
//! keeps time-series metrics with threshold alerting and health scoring.
//!
//! # Main types
//!
//! - [`WorkflowEngine`] — Drives executions step by step with pause, resume and recovery.
//! - [`MultiAgentCoordinator`] — Dispatches one step under PARALLEL, SEQUENTIAL, PIPELINE or SCATTER_GATHER.
//! - [`WorkflowStateManager`] — Checkpoint ring buffers and recovery.
//! - [`PerformanceMonitor`] — Metrics, threshold alerts, workflow profiling and health.
//! - [`ExecutionContext`] — Mutable state of one workflow execution.
//! - [`AgentPool`] — In-process agent registry with load-balanced selection.

/// Agent executor trait, descriptors and the agent pool.
pub mod agent;
/// Integrity-checked execution snapshots.
pub mod checkpoint;
/// Configuration file model.
pub mod config;
/// Per-execution state.
pub mod context;
/// Multi-agent step coordination strategies.
pub mod coordinator;
/// Workflow engine.
pub mod engine;
/// Metrics, alerts, profiling and health scoring.
pub mod monitor;
/// Host resource sampling.
pub mod sampler;
/// Checkpoint lifecycle management and recovery.
pub mod state;
/// Checkpoint storage backends.
pub mod store;
/// Shared coordination types (AgentTask, RetryConfig, strategies).
pub mod types;
/// Workflow definitions, execution records and repositories.
pub mod workflow;

pub use agent::{
    AgentDescriptor, AgentHandle, AgentPool, AgentRegistry, AgentRequirements, AgentTaskExecutor,
};
pub use checkpoint::{CheckpointLevel, CheckpointTrigger, StateCheckpoint, StateSnapshot};
pub use config::{ConductorConfig, LoggingConfig};
pub use context::{ExecutionContext, ExecutionPhase, ExecutionStatus};
pub use coordinator::{
    partition_input, AgentFailure, AgentOutput, AggregatedResult, CoordinatorConfig,
    MultiAgentCoordinator,
};
pub use engine::{EngineConfig, ExecutionHandle, ShutdownReport, WorkflowEngine};
pub use monitor::{
    Alert, AlertSeverity, AlertState, Comparison, HealthStatus, Metric, MetricStatistics,
    MetricType, MonitorConfig, MonitorEvent, PerformanceMonitor, Recommendation,
    RecommendationPriority, RecommendationType, SystemHealthSummary, ThresholdRule,
    WorkflowExecutionStats,
};
pub use sampler::{ResourceSample, ResourceSampler, SystemSampler};
pub use state::{StateManagerConfig, WorkflowStateManager};
pub use store::{CheckpointStore, InMemoryCheckpointStore};
pub use types::{AgentTask, AgentTaskState, CoordinationStrategy, RetryConfig, TaskPriority};
pub use workflow::{
    InMemoryWorkflowRepository, StepOutcome, WorkflowDefinition, WorkflowExecution,
    WorkflowRepository, WorkflowStep,
};
