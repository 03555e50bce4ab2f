//! Core types and error definitions for the Conductor workflow engine.
//!
//! This crate provides the error taxonomy shared by every Conductor crate.
//! Per-agent failures inside a multi-agent step are reported as data by the
//! orchestrator; the variants here are for conditions that must unwind.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.

/// Top-level error type for the Conductor engine.
///
/// Each variant corresponds to a failure class of the coordination engine.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// A single agent task failed. Retryable under the task's retry policy.
    #[error("Agent task error: {0}")]
    AgentTask(String),

    /// A coordination strategy could not obtain its minimum agent quorum.
    #[error("Coordination error: {0}")]
    Coordination(String),

    /// A checkpoint failed its integrity check.
    #[error("Checkpoint integrity error: {0}")]
    CheckpointIntegrity(String),

    /// A fatal workflow error: missing definition, malformed or cyclic graph,
    /// repository unavailable.
    #[error("Workflow execution error: {0}")]
    WorkflowExecution(String),

    /// A referenced entity (execution, checkpoint, agent) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from a checkpoint or execution-record store.
    #[error("Store error: {0}")]
    Store(String),

    /// An operation exceeded its deadline.
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Whether another attempt of the same unit of work may succeed.
    ///
    /// Agent failures, timeouts and transient storage/I/O problems are
    /// retryable. Structural errors (bad config, bad graph, integrity
    /// violations, missing entities) are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConductorError::AgentTask(_)
                | ConductorError::Timeout(_)
                | ConductorError::Store(_)
                | ConductorError::Io(_)
        )
    }

    /// Whether this error must abort the whole workflow execution.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConductorError::WorkflowExecution(_) | ConductorError::Config(_)
        )
    }
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;
