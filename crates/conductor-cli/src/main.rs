use async_trait::async_trait;
use clap::{Parser, Subcommand};
use conductor_core::ConductorResult;
use conductor_orchestrator::{
    AgentPool, AgentTask, AgentTaskExecutor, ConductorConfig, ExecutionStatus,
    InMemoryWorkflowRepository, LoggingConfig, WorkflowDefinition,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: multi-agent workflow runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition and print the execution record
    Run {
        /// Workflow definition (TOML)
        workflow: PathBuf,
        /// Workflow input as JSON
        #[arg(short, long)]
        input: Option<String>,
    },
    /// Check a workflow definition for unknown dependencies and cycles
    Validate {
        /// Workflow definition (TOML)
        workflow: PathBuf,
    },
    /// List the agents declared in the config
    Agents,
}

/// Returns its input tagged with the agent that handled it.
struct EchoAgent {
    agent_id: String,
}

#[async_trait]
impl AgentTaskExecutor for EchoAgent {
    async fn execute(&self, task: &AgentTask) -> ConductorResult<serde_json::Value> {
        Ok(serde_json::json!({
            "agent_id": self.agent_id,
            "task_type": task.task_type,
            "echo": task.input_data,
        }))
    }
}

/// A missing config file means defaults; a malformed one is an error.
fn load_config(path: &Path) -> anyhow::Result<ConductorConfig> {
    if !path.exists() {
        return Ok(ConductorConfig::default());
    }
    ConductorConfig::load(path)
        .map_err(|e| anyhow::anyhow!("Failed to load config '{}': {e}", path.display()))
}

fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read workflow '{}': {e}", path.display()))?;
    Ok(WorkflowDefinition::from_toml_str(&raw)?)
}

fn parse_input(input: Option<&str>) -> anyhow::Result<serde_json::Value> {
    match input {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("--input is not valid JSON: {e}")),
        None => Ok(serde_json::json!({})),
    }
}

fn build_pool(config: &ConductorConfig) -> anyhow::Result<AgentPool> {
    let pool = AgentPool::new();
    for descriptor in &config.agents {
        match descriptor.kind.as_str() {
            "echo" => {
                let executor = Arc::new(EchoAgent {
                    agent_id: descriptor.agent_id.clone(),
                });
                pool.register(descriptor.clone(), executor)?;
            }
            other => anyhow::bail!(
                "agent '{}' has unsupported kind '{other}'",
                descriptor.agent_id
            ),
        }
    }
    Ok(pool)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run { workflow, input } => {
            let definition = load_workflow(&workflow)?;
            let input = parse_input(input.as_deref())?;
            let workflow_id = definition.workflow_id.clone();

            let pool = build_pool(&config)?;
            if pool.is_empty() {
                warn!("No agents configured; every step will fail its quorum check");
            }
            let repository = Arc::new(InMemoryWorkflowRepository::new());
            repository.insert(definition).await?;

            let engine = config.build_engine(repository, Arc::new(pool), None);
            engine.start_monitoring();
            info!(workflow_id = %workflow_id, "Running workflow");

            let execution = engine.execute_workflow(&workflow_id, input).await?;
            let report = engine.shutdown().await;
            info!(
                execution_id = %execution.execution_id,
                status = %execution.status,
                drained = report.drained,
                "Workflow finished"
            );

            println!("{}", serde_json::to_string_pretty(&execution)?);
            if execution.status != ExecutionStatus::Completed {
                anyhow::bail!(
                    "workflow '{workflow_id}' ended {}: {}",
                    execution.status,
                    execution.error.as_deref().unwrap_or("no error recorded")
                );
            }
        }
        Commands::Validate { workflow } => {
            let definition = load_workflow(&workflow)?;
            definition.validate()?;
            println!(
                "Workflow '{}' is valid ({} steps)",
                definition.workflow_id,
                definition.steps.len()
            );
        }
        Commands::Agents => {
            if config.agents.is_empty() {
                println!("No agents configured");
            }
            for agent in &config.agents {
                let capabilities: Vec<String> = agent
                    .capabilities
                    .iter()
                    .map(|(name, score)| format!("{name}={score}"))
                    .collect();
                println!(
                    "{:<20} {:<8} max_tasks={:<3} {}",
                    agent.agent_id,
                    agent.kind,
                    agent.max_concurrent_tasks,
                    capabilities.join(",")
                );
            }
        }
    }

    Ok(())
}
