use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flowline_core::config::AppConfig;
use flowline_core::event::EngineEvent;
use flowline_core::traits::Repositories;
use flowline_core::types::{
    Assignee, TaskInstance, TaskType, WorkflowDefinition, WorkflowInstanceId,
};
use flowline_engine::{ConditionEngine, Engine, LocalAgentService};
use flowline_store::Store;

#[derive(Parser)]
#[command(name = "flowline", version, about = "Workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a workflow from a definition file and drive it until it waits
    Run {
        /// Workflow definition (.json or .toml)
        definition: PathBuf,
        /// Instance name (defaults to the workflow name)
        #[arg(long)]
        name: Option<String>,
        /// Input payload as JSON
        #[arg(long, default_value = "{}")]
        input: String,
        /// Context data merged into every node's global context, as JSON
        #[arg(long, default_value = "{}")]
        context: String,
        #[command(flatten)]
        drive: DriveArgs,
    },
    /// Resume every persisted instance that has not finished
    Resume {
        #[command(flatten)]
        drive: DriveArgs,
    },
    /// Check a definition file and every edge condition in it
    Validate {
        definition: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args)]
struct DriveArgs {
    /// Complete every human task with this JSON output, as its assignee
    #[arg(long)]
    human_output: Option<String>,
    /// Stop waiting after this many seconds without engine activity
    #[arg(long, default_value = "5")]
    idle_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "flowline", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { definition } => {
            let definition = load_definition(&definition)?;
            let problems = validate_definition(&config, &definition);
            if !problems.is_empty() {
                for problem in &problems {
                    eprintln!("  {}", problem);
                }
                bail!("{} problem(s) in workflow '{}'", problems.len(), definition.id);
            }
            println!(
                "Workflow '{}' is valid: {} nodes, {} connections",
                definition.id,
                definition.nodes.len(),
                definition.connections.len()
            );
        }
        Commands::Run {
            definition,
            name,
            input,
            context,
            drive,
        } => {
            let definition = load_definition(&definition)?;
            let problems = validate_definition(&config, &definition);
            if !problems.is_empty() {
                bail!("workflow '{}' is invalid: {}", definition.id, problems.join("; "));
            }
            let input: Value = serde_json::from_str(&input).context("--input is not JSON")?;
            let context: Value =
                serde_json::from_str(&context).context("--context is not JSON")?;

            let store = Store::open(&config)?;
            store.seed_workflow(&definition)?;
            let agents = echo_agents([&definition]);
            let repos = store.repositories();
            let engine = Engine::new(&config, repos.clone(), agents);
            let driver = Driver::start(&engine, repos, &drive)?;

            let name = name.unwrap_or_else(|| definition.name.clone());
            let id = engine
                .orchestrator
                .start_workflow(&definition.id, &name, input, context)
                .await?;
            println!("Started workflow instance {}", id);

            driver.wait(&engine, vec![id]).await?;
        }
        Commands::Resume { drive } => {
            let store = Store::open(&config)?;
            let repos = store.repositories();
            let active = repos.workflow_instances.list_active().await?;
            if active.is_empty() {
                println!("No active workflow instances");
                return Ok(());
            }

            let mut definitions = Vec::new();
            for workflow_id in active.iter().map(|i| &i.workflow_id).collect::<HashSet<_>>() {
                definitions.push(WorkflowDefinition {
                    id: workflow_id.clone(),
                    name: workflow_id.to_string(),
                    nodes: repos.nodes.workflow_nodes(workflow_id).await?,
                    connections: Vec::new(),
                });
            }
            let agents = echo_agents(definitions.iter());
            let engine = Engine::new(&config, repos.clone(), agents);
            let driver = Driver::start(&engine, repos, &drive)?;

            let resumed = engine.orchestrator.resume_active_instances().await?;
            println!("Resumed {} workflow instance(s)", resumed);
            driver
                .wait(&engine, active.into_iter().map(|i| i.id).collect())
                .await?;
        }
        // Handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Load the config file, falling back to ~/.flowline/config.toml and then
/// to defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        let home_config = home.join(".flowline").join("config.toml");
        if home_config.exists() {
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    Ok(AppConfig::default())
}

fn load_definition(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let definition: WorkflowDefinition = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)?,
        _ => serde_json::from_str(&content)?,
    };
    Ok(definition.normalized())
}

fn validate_definition(config: &AppConfig, definition: &WorkflowDefinition) -> Vec<String> {
    let mut problems = Vec::new();
    if let Err(e) = definition.check() {
        problems.push(e.to_string());
    }
    let conditions = ConditionEngine::new(config.conditions.clone());
    for conn in &definition.connections {
        for problem in conditions.validate(conn.condition_config.as_ref()) {
            problems.push(format!(
                "{} -> {}: {}",
                conn.from_node_id, conn.to_node_id, problem
            ));
        }
    }
    problems
}

/// Agent service answering every agent referenced by `definitions` with its
/// task input.
fn echo_agents<'a>(
    definitions: impl IntoIterator<Item = &'a WorkflowDefinition>,
) -> Arc<LocalAgentService> {
    let agents = Arc::new(LocalAgentService::new());
    let ids: HashSet<String> = definitions
        .into_iter()
        .flat_map(|d| d.nodes.iter())
        .filter_map(|n| n.processor.as_ref()?.agent_id.clone())
        .collect();
    for agent_id in ids {
        info!(agent_id = %agent_id, "Registering echo agent");
        let id = agent_id.clone();
        agents.register(agent_id, move |task: TaskInstance| {
            let id = id.clone();
            async move { Ok(json!({ "agent": id, "echo": task.input_data })) }
        });
    }
    agents
}

/// Runs the registry's background loop and watches engine events until the
/// instances being driven finish or go idle.
struct Driver {
    repos: Repositories,
    cancel: CancellationToken,
    events: tokio::sync::broadcast::Receiver<EngineEvent>,
    human_output: Option<Value>,
    idle: Duration,
}

impl Driver {
    fn start(engine: &Engine, repos: Repositories, args: &DriveArgs) -> anyhow::Result<Self> {
        let human_output = args
            .human_output
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("--human-output is not JSON")?;

        let cancel = CancellationToken::new();
        let registry = engine.registry.clone();
        let token = cancel.clone();
        tokio::spawn(async move { registry.run(token).await });

        Ok(Self {
            repos,
            cancel,
            events: engine.event_bus.subscribe(),
            human_output,
            idle: Duration::from_secs(args.idle_secs),
        })
    }

    async fn wait(mut self, engine: &Engine, ids: Vec<WorkflowInstanceId>) -> anyhow::Result<()> {
        let mut pending: HashSet<WorkflowInstanceId> = ids.iter().cloned().collect();

        // Human tasks dispatched before we subscribed.
        for id in &ids {
            for task in engine.orchestrator.open_tasks(id).await? {
                self.on_human_task(engine, &task).await;
            }
        }

        while !pending.is_empty() {
            let event = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
                _ = tokio::time::sleep(self.idle) => {
                    info!(idle_secs = self.idle.as_secs(), "No engine activity");
                    break;
                }
                event = self.events.recv() => event,
            };
            match event {
                Ok(EngineEvent::WorkflowFinished {
                    workflow_instance_id,
                    status,
                }) => {
                    if pending.remove(&workflow_instance_id) {
                        println!("Workflow instance {} finished: {}", workflow_instance_id, status);
                    }
                }
                Ok(EngineEvent::TaskDispatched {
                    task_id,
                    task_type: TaskType::Human | TaskType::Mixed,
                    ..
                }) => match self.repos.tasks.get(&task_id).await {
                    Ok(Some(task)) => self.on_human_task(engine, &task).await,
                    Ok(None) => warn!(task_id = %task_id, "Dispatched task not found"),
                    Err(e) => error!(task_id = %task_id, error = %e, "Failed to load task"),
                },
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }

        for id in &pending {
            let open = engine.orchestrator.open_tasks(id).await.unwrap_or_default();
            println!("Workflow instance {} is waiting on {} task(s):", id, open.len());
            for task in open {
                println!("  {} [{}] {}", task.id, task.status, task.title);
            }
        }

        self.cancel.cancel();
        let persisted = engine.registry.persist_all().await;
        info!(persisted, "Contexts persisted");
        Ok(())
    }

    async fn on_human_task(&self, engine: &Engine, task: &TaskInstance) {
        let Some(output) = &self.human_output else {
            return;
        };
        let actor = match &task.assignee {
            Some(Assignee::User(user)) => user.clone(),
            Some(Assignee::Agent(_)) => return,
            None => "cli".to_string(),
        };
        if let Err(e) = engine
            .orchestrator
            .complete_task(&task.id, &actor, output.clone(), None)
            .await
        {
            error!(task_id = %task.id, error = %e, "Failed to complete human task");
        }
    }
}
