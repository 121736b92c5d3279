use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cds_core::config::{dirs_home, AppConfig};
use cds_core::event::EventBus;
use cds_core::types::ExecutionId;

use cds_workflow::{
    result_channel, Checkpointer, DryRunContext, DryRunHooks, EdgeLabel, ExecutionOptions, Graph,
    RunLogger, StatusStore, StatusTable, WorkflowDefinition, WorkflowExecutor,
};

#[derive(Parser)]
#[command(name = "cds", version, about = "Directed-graph workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cds.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse graph notation and print its structure
    Parse {
        /// Graph notation, e.g. "[START>A/SUCCESS, A>END/SUCCESS]"
        graph: String,
    },
    /// Dry-run a workflow with scripted node outcomes
    Run {
        #[command(flatten)]
        source: GraphSource,
        #[command(flatten)]
        script: Script,
        /// Execution ID (auto-generated if not provided)
        #[arg(long)]
        execution_id: Option<String>,
    },
    /// Restart an interrupted execution from its checkpoint
    Resume {
        /// Execution to resume
        execution_id: String,
        // Overrides the graph stored with the checkpoint when given.
        #[command(flatten)]
        source: GraphSource,
        #[command(flatten)]
        script: Script,
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

#[derive(Args)]
struct GraphSource {
    /// Graph notation
    graph: Option<String>,
    /// Workflow definition file (TOML, or JSON by extension)
    #[arg(long, conflicts_with = "graph")]
    workflow: Option<PathBuf>,
}

#[derive(Args)]
struct Script {
    /// Outcome of a node, as NODE=LABEL (repeatable)
    #[arg(long = "outcome", value_parser = parse_outcome)]
    outcomes: Vec<(String, EdgeLabel)>,
    /// Outcome of nodes without an --outcome entry
    #[arg(long)]
    default_outcome: Option<EdgeLabel>,
    /// Node that fails with an error (repeatable)
    #[arg(long = "fail")]
    failing: Vec<String>,
    /// Workflow input as JSON
    #[arg(long)]
    input: Option<String>,
    /// Override engine.max_parallel_nodes
    #[arg(long)]
    max_parallel: Option<usize>,
}

fn parse_outcome(s: &str) -> Result<(String, EdgeLabel), String> {
    let (node, label) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NODE=LABEL, got '{}'", s))?;
    let label = label.trim().parse::<EdgeLabel>().map_err(|e| e.to_string())?;
    Ok((node.trim().to_string(), label))
}

impl Script {
    fn hooks(&self) -> DryRunHooks {
        let mut hooks = DryRunHooks::new();
        for (node, label) in &self.outcomes {
            hooks = hooks.with_outcome(node.clone(), *label);
        }
        if let Some(label) = self.default_outcome {
            hooks = hooks.with_default_outcome(label);
        }
        for node in &self.failing {
            hooks = hooks.with_failing(node.clone());
        }
        hooks
    }

    fn input(&self) -> anyhow::Result<serde_json::Value> {
        match self.input {
            Some(ref text) => serde_json::from_str(text).context("--input is not valid JSON"),
            None => Ok(serde_json::Value::Null),
        }
    }
}

impl GraphSource {
    fn is_empty(&self) -> bool {
        self.graph.is_none() && self.workflow.is_none()
    }

    fn load(&self) -> anyhow::Result<Graph> {
        if let Some(ref text) = self.graph {
            return Ok(text.parse::<Graph>()?);
        }
        let path = self
            .workflow
            .as_ref()
            .ok_or_else(|| anyhow!("a graph or --workflow <FILE> is required"))?;
        load_workflow(path)
    }
}

fn load_workflow(path: &Path) -> anyhow::Result<Graph> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let definition = if path.extension().is_some_and(|e| e == "json") {
        WorkflowDefinition::from_json_str(&text)?
    } else {
        WorkflowDefinition::from_toml_str(&text)?
    };
    info!(
        workflow = definition.name.as_deref().unwrap_or("unnamed"),
        steps = definition.steps.len(),
        "Loaded workflow definition"
    );
    Ok(definition.to_graph()?)
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home) = dirs_home().map(|h| h.join(".cds").join("config.toml")) {
        if home.exists() {
            info!(path = %home.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home)?);
        }
    }
    Ok(AppConfig::default())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cds=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "cds", &mut std::io::stdout());
        }
        Commands::Parse { graph } => {
            let graph: Graph = graph.parse()?;
            println!("{}", graph);
            println!();
            println!("{}", graph.describe());
        }
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run {
            source,
            script,
            execution_id,
        } => {
            let config = load_config(&cli.config)?;
            let graph = source.load()?;
            let execution_id = execution_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            run_workflow(&config, graph, &script, execution_id, None).await?;
        }
        Commands::Resume {
            execution_id,
            source,
            script,
        } => {
            let config = load_config(&cli.config)?;
            let path = config
                .checkpoint_path()
                .ok_or_else(|| anyhow!("checkpointing is disabled; enable [checkpoint] to resume"))?;
            let store = StatusStore::open(&path)?;
            let snapshot = store
                .load(&execution_id)?
                .ok_or_else(|| anyhow!("no checkpoint for execution {}", execution_id))?;
            if snapshot.completed {
                warn!(execution_id = %execution_id, "Execution already completed; replaying");
            }
            let graph = if source.is_empty() {
                snapshot.graph.parse::<Graph>()?
            } else {
                source.load()?
            };
            run_workflow(&config, graph, &script, execution_id, Some(snapshot.statuses)).await?;
        }
    }

    Ok(())
}

async fn run_workflow(
    config: &AppConfig,
    graph: Graph,
    script: &Script,
    execution_id: String,
    previous: Option<StatusTable>,
) -> anyhow::Result<()> {
    let graph = Arc::new(graph);
    let input = script.input()?;
    let event_bus = Arc::new(EventBus::new(config.engine.event_capacity));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling remaining nodes");
                cancel.cancel();
            }
        });
    }

    let logger = config.log_dir().map(|dir| {
        RunLogger::new(dir, config.log_level()).spawn(
            &event_bus,
            ExecutionId::new(execution_id.clone()),
            CancellationToken::new(),
        )
    });
    let checkpointer = match config.checkpoint_path() {
        Some(path) => {
            let store = Arc::new(StatusStore::open(&path)?);
            let mut checkpointer = Checkpointer::new(store, &graph);
            if let Some(ref previous) = previous {
                checkpointer = checkpointer.resuming(previous);
            }
            Some(checkpointer.spawn(
                &event_bus,
                ExecutionId::new(execution_id.clone()),
                CancellationToken::new(),
            ))
        }
        None => None,
    };

    let mut options = ExecutionOptions::new()
        .with_execution_id(execution_id.clone())
        .with_cancel(cancel)
        .with_max_parallel_nodes(
            script
                .max_parallel
                .unwrap_or(config.engine.max_parallel_nodes),
        );
    if let Some(previous) = previous {
        options = options.resume_from(previous);
    }

    let executor = WorkflowExecutor::new(script.hooks()).with_event_bus(event_bus.clone());
    let context = Arc::new(DryRunContext::new(execution_id.clone(), input.clone()));
    let (handle, result) = result_channel();

    let statuses = executor
        .execute_workflow_with(graph, context, input, handle, options)
        .await;
    let report = result.await?;

    if let Some(checkpointer) = checkpointer {
        checkpointer.await.ok();
    }
    if let Some(logger) = logger {
        logger.await.ok();
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    println!();
    for (node, status) in statuses.iter() {
        println!("  {:<24} {}", node, status);
    }

    if !report.succeeded {
        bail!(
            "execution {} did not complete: {}",
            execution_id,
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
