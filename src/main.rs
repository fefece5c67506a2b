use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dagflow::config::Config;
use dagflow::engine::{Engine, ExecuteOptions};
use dagflow::storage::{Execution, ExecutionFilters, ExecutionStatus, SqliteStorage, Storage};
use dagflow::workflow::{parse_workflow_file, DependencyResolver};

#[derive(Parser)]
#[command(name = "dagflow")]
#[command(about = "Dependency-aware workflow execution engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to <config dir>/dagflow/config.toml)
    #[arg(long, global = true, env = "DAGFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file and wait for it to finish
    Run {
        /// Path to workflow YAML or JSON file
        file: PathBuf,
        /// Trigger parameters as a JSON object
        #[arg(short, long)]
        params: Option<String>,
        /// Whole-execution timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
        /// SQLite database path
        #[arg(long)]
        db: Option<PathBuf>,
        /// Print Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
    },
    /// Validate a workflow file and print its execution plan
    Validate {
        /// Path to workflow YAML or JSON file
        file: PathBuf,
    },
    /// Inspect recorded executions
    Executions {
        #[command(subcommand)]
        action: ExecutionActions,
    },
    /// Delete finished executions older than N days
    Cleanup {
        #[arg(long, default_value = "30")]
        older_than_days: u64,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// List registered node types
    Nodes,
}

#[derive(Subcommand)]
enum ExecutionActions {
    /// List recent executions
    List {
        /// Only executions of this workflow
        #[arg(short, long)]
        workflow: Option<String>,
        /// Only executions with this status
        #[arg(short, long)]
        status: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show one execution with its node results
    Show {
        execution_id: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dagflow=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    match cli.command {
        Commands::Run {
            file,
            params,
            timeout,
            db,
            metrics,
        } => cmd_run(config, &file, params.as_deref(), timeout, db, metrics).await?,
        Commands::Validate { file } => cmd_validate(&file)?,
        Commands::Executions { action } => match action {
            ExecutionActions::List {
                workflow,
                status,
                limit,
                db,
            } => {
                cmd_executions_list(&config, workflow.as_deref(), status.as_deref(), limit, db)
                    .await?
            }
            ExecutionActions::Show { execution_id, db } => {
                cmd_executions_show(&config, &execution_id, db).await?
            }
        },
        Commands::Cleanup {
            older_than_days,
            db,
        } => cmd_cleanup(config, older_than_days, db).await?,
        Commands::Nodes => cmd_nodes(),
    }

    Ok(())
}

/// Database path: flag, then config, then the data directory.
fn database_path(config: &Config, db: Option<PathBuf>) -> PathBuf {
    db.or_else(|| config.storage.database_path.clone())
        .unwrap_or_else(|| Config::data_dir().join("dagflow.db"))
}

fn open_storage(config: &Config, db: Option<PathBuf>) -> anyhow::Result<Arc<dyn Storage>> {
    let path = database_path(config, db);
    let storage = SqliteStorage::open(&path)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    Ok(Arc::new(storage))
}

async fn cmd_run(
    config: Config,
    file: &Path,
    params: Option<&str>,
    timeout: Option<u64>,
    db: Option<PathBuf>,
    print_metrics: bool,
) -> anyhow::Result<()> {
    if print_metrics {
        dagflow::metrics::init_metrics()?;
    }

    let workflow = parse_workflow_file(file)
        .with_context(|| format!("failed to load workflow {}", file.display()))?;
    let params: serde_json::Value = match params {
        Some(raw) => serde_json::from_str(raw).context("--params must be a JSON object")?,
        None => serde_json::json!({}),
    };
    if !params.is_object() {
        anyhow::bail!("--params must be a JSON object");
    }

    let storage = open_storage(&config, db)?;
    let engine = Engine::from_config(&config, storage)?;

    let options = ExecuteOptions {
        timeout: timeout.map(Duration::from_secs),
        triggered_by: "cli".to_string(),
        ..ExecuteOptions::default()
    };

    println!("Running workflow '{}'...", workflow.name);
    let execution_id = engine
        .execute_workflow_with_options(&workflow, params, options)
        .await?;

    let execution = tokio::select! {
        result = engine.wait_for_execution(&execution_id) => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted, cancelling execution...");
            engine.cancel_execution(&execution_id);
            engine.wait_for_execution(&execution_id).await?
        }
    };

    println!();
    print_execution(&execution);

    engine.shutdown(Duration::from_secs(5)).await?;

    if print_metrics {
        println!();
        print!("{}", dagflow::metrics::render_metrics());
    }

    if execution.status != ExecutionStatus::Success {
        anyhow::bail!("execution finished with status {}", execution.status);
    }
    Ok(())
}

fn cmd_validate(file: &Path) -> anyhow::Result<()> {
    let workflow = parse_workflow_file(file)
        .with_context(|| format!("failed to load workflow {}", file.display()))?;
    let resolver = DependencyResolver::from_workflow(&workflow);

    if let Err(e) = resolver.validate_workflow() {
        println!("✗ Workflow '{}' is invalid", workflow.name);
        println!();
        println!("{}", serde_json::to_string_pretty(&e.to_json())?);
        anyhow::bail!("validation failed");
    }

    let order = resolver.resolve_execution_order()?;
    let layers = resolver.execution_layers()?;

    println!("✓ Workflow '{}' is valid", workflow.name);
    println!();
    println!("  Nodes: {}", workflow.nodes.len());
    println!("  Edges: {}", workflow.edges.len());
    println!("  Order: {}", order.join(" -> "));
    println!();
    println!("Layers:");
    for (i, layer) in layers.iter().enumerate() {
        println!("  {:>3}: {}", i, layer.join(", "));
    }

    Ok(())
}

async fn cmd_executions_list(
    config: &Config,
    workflow: Option<&str>,
    status: Option<&str>,
    limit: usize,
    db: Option<PathBuf>,
) -> anyhow::Result<()> {
    let storage = open_storage(config, db)?;

    let mut filters = ExecutionFilters::default().with_limit(limit);
    if let Some(status) = status {
        let status: ExecutionStatus = status.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        filters = filters.with_status(status);
    }

    let executions = storage.list_executions(workflow, &filters).await?;
    if executions.is_empty() {
        println!("No executions found.");
        return Ok(());
    }

    println!(
        "{:<36} {:<20} {:<10} {:<9} {:<20}",
        "EXECUTION ID", "WORKFLOW", "STATUS", "PROGRESS", "STARTED"
    );
    println!("{}", "-".repeat(98));

    for exec in executions {
        println!(
            "{:<36} {:<20} {:<10} {:>7.1}%  {:<20}",
            exec.id,
            exec.workflow_id,
            exec.status.to_string(),
            exec.progress.completion_percent,
            exec.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

async fn cmd_executions_show(
    config: &Config,
    execution_id: &str,
    db: Option<PathBuf>,
) -> anyhow::Result<()> {
    let storage = open_storage(config, db)?;
    let execution = storage
        .get_execution(execution_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Execution not found: {}", execution_id))?;

    print_execution(&execution);
    Ok(())
}

fn print_execution(execution: &Execution) {
    println!("Execution ID: {}", execution.id);
    println!("Workflow: {} ({})", execution.workflow_name, execution.workflow_id);
    println!("Status: {}", execution.status);
    if let Some(error) = &execution.error {
        println!("Error: {}", error);
    }
    if let Some(duration) = execution.duration() {
        println!("Duration: {}ms", duration.num_milliseconds());
    }
    println!(
        "Progress: {}/{} nodes ({:.1}%)",
        execution.progress.completed_nodes,
        execution.progress.total_nodes,
        execution.progress.completion_percent
    );

    if execution.node_results.is_empty() {
        return;
    }

    println!();
    println!(
        "{:<24} {:<12} {:<10} {:>8} {:>10}",
        "NODE", "TYPE", "STATUS", "ATTEMPTS", "TIME (ms)"
    );
    println!("{}", "-".repeat(68));
    for result in execution.node_results.values() {
        println!(
            "{:<24} {:<12} {:<10} {:>8} {:>10}",
            result.node_id,
            result.node_type,
            result.status.to_string(),
            result.attempt_number,
            result.execution_time_ms
        );
        if let Some(error) = &result.error {
            println!("    {}", error);
        }
    }
}

async fn cmd_cleanup(config: Config, older_than_days: u64, db: Option<PathBuf>) -> anyhow::Result<()> {
    let storage = open_storage(&config, db)?;
    let engine = Engine::from_config(&config, storage)?;

    let removed = engine
        .cleanup_old_executions(Duration::from_secs(older_than_days * 24 * 60 * 60))
        .await?;
    engine.shutdown(Duration::from_secs(5)).await?;

    println!(
        "✓ Removed {} execution(s) older than {} day(s)",
        removed, older_than_days
    );
    Ok(())
}

fn cmd_nodes() {
    let registry = dagflow::nodes::NodeRegistry::with_builtins();
    println!("{:<16} DESCRIPTION", "TYPE");
    println!("{}", "-".repeat(60));
    for node_type in registry.list() {
        // set refuses an empty field list; the others accept a null config
        let sample = match node_type {
            "set" => serde_json::json!({"fields": [{"name": "example", "value": true}]}),
            _ => serde_json::Value::Null,
        };
        let description = registry
            .create(node_type, &sample)
            .and_then(|created| created.ok())
            .map(|node| node.description().to_string())
            .unwrap_or_default();
        println!("{:<16} {}", node_type, description);
    }
}
