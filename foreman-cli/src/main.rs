use anyhow::{Context, Result};
use clap::Parser;
use foreman_config::{ConfigLoader, ForemanConfig};
use foreman_execution::{
    run_worker_process, InMemoryTaskQueue, InMemoryTaskStorage, ManagerEvent, ServiceEvent,
    ServiceManager, TaskId, TaskManager, TaskStatus,
};
use foreman_logging::{init_logging_from_config, init_simple_tracing, init_worker_tracing};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod cli;
mod tasks;

use cli::{Cli, Commands, ConfigCommands};

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<ForemanConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) if path.exists() => loader
            .from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path)),
        Some(path) => {
            warn!("Configuration file not found: {:?}. Using defaults.", path);
            loader
                .from_env()
                .context("Failed to load configuration from environment")
        }
        None => loader
            .from_env()
            .context("Failed to load configuration from environment"),
    }
}

fn parse_options(options_json: &str) -> Result<JsonValue> {
    serde_json::from_str(options_json)
        .with_context(|| format!("Invalid JSON options: {}", options_json))
}

/// Submit tasks to a task manager and print each final state
async fn run_command(config: &ForemanConfig, task_type: &str, options_json: &str, count: usize) -> Result<()> {
    let options = parse_options(options_json)?;
    let registry = tasks::registry();

    let storage = Arc::new(InMemoryTaskStorage::new());
    let queue = Arc::new(InMemoryTaskQueue::with_storage(storage.clone()));
    let manager = TaskManager::from_config(config, queue, Some(storage))
        .context("Failed to create task manager")?;

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ManagerEvent::TaskProgress(snapshot)) => info!(
                    task_id = %snapshot.task.id,
                    completion = snapshot.completion,
                    target = snapshot.completion_target,
                    "{}",
                    snapshot.message
                ),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} progress events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut submitted = Vec::with_capacity(count);
    for _ in 0..count {
        let id = format!("{}-{}", task_type, Uuid::new_v4());
        let task = registry
            .describe(id, task_type, options.clone())
            .with_context(|| format!("Cannot create a '{}' task", task_type))?;
        submitted.push(manager.submit_task(task).await.context("Failed to submit task")?);
    }

    let mut failed = 0;
    for task in submitted {
        let task_id = task.task_id().clone();
        match task.wait().await {
            Ok(reporter) => {
                let snapshot = reporter.snapshot();
                if snapshot.status == TaskStatus::Failed {
                    failed += 1;
                }
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            Err(e) => {
                failed += 1;
                error!(task_id = %task_id, "Task did not finish: {}", e);
            }
        }
    }

    let stats = manager.stats().await?;
    info!(
        completed = stats.pool.completed_tasks,
        failed = stats.pool.failed_tasks,
        "All tasks settled"
    );
    manager.terminate().await;

    if failed > 0 {
        anyhow::bail!("{} of {} tasks failed", failed, count);
    }
    Ok(())
}

/// Supervise one service until Ctrl-C
async fn service_command(
    config: &ForemanConfig,
    task_type: &str,
    options_json: &str,
    id: Option<&str>,
) -> Result<()> {
    let options = parse_options(options_json)?;
    let task_id = TaskId::new(id.unwrap_or(task_type));
    let task = tasks::registry()
        .describe(task_id.clone(), task_type, options)
        .with_context(|| format!("Cannot create a '{}' service", task_type))?;

    let manager = ServiceManager::from_config(config).context("Failed to create service manager")?;
    manager.add_task(task)?;

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServiceEvent::Failed { task_id, error }) => {
                    error!(task_id = %task_id, "Service failed: {}", error)
                }
                Ok(event) => debug!("Service event: {:?}", event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    for (task_id, outcome) in manager.start().await {
        match outcome {
            Ok(_) => info!(task_id = %task_id, "Service started"),
            Err(e) => warn!(task_id = %task_id, "Service did not start: {}", e),
        }
    }

    println!("Supervising '{}'. Press Ctrl-C to stop.", task_id);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Stopping services");
    manager.terminate().await;
    let status = manager.status_by_id(&task_id)?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn tasks_command() {
    let registry = tasks::registry();
    for task_type in ["sleep", "word-count", "http-respond", "counter"] {
        if let Some(kind) = registry.kind_of(task_type) {
            println!("{:<14} {:?}", task_type, kind);
        }
    }
}

/// Handle configuration validation
fn handle_config_validate(config_file: &Path) -> Result<()> {
    info!("Validating configuration file: {:?}", config_file);

    if !config_file.exists() {
        anyhow::bail!("Configuration file not found: {:?}", config_file);
    }

    ConfigLoader::new()
        .from_file(config_file)
        .with_context(|| format!("Configuration validation failed for {:?}", config_file))?;
    println!("Configuration file is valid");
    Ok(())
}

/// Handle configuration generation
fn handle_config_generate(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Output file already exists: {:?}. Use --force to overwrite.",
            output
        );
    }

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }

    std::fs::write(output, ForemanConfig::generate_sample())
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;
    println!("Configuration written to {:?}", output);
    Ok(())
}

/// Handle configuration display
fn handle_config_show(config: &ForemanConfig, format: &str) -> Result<()> {
    let rendered = match format {
        "json" => serde_json::to_string_pretty(config).context("Failed to serialize configuration")?,
        "yaml" => serde_yaml::to_string(config).context("Failed to serialize configuration")?,
        other => anyhow::bail!("Unsupported format '{}'. Use 'yaml' or 'json'.", other),
    };
    println!("{}", rendered);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Workers log to stderr only; stdout carries the IPC stream
    if cli.worker {
        init_worker_tracing(cli.log_level.as_deref())?;
        return run_worker_process(tasks::registry())
            .await
            .context("Worker process failed");
    }

    let config = load_config(cli.config.as_ref())?;
    match cli.log_level.as_deref() {
        Some(level) => init_simple_tracing(level)?,
        None => init_logging_from_config(&config.logging)?,
    }

    match &cli.command {
        Some(Commands::Run {
            task_type,
            options_json,
            count,
        }) => run_command(&config, task_type, options_json, *count).await,
        Some(Commands::Service {
            task_type,
            options_json,
            id,
        }) => service_command(&config, task_type, options_json, id.as_deref()).await,
        Some(Commands::Tasks) => {
            tasks_command();
            Ok(())
        }
        Some(Commands::Config { config_cmd }) => match config_cmd {
            ConfigCommands::Validate { config_file } => handle_config_validate(config_file),
            ConfigCommands::Generate { output, force } => handle_config_generate(output, *force),
            ConfigCommands::Show { format } => handle_config_show(&config, format),
        },
        None => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            cmd.print_help().context("Failed to print help")?;
            println!();
            Ok(())
        }
    }
}
