use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conductor::cancel::CancelToken;
use conductor::config::Config;
use conductor::engine::{CheckpointStore, ExecutionEngine, RunOptions, RunSummary};
use conductor::plan::{PlanStore, TaskStatus};
use conductor::provider::ProviderAdapter;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Task orchestration engine for external code assistants")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to the plan document. Defaults to .conductor/plan.json
    #[arg(long, global = true)]
    pub plan_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute every pending task in plan order
    Run {
        /// Resume from the most recent checkpoint
        #[arg(long)]
        resume: bool,

        /// Resume from a specific checkpoint file
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Show plan progress
    Status,
    /// List tasks in execution order
    List,
    /// Probe the configured providers
    Providers,
    /// Remove checkpoints, logs, and run records
    Reset {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::load(project_dir, cli.plan_file.clone(), cli.verbose)?;

    match &cli.command {
        Commands::Run { resume, checkpoint } => {
            let summary = cmd_run(config, *resume, checkpoint.clone()).await?;
            if !summary.success {
                std::process::exit(1);
            }
        }
        Commands::Status => cmd_status(&config)?,
        Commands::List => cmd_list(&config)?,
        Commands::Providers => cmd_providers(&config).await,
        Commands::Reset { force } => cmd_reset(&config, *force)?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "conductor=debug" } else { "conductor=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn cmd_run(config: Config, resume: bool, checkpoint: Option<PathBuf>) -> Result<RunSummary> {
    let cancel = CancelToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancellation requested; finishing up...");
            ctrl_c_token.cancel();
        }
    });

    let mut engine = ExecutionEngine::from_config(config, cancel).await?;
    let summary = engine
        .execute_all_tasks_with_recovery(RunOptions {
            resume: resume || checkpoint.is_some(),
            checkpoint_path: checkpoint,
        })
        .await?;

    print_summary(&summary);
    Ok(summary)
}

fn print_summary(summary: &RunSummary) {
    println!();
    let headline = if summary.cancelled {
        console::style("Run cancelled").yellow().bold()
    } else if summary.success {
        console::style("Run complete").green().bold()
    } else {
        console::style("Run finished with failures").red().bold()
    };
    println!("{}", headline);
    println!(
        "  {} total, {} completed, {} failed, {} skipped in {:.1}s",
        summary.total_tasks,
        console::style(summary.completed).green(),
        console::style(summary.failed).red(),
        summary.skipped,
        summary.duration_ms as f64 / 1000.0
    );
    if summary.recovered_from_checkpoint {
        println!("  {}", console::style("(resumed from checkpoint)").dim());
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    let plan = PlanStore::new(&config.plan_file).read()?;
    let tasks = plan.ordered_tasks();
    let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();

    println!("{}", console::style(&plan.project).bold());
    println!(
        "  {} tasks: {} completed, {} failed, {} in progress, {} todo",
        tasks.len(),
        console::style(count(TaskStatus::Completed)).green(),
        console::style(count(TaskStatus::Failed)).red(),
        count(TaskStatus::InProgress),
        count(TaskStatus::Todo),
    );

    for phase in &plan.phases {
        let done = phase
            .tasks
            .iter()
            .filter_map(|id| plan.task(id))
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        println!(
            "  {} {} ({}/{})",
            console::style("▸").cyan(),
            phase.name,
            done,
            phase.tasks.len()
        );
    }

    if let Some((path, _)) = CheckpointStore::new(&config.checkpoint_dir).latest()? {
        println!("  {} {}", console::style("Latest checkpoint:").dim(), path.display());
    }
    Ok(())
}

fn cmd_list(config: &Config) -> Result<()> {
    let plan = PlanStore::new(&config.plan_file).read()?;
    for task in plan.ordered_tasks() {
        let marker = match task.status {
            TaskStatus::Completed => console::style("✓").green(),
            TaskStatus::Failed => console::style("✗").red(),
            TaskStatus::InProgress => console::style("…").yellow(),
            TaskStatus::Todo => console::style("·").dim(),
        };
        println!("  {} {}  {}", marker, task.id, task.title);
        if let Some(error) = &task.last_error {
            println!("      {}", console::style(error).red().dim());
        }
    }
    Ok(())
}

async fn cmd_providers(config: &Config) {
    let mut unreachable = 0usize;
    for spec in &config.providers {
        let adapter = ProviderAdapter::new(spec.clone());
        let healthy = adapter.health().await;
        if !healthy {
            unreachable += 1;
        }
        let marker = if healthy {
            console::style("healthy").green()
        } else {
            console::style("unreachable").red()
        };
        println!(
            "  {}  {} ({}, timeout {}s)",
            marker, spec.name, spec.command, spec.timeout_secs
        );
    }
    if unreachable > 0 {
        println!(
            "  {} {} provider(s) would start with an open circuit",
            console::style("⚠").yellow(),
            unreachable
        );
    }
}

fn cmd_reset(config: &Config, force: bool) -> Result<()> {
    if !force {
        let confirmed = dialoguer::Confirm::with_theme(&dialoguer::theme::ColorfulTheme::default())
            .with_prompt("Remove all checkpoints, logs, and run records?")
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Reset aborted.");
            return Ok(());
        }
    }

    let removed = CheckpointStore::new(&config.checkpoint_dir).clear()?;
    for dir in [&config.log_dir, &config.runs_dir] {
        if dir.exists() {
            std::fs::remove_dir_all(dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
    }
    if config.events_file.exists() {
        std::fs::remove_file(&config.events_file)
            .with_context(|| format!("Failed to remove {}", config.events_file.display()))?;
    }
    println!("Removed {} checkpoint(s), logs, and run records.", removed);
    Ok(())
}
