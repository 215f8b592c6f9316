//! Factory CLI - compile recipes and run jobs against a simulated farm.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use factory_core::{JobRecord, JobRequest, LogEntry, Recipe, RunState};
use factory_scheduler::{
    BroadcastBus, DirRecipeStore, RecipeStore, Scheduler, SchedulerConfig, SimulatedSubstrate,
};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "factory")]
#[command(about = "Render-farm job orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand a recipe into its tasks and print them as JSON
    Compile {
        /// Recipe file
        recipe: PathBuf,
        /// Submission arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Run one job to completion on a simulated substrate
    Simulate {
        /// Directory containing <id>.json recipes
        #[arg(long)]
        recipes: PathBuf,
        /// Recipe id
        #[arg(long)]
        recipe: String,
        /// Submission arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Scheduler config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Keep jobs, tasks and logs in this directory
        #[arg(long)]
        data: Option<PathBuf>,
        /// How long each simulated workload runs
        #[arg(long, default_value = "200")]
        run_time_ms: u64,
        /// Maximum tasks running at once (0 = unlimited)
        #[arg(long)]
        concurrency_limit: Option<u32>,
        /// Override the short poll interval
        #[arg(long)]
        short_interval_ms: Option<u64>,
        /// Override the medium poll interval
        #[arg(long)]
        medium_interval_ms: Option<u64>,
    },
    /// List jobs kept in a data directory
    Jobs {
        /// Data directory
        #[arg(long)]
        data: PathBuf,
        /// Only jobs of this project
        #[arg(long)]
        project: Option<u64>,
    },
    /// Show a job, its tasks and its log
    Show {
        /// Data directory
        #[arg(long)]
        data: PathBuf,
        /// Job id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compile { recipe, args } => {
            let content = tokio::fs::read_to_string(&recipe)
                .await
                .with_context(|| format!("reading {}", recipe.display()))?;
            let recipe: Recipe = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", recipe.display()))?;
            let set = factory_recipe::compile(&recipe, parse_args(&args)?)?;
            println!("{}", serde_json::to_string_pretty(set.tasks())?);
        }
        Commands::Simulate {
            recipes,
            recipe,
            args,
            config,
            data,
            run_time_ms,
            concurrency_limit,
            short_interval_ms,
            medium_interval_ms,
        } => {
            let mut config = match config {
                Some(path) => SchedulerConfig::load(&path)
                    .await
                    .with_context(|| format!("loading {}", path.display()))?,
                None => SchedulerConfig::default(),
            };
            if let Some(ms) = short_interval_ms {
                config.short_interval_ms = ms;
            }
            if let Some(ms) = medium_interval_ms {
                config.medium_interval_ms = ms;
            }

            let store = Arc::new(DirRecipeStore::new(&recipes));
            if store.get(&recipe).await?.is_none() {
                bail!("no recipe \"{}\" in {}", recipe, recipes.display());
            }
            let substrate = Arc::new(
                SimulatedSubstrate::new().with_run_time(Duration::from_millis(run_time_ms)),
            );
            let bus = Arc::new(BroadcastBus::default());
            let scheduler = Arc::new(match &data {
                Some(dir) => Scheduler::open(dir, store, substrate, bus, config).await?,
                None => Scheduler::in_memory(store, substrate, bus, config),
            });

            scheduler.run();
            let job = scheduler
                .submit_job(JobRequest {
                    recipe,
                    args: parse_args(&args)?,
                    concurrency_limit,
                    ..Default::default()
                })
                .await?;
            info!(job_id = %job.id, "Waiting for job");
            let job = scheduler.wait_for_job(&job.id, Duration::from_millis(50)).await?;
            scheduler.stop();

            print_job(&scheduler, &job).await?;
            if job.state != RunState::Completed {
                bail!("job {} ended {}", job.id, job.state);
            }
        }
        Commands::Jobs { data, project } => {
            let scheduler = open_data(&data).await?;
            let jobs = scheduler.list_jobs(project).await?;
            println!("Jobs ({})", jobs.len());
            for job in jobs {
                println!(
                    "  {} | {} | {} | {}/{} tasks",
                    job.id,
                    format_state(job.state),
                    job.recipe,
                    job.completed_tasks.len(),
                    job.tasks_total(),
                );
            }
        }
        Commands::Show { data, id } => {
            let scheduler = open_data(&data).await?;
            let Some(job) = scheduler.get_job(&id).await? else {
                println!("Job not found");
                return Ok(());
            };
            print_job(&scheduler, &job).await?;
        }
    }

    Ok(())
}

fn parse_args(args: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(args).context("parsing --args")? {
        Value::Object(map) => Ok(map),
        other => bail!("--args must be a JSON object, got {}", other),
    }
}

/// Open a data directory for reading. Nothing is dispatched.
async fn open_data(dir: &Path) -> Result<Scheduler> {
    if !dir.is_dir() {
        bail!("no data directory at {}", dir.display());
    }
    Ok(Scheduler::open(
        dir,
        Arc::new(DirRecipeStore::new(dir)),
        Arc::new(SimulatedSubstrate::new()),
        Arc::new(BroadcastBus::default()),
        SchedulerConfig::default(),
    )
    .await?)
}

async fn print_job(scheduler: &Scheduler, job: &JobRecord) -> Result<()> {
    println!("Job: {}", job.id);
    println!("  Recipe: {}", job.recipe);
    println!("  State: {}", format_state(job.state));
    println!(
        "  Work: {:.1} of {:.1} done, {:.1} failed",
        job.work_completed, job.work_total, job.work_failed
    );

    let tasks = scheduler.job_tasks(&job.id).await?;
    println!("Tasks ({})", tasks.len());
    for task in &tasks {
        println!("  {} | {}", format_state(task.state), task.task_id);
    }

    println!("Log");
    print_logs(&scheduler.job_logs(&job.id).await?, "");
    for task in &tasks {
        print_logs(&scheduler.task_logs(&task.id).await?, &task.task_id);
    }
    Ok(())
}

fn print_logs(entries: &[LogEntry], prefix: &str) {
    for entry in entries {
        if prefix.is_empty() {
            println!("  {} [{}] {}", entry.timestamp, entry.level, entry.message);
        } else {
            println!("  {} [{}] {}: {}", entry.timestamp, entry.level, prefix, entry.message);
        }
    }
}

fn format_state(state: RunState) -> &'static str {
    match state {
        RunState::Ready => "READY",
        RunState::Running => "RUNNING",
        RunState::Cancelling => "CANCELLING",
        RunState::Waiting => "WAITING",
        RunState::Completed => "COMPLETED",
        RunState::Cancelled => "CANCELLED",
        RunState::Failed => "FAILED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = parse_args(r#"{"frames": [1, 3]}"#).unwrap();
        assert_eq!(args["frames"], serde_json::json!([1, 3]));
        assert!(parse_args("[1, 2]").is_err());
        assert!(parse_args("not json").is_err());
    }

    #[test]
    fn test_cli_parses_simulate() {
        let cli = Cli::try_parse_from([
            "factory", "simulate", "--recipes", "recipes", "--recipe", "render", "--args",
            r#"{"frames":[1,2]}"#, "--concurrency-limit", "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Simulate { recipe, concurrency_limit, run_time_ms, .. } => {
                assert_eq!(recipe, "render");
                assert_eq!(concurrency_limit, Some(2));
                assert_eq!(run_time_ms, 200);
            }
            _ => panic!("expected simulate"),
        }
    }
}
