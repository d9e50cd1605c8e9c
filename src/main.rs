use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use taskloom::model::{NewTask, TaskStatus};
use taskloom::repository::TaskFilter;
use taskloom::runner::{client::GatewayClient, Worker};
use taskloom::{gateway, Config, GatewayState, Repository, Store};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "taskloom",
    about = "Durable task lifecycle engine — lease queue, phase pipeline runner, NDJSON streaming gateway",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway server.
    ///
    /// Serves the REST surface (task queue/lease/lifecycle routes) and the
    /// NDJSON `/tasks/run` streaming endpoint. Reads `QUEUE_*` env vars for
    /// the listen port and database path.
    ///
    /// Examples:
    ///   taskloom gateway
    Gateway,

    /// Start a Phase Runner worker loop.
    ///
    /// Polls the gateway for leased tasks, drives the mode-selected phase
    /// pipeline against the chosen provider CLI, and reports completion.
    /// Runs until killed.
    ///
    /// Examples:
    ///   taskloom worker
    ///   taskloom worker --provider codex
    ///   taskloom worker --provider claude --stream-job-logs
    Worker {
        /// Provider adapter to drive phase subprocesses with.
        #[arg(long, default_value = "claude")]
        provider: String,

        /// Echo each raw subprocess output line to stderr as it's captured,
        /// in addition to forwarding it as a model-event envelope.
        #[arg(long)]
        stream_job_logs: bool,
    },

    /// Open the store and apply pending schema migrations.
    ///
    /// Safe to re-run: migrations are idempotent `CREATE TABLE IF NOT EXISTS`
    /// statements. Useful for provisioning a database file before the
    /// gateway or a worker ever start.
    ///
    /// Examples:
    ///   taskloom db:migrate
    #[command(name = "db:migrate")]
    DbMigrate,

    /// Print per-status task counts and the 10 most recent events.
    ///
    /// Examples:
    ///   taskloom status
    Status,

    /// List tasks, optionally filtered by status.
    ///
    /// Examples:
    ///   taskloom tasks:list
    ///   taskloom tasks:list --status queued
    #[command(name = "tasks:list")]
    TasksList {
        #[arg(long)]
        status: Option<String>,
    },

    /// Create a new task in the queue.
    ///
    /// Examples:
    ///   taskloom tasks:create --prompt "say hi"
    ///   taskloom tasks:create --prompt "refactor the parser" --mode full --priority 2
    #[command(name = "tasks:create")]
    TasksCreate {
        #[arg(long)]
        prompt: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long = "type")]
        task_type: Option<String>,

        #[arg(long)]
        mode: Option<String>,

        #[arg(long)]
        priority: Option<i64>,

        #[arg(long)]
        success: Option<String>,
    },

    /// Tail the global or per-task event log.
    ///
    /// Examples:
    ///   taskloom events:tail
    ///   taskloom events:tail --limit 50
    ///   taskloom events:tail --task-id 3f9c2e1a-...
    #[command(name = "events:tail")]
    EventsTail {
        #[arg(long, default_value_t = 20)]
        limit: i64,

        #[arg(long = "task-id")]
        task_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let args = Args::parse();
    let config = Config::from_env().context("loading configuration from environment")?;

    match args.command {
        Command::Gateway => run_gateway(config).await,
        Command::Worker {
            provider,
            stream_job_logs,
        } => run_worker(config, provider, stream_job_logs).await,
        Command::DbMigrate => run_db_migrate(config).await,
        Command::Status => run_status(config).await,
        Command::TasksList { status } => run_tasks_list(config, status).await,
        Command::TasksCreate {
            prompt,
            title,
            task_type,
            mode,
            priority,
            success,
        } => run_tasks_create(config, prompt, title, task_type, mode, priority, success).await,
        Command::EventsTail { limit, task_id } => run_events_tail(config, limit, task_id).await,
    }
}

/// Initialize the tracing subscriber. Reads `RUST_LOG`, defaulting to `info`.
fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();
}

async fn open_repository(config: &Config) -> Result<Repository> {
    let store = Store::open(&config.db_path).await?;
    Ok(Repository::new(store))
}

async fn run_gateway(config: Config) -> Result<()> {
    let repo = open_repository(&config).await?;
    let state = GatewayState::new(Arc::new(config), Arc::new(repo));
    gateway::serve(state).await
}

async fn run_worker(config: Config, provider: String, stream_job_logs: bool) -> Result<()> {
    if stream_job_logs {
        // Read by the pipeline's subprocess capture loop — it echoes each
        // raw output line to stderr when this is set.
        std::env::set_var("TASKLOOM_STREAM_JOB_LOGS", "1");
    }

    let client = GatewayClient::new(config.worker_api_base_url.clone());
    let worker = Worker::new(
        client,
        provider,
        Duration::from_millis(config.worker_poll_ms),
        config.worker_lease_ttl_ms,
        Duration::from_millis(config.worker_phase_timeout_ms),
    );

    info!(base_url = %config.worker_api_base_url, "worker starting");
    worker.run_forever().await
}

async fn run_db_migrate(config: Config) -> Result<()> {
    let _store = Store::open(&config.db_path).await?;
    println!("migrations applied at {}", config.db_path.display());
    Ok(())
}

async fn run_status(config: Config) -> Result<()> {
    let repo = open_repository(&config).await?;

    let tasks = repo.list_tasks(&TaskFilter::default()).await?;
    let mut counts = std::collections::BTreeMap::new();
    for task in &tasks {
        *counts.entry(task.status.clone()).or_insert(0usize) += 1;
    }

    println!("task counts:");
    for status in [
        TaskStatus::Queued,
        TaskStatus::Leased,
        TaskStatus::Running,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Blocked,
    ] {
        let n = counts.get(status.as_str()).copied().unwrap_or(0);
        println!("  {:<10} {n}", status.as_str());
    }

    println!("\nrecent events:");
    let events = repo.list_events(10, None).await?;
    for event in events {
        println!(
            "  [{}] {} {} {}",
            event.created_at,
            event.level,
            event.task_id.as_deref().unwrap_or("-"),
            event.message
        );
    }

    Ok(())
}

async fn run_tasks_list(config: Config, status: Option<String>) -> Result<()> {
    let repo = open_repository(&config).await?;
    let tasks = repo.list_tasks(&TaskFilter { status }).await?;

    println!(
        "{:<36} {:<8} {:<10} {:<4} {}",
        "id", "status", "mode", "pri", "title"
    );
    for task in tasks {
        println!(
            "{:<36} {:<8} {:<10} {:<4} {}",
            task.id, task.status, task.mode, task.priority, task.title
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_tasks_create(
    config: Config,
    prompt: String,
    title: Option<String>,
    task_type: Option<String>,
    mode: Option<String>,
    priority: Option<i64>,
    success: Option<String>,
) -> Result<()> {
    let max_attempts = config.max_attempts as i64;
    let repo = open_repository(&config).await?;
    let task = repo
        .create_task(
            NewTask {
                r#type: task_type,
                title,
                prompt,
                success_criteria: success,
                priority,
                mode,
                metadata: None,
                max_attempts: None,
            },
            max_attempts,
        )
        .await?;
    println!("{}", task.id);
    Ok(())
}

async fn run_events_tail(config: Config, limit: i64, task_id: Option<String>) -> Result<()> {
    let repo = open_repository(&config).await?;
    let events = repo.list_events(limit, task_id.as_deref()).await?;
    for event in events {
        println!(
            "[{}] {} {:<8} {} {}",
            event.created_at,
            event.task_id.as_deref().unwrap_or("-"),
            event.level,
            event.phase.as_deref().unwrap_or("-"),
            event.message
        );
    }
    Ok(())
}
