//! `flowforge` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`   : start the intake API.
//! - `worker`  : run executions, AI tasks, schedules and inbox watches.
//! - `migrate` : run pending database migrations.
//! - `validate`: validate a workflow JSON file.
//! - `run`     : run one execution job in-process against in-memory stores.

mod runtime;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use db::models::CredentialRow;
use db::MemoryStore;
use engine::{ExecutionJob, ExecutionWorker, WorkflowDefinition, WorkerConfig};
use queue::{MemoryBus, MemoryQueue};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use triggers::{ImapConfig, ScheduleRegistry};
use uuid::Uuid;

use runtime::{shutdown_signal, Backend, Runtime, RuntimeSettings};

#[derive(Parser)]
#[command(name = "flowforge", about = "Workflow automation engine", version)]
struct Cli {
    /// Log as JSON lines instead of human-readable text.
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP intake API.
    Serve(ServeArgs),
    /// Consume execution jobs and run the trigger subsystems.
    Worker(WorkerArgs),
    /// Run pending database migrations.
    Migrate(DatabaseArgs),
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Run one execution job JSON file in-process.
    Run(RunArgs),
}

#[derive(Args)]
struct DatabaseArgs {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,
}

#[derive(Args)]
struct ServeArgs {
    #[command(flatten)]
    database: DatabaseArgs,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
}

#[derive(Args)]
struct ExecutionArgs {
    /// LLM calls in flight at once.
    #[arg(long, env = "AI_WORKER_CONCURRENCY", default_value_t = 5)]
    ai_workers: usize,

    #[arg(long, env = "INBOX_POLL_SECS", default_value_t = 30)]
    inbox_poll_secs: u64,

    #[arg(long, env = "IMAP_HOST", default_value = "imap.gmail.com")]
    imap_host: String,

    #[arg(long, env = "IMAP_PORT", default_value_t = 993)]
    imap_port: u16,
}

impl ExecutionArgs {
    fn settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            ai_workers: self.ai_workers,
            inbox_poll: Duration::from_secs(self.inbox_poll_secs.max(1)),
            imap: ImapConfig {
                host: self.imap_host.clone(),
                port: self.imap_port,
                ..Default::default()
            },
        }
    }
}

#[derive(Args)]
struct WorkerArgs {
    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    execution: ExecutionArgs,

    /// Executions run in parallel.
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 4)]
    workers: usize,
}

#[derive(Args)]
struct RunArgs {
    /// Path to an execution job JSON file.
    job: PathBuf,

    /// JSON array of `{ application, data }` credentials owned by the job's user.
    #[arg(long)]
    credentials: Option<PathBuf>,

    #[command(flatten)]
    execution: ExecutionArgs,
}

#[derive(Deserialize)]
struct CredentialFileEntry {
    application: String,
    data: Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Worker(args) => worker(args).await,
        Command::Migrate(args) => {
            let pool = db::pool::create_pool(&args.database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool)
                .await
                .context("migration failed")?;
            info!("migrations applied");
            Ok(())
        }
        Command::Validate { path } => {
            let definition: WorkflowDefinition = read_json(&path)?;
            match engine::validate_dag(&definition) {
                Ok(order) => {
                    println!("workflow is valid; execution order: {}", order.join(" -> "));
                    Ok(())
                }
                Err(e) => {
                    eprintln!("validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Run(args) => run(args).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let backend = Backend::postgres(&args.database.database_url, args.database.max_connections).await?;
    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("cannot bind {}", args.bind))?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let state = api::AppState {
        workflows: backend.workflows,
        queue: backend.jobs,
        bus: backend.bus,
    };
    api::serve(listener, state, shutdown)
        .await
        .context("intake API failed")
}

async fn worker(args: WorkerArgs) -> anyhow::Result<()> {
    let backend = Backend::postgres(&args.database.database_url, args.database.max_connections).await?;
    let Runtime {
        orchestrator,
        ai_pool,
        ai_tasks,
        inbox,
    } = Runtime::assemble(&backend, &args.execution.settings());

    let ai_pool = tokio::spawn(async move { ai_pool.run().await });

    let schedules = ScheduleRegistry::new(Arc::clone(&backend.workflows), Arc::clone(&backend.jobs));
    schedules
        .start(Arc::clone(&backend.bus))
        .await
        .context("failed to start schedule registry")?;
    inbox.start().await.context("failed to start inbox monitor")?;

    let shutdown = CancellationToken::new();
    let execution_worker = ExecutionWorker::new(
        Arc::clone(&backend.jobs),
        orchestrator,
        WorkerConfig {
            concurrency: args.workers,
        },
    );
    let executions = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { execution_worker.run(shutdown).await }
    });

    shutdown_signal().await;
    info!("shutting down");

    // Triggers first so nothing new arrives, then drain in-flight runs, then
    // the AI pool they may still be waiting on.
    schedules.shutdown();
    inbox.shutdown();
    shutdown.cancel();
    executions.await.context("execution worker panicked")?;
    ai_tasks.close();
    ai_pool.await.context("AI worker pool panicked")?;

    info!("shutdown complete");
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let job: ExecutionJob = read_json(&args.job)?;
    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &args.credentials {
        let entries: Vec<CredentialFileEntry> = read_json(path)?;
        for entry in entries {
            store.insert_credential(CredentialRow {
                id: Uuid::new_v4(),
                user_id: job.user_id,
                application: entry.application,
                data: entry.data,
            });
        }
    }

    let backend = Backend {
        workflows: store.clone(),
        credentials: store.clone(),
        executions: store.clone(),
        jobs: Arc::new(MemoryQueue::<ExecutionJob>::new()),
        bus: Arc::new(MemoryBus::new()),
    };
    let Runtime {
        orchestrator,
        ai_pool,
        ai_tasks,
        inbox,
    } = Runtime::assemble(&backend, &args.execution.settings());
    let ai_pool = tokio::spawn(async move { ai_pool.run().await });

    let outcome = orchestrator.run(&job).await.context("execution aborted")?;

    inbox.shutdown();
    ai_tasks.close();
    ai_pool.await.context("AI worker pool panicked")?;

    match store.executions().into_iter().find(|r| r.id == job.execution_id) {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("workflow graph contains a cycle; nothing ran"),
    }
    if !outcome.is_completed() {
        std::process::exit(1);
    }
    Ok(())
}
