//! Wiring of stores, queues and subsystems shared by the long-running
//! commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use db::{CredentialStore, ExecutionStore, PgEventBus, PgJobQueue, PgStore, WorkflowStore};
use engine::{EventPublisher, ExecutionJob, Orchestrator, EXECUTION_TOPIC};
use nodes::ai::{AiCorrelator, AiTask, AiTaskClient, AiWorkerPool, OpenAiCompatibleProvider};
use nodes::{ActionServices, DispatcherConfig};
use queue::{Correlator, EventBus, JobQueue, MemoryQueue};
use tracing::info;
use triggers::{ImapConfig, ImapConnector, InboxMonitor, MonitorConfig};

/// Store, queue and bus handles behind trait objects.
pub struct Backend {
    pub workflows: Arc<dyn WorkflowStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub jobs: Arc<dyn JobQueue<ExecutionJob>>,
    pub bus: Arc<dyn EventBus>,
}

impl Backend {
    pub async fn postgres(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = db::pool::create_pool(database_url, max_connections)
            .await
            .context("failed to connect to database")?;
        info!(max_connections, "database pool ready");

        let store = Arc::new(PgStore::new(pool.clone()));
        Ok(Self {
            workflows: store.clone(),
            credentials: store.clone(),
            executions: store,
            jobs: Arc::new(PgJobQueue::new(pool.clone(), EXECUTION_TOPIC)),
            bus: Arc::new(PgEventBus::new(pool)),
        })
    }
}

pub struct RuntimeSettings {
    pub ai_workers: usize,
    pub inbox_poll: Duration,
    pub imap: ImapConfig,
}

/// The execution side of the system: orchestrator, AI pool and inbox
/// monitor, sharing one set of action services.
pub struct Runtime {
    pub orchestrator: Orchestrator,
    pub ai_pool: AiWorkerPool,
    /// Closing this stops the AI pool once its queued tasks are done.
    pub ai_tasks: Arc<MemoryQueue<AiTask>>,
    pub inbox: InboxMonitor,
}

impl Runtime {
    pub fn assemble(backend: &Backend, settings: &RuntimeSettings) -> Self {
        let config = DispatcherConfig::default();

        let ai_tasks = Arc::new(MemoryQueue::<AiTask>::new());
        let correlator: Arc<AiCorrelator> =
            Arc::new(Correlator::new(ai_tasks.clone() as Arc<dyn JobQueue<AiTask>>));

        let inbox = InboxMonitor::new(
            Arc::clone(&backend.workflows),
            Arc::clone(&backend.credentials),
            Arc::clone(&backend.jobs),
            Arc::new(ImapConnector::new(settings.imap.clone())),
            MonitorConfig {
                poll_interval: settings.inbox_poll,
                ..Default::default()
            },
        );

        let services = ActionServices::new(config.clone())
            .with_ai(AiTaskClient::new(correlator.clone(), config.ai_timeout))
            .with_inbox(Arc::new(inbox.clone()));
        let provider = Arc::new(OpenAiCompatibleProvider::new(services.http.clone()));
        let ai_pool = AiWorkerPool::new(correlator, provider, settings.ai_workers)
            .with_call_timeout(config.ai_timeout);

        let orchestrator = Orchestrator::new(
            Arc::clone(&backend.credentials),
            Arc::clone(&backend.executions),
            Arc::new(services),
            EventPublisher::new(Arc::clone(&backend.bus)),
        );

        Self {
            orchestrator,
            ai_pool,
            ai_tasks,
            inbox,
        }
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
