use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use sync_agent::commands::{LeaseWorker, WorkflowExecutor};
use sync_agent::config::{AgentConfig, ConfigDefaults, ConfigManager, ConfigStore};
use sync_agent::remote::{Credentials, HttpWorkflowExecutor, ServerClient, UnconfiguredExecutor};
use sync_agent::scheduler::Scheduler;
use sync_agent::tasks::{config_sync_task, status_report_task};

/// How long shutdown waits for in-flight commands.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env().context("Failed to read SYNC_AGENT_* environment")?;
    let _log_guard = init_tracing(&config)?;
    install_panic_hook();

    eprintln!("🔄 Sync Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent: {}", config.agent_id);
    eprintln!("   Server: {}", config.server_url);
    eprintln!("   Cache: {}", config.cache_path.display());

    // ── Remote ──────────────────────────────────────────────────────────
    let credentials = Arc::new(Credentials::new(config.token.clone()));
    if config.token.is_none() {
        tracing::warn!("SYNC_AGENT_TOKEN not set; command polling idles until a token is installed");
    }
    let client = Arc::new(ServerClient::new(
        config.server_url.clone(),
        Arc::clone(&credentials),
        config.http_timeout,
    )?);
    let executor: Arc<dyn WorkflowExecutor> = match &config.workflow_url {
        Some(url) => Arc::new(HttpWorkflowExecutor::new(
            url.clone(),
            Arc::clone(&credentials),
            config.http_timeout,
        )?),
        None => {
            tracing::warn!("SYNC_AGENT_WORKFLOW_URL not set; commands will be failed");
            Arc::new(UnconfiguredExecutor)
        }
    };

    // ── Scheduler + config ──────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new());
    let config_manager = Arc::new(ConfigManager::new(
        config.agent_id.clone(),
        ConfigStore::new(config.cache_path.clone()),
        client.clone(),
        Arc::clone(&scheduler),
        ConfigDefaults::builtin(),
    ));

    // ── Tasks ───────────────────────────────────────────────────────────
    let lease_worker = Arc::new(LeaseWorker::new(
        config.agent_id.clone(),
        client.clone(),
        executor,
        Arc::clone(&config_manager),
        Arc::clone(&credentials),
    ));
    scheduler
        .catalog_task(Arc::new(lease_worker.into_task()))
        .await;
    scheduler
        .catalog_task(Arc::new(config_sync_task(Arc::clone(&config_manager))))
        .await;
    scheduler
        .catalog_task(Arc::new(status_report_task(
            Arc::clone(&scheduler),
            Some(Arc::clone(&lease_worker)),
        )))
        .await;

    let source = config_manager
        .load()
        .await
        .context("Failed to load agent configuration")?;
    tracing::info!(
        source = ?source,
        version = config_manager.version().await,
        tasks = scheduler.len().await,
        "Configuration loaded"
    );

    let pulled = config_manager.pull().await;
    let submitted = config_manager.submit().await;
    tracing::info!(pull = ?pulled, submit = ?submitted, "Initial config sync");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    scheduler.shutdown().await;
    if tokio::time::timeout(SHUTDOWN_GRACE, lease_worker.shutdown())
        .await
        .is_err()
    {
        tracing::warn!(
            in_flight = ?lease_worker.in_flight(),
            "Command workers did not finish in time"
        );
    }
    tracing::info!("Sync agent stopped");
    Ok(())
}

/// Stderr logging plus an optional daily-rolling file.
fn init_tracing(config: &AgentConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "sync-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init()
        .context("Failed to initialise tracing")?;
    Ok(guard)
}

/// Route panics anywhere in the process through tracing with a backtrace.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!(panic = %message, location = %location, backtrace = %backtrace, "Panic");
    }));
}
