//! Relist Server - Main entry point

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use relist_core::{
    api::{self, AppState},
    config::Config,
    db::{Database, PgTenantDirectory, TenantDirectory},
    handlers::HandlerRegistry,
    jobs::{
        ActionRegistry, CleanupScheduler, JobProcessor, JobStore, JobWorker, PgJobStore,
        PgStatsSink, RetryPolicy, TerminalHooks,
    },
    keepalive::KeepaliveService,
    observability::{self, metrics},
    ratelimit::LimiterSet,
    rpc::{ExecutorAuth, ExecutorGateway, ExecutorRegistry, RpcClient},
};

#[derive(Parser)]
#[command(name = "relist-server", version, about = "Relist marketplace job orchestration")]
struct Cli {
    /// Configuration file (environment variables override it)
    #[arg(short, long, env = "RELIST_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server, workers, keepalive and cleanup (default)
    Serve,
    /// Run one cleanup sweep over every tenant, then exit
    Cleanup,
    /// Apply shared migrations and sync the action table, then exit
    Migrate,
}

/// Store-side services shared by every subcommand.
struct Core {
    db: Database,
    directory: Arc<dyn TenantDirectory>,
    store: Arc<dyn JobStore>,
    actions: Arc<ActionRegistry>,
    hooks: TerminalHooks,
}

impl Core {
    async fn connect(config: &Config) -> anyhow::Result<Self> {
        let db = Database::new(&config.database).await?;
        tracing::info!("Connected to database");

        let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db.pool().clone()));
        let hooks = TerminalHooks::new(store.clone(), Arc::new(PgStatsSink::new(db.pool().clone())));

        Ok(Self {
            directory: Arc::new(PgTenantDirectory::new(db.pool().clone())),
            store,
            actions: Arc::new(ActionRegistry::builtin()),
            hooks,
            db,
        })
    }

    fn cleanup(&self, config: &Config) -> CleanupScheduler {
        CleanupScheduler::new(
            self.store.clone(),
            self.directory.clone(),
            self.hooks.clone(),
            config.cleanup.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = match cli.config.as_deref() {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;
    config.validate()?;

    observability::init("relist-server", &config.observability)?;

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Cleanup => cleanup_once(config).await,
        Command::Migrate => migrate(config).await,
    };

    observability::shutdown();
    result
}

async fn migrate(config: Config) -> anyhow::Result<()> {
    let core = Core::connect(&config).await?;
    core.db.migrate().await?;
    core.db.sync_action_types(&core.actions).await?;
    tracing::info!("Migrations applied");
    Ok(())
}

async fn cleanup_once(config: Config) -> anyhow::Result<()> {
    let core = Core::connect(&config).await?;
    let report = core.cleanup(&config).run_once().await?;
    tracing::info!(
        tenants = report.tenants_scanned,
        expired = report.expired,
        failed_stuck = report.failed_stuck,
        skipped_locked = report.skipped_locked,
        errors = report.errors,
        "Cleanup finished"
    );
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Relist Server");

    let prometheus = metrics::install_prometheus()?;
    let core = Core::connect(&config).await?;
    core.db.migrate().await?;
    core.db.sync_action_types(&core.actions).await?;

    // Executor channel
    let registry = Arc::new(ExecutorRegistry::new());
    let rpc = RpcClient::new(registry, config.executor.timeouts.clone());
    let auth = ExecutorAuth::new(&config.executor, core.directory.clone());
    let gateway = Arc::new(ExecutorGateway::new(auth, rpc.clone(), config.executor.outbound_buffer));

    // Job execution
    let limiters = LimiterSet::from_settings(&config.rate_limit)?;
    let handlers = Arc::new(HandlerRegistry::with_defaults(&core.actions));
    let processor = JobProcessor::new(
        core.store.clone(),
        handlers,
        core.actions.clone(),
        rpc.clone(),
        limiters,
        RetryPolicy::from_config(&config.jobs),
        core.hooks.clone(),
    )
    .with_claim_batch_size(config.worker.claim_batch_size);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = JobWorker::new(processor, core.directory.clone(), config.worker.clone())
        .start(shutdown_rx.clone());
    let keepalive = KeepaliveService::new(rpc, config.keepalive.clone());
    let keepalive_task = tokio::spawn(keepalive.clone().run(shutdown_rx.clone()));
    let cleanup_task = tokio::spawn(core.cleanup(&config).run(shutdown_rx.clone()));

    let app = api::build_router(AppState {
        gateway,
        keepalive,
        prometheus: Some(prometheus),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    tracing::info!(address = %addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    server.await??;
    worker.stop().await;
    let _ = keepalive_task.await;
    let _ = cleanup_task.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
