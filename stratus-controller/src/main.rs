use std::sync::Arc;
use std::time::Duration;

use stratus_controller::config::ControllerConfig;
use stratus_controller::db::Database;
use stratus_controller::inventory::HttpInventory;
use stratus_controller::lock::{LockStore, MemoryLockStore, RedisLockStore};
use stratus_controller::orchestrator::OrchestratorConfig;
use stratus_controller::planner::Planner;
use stratus_controller::scheduler::SchedulerService;
use stratus_controller::state::AppState;
use stratus_controller::store::MigrationStore;
use stratus_controller::worker::{self, MigrationQueue, WorkerContext};
use stratus_controller::{api, driver};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ControllerConfig::load();
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(anyhow::anyhow!("Invalid configuration: {}", e));
    }
    info!("Configuration loaded successfully");
    let config = Arc::new(config);

    // Database
    let database = Arc::new(
        Database::new(&config.database.url, config.database.max_connections).await?,
    );
    database.migrate().await?;
    info!("Database initialized");

    let store = MigrationStore::new(database.pool().clone());

    // Advisory lock store; a single-node dev setup can run without redis
    let lock_store: Arc<dyn LockStore> = match RedisLockStore::connect(&config.lock.redis_url).await
    {
        Ok(redis) => Arc::new(redis),
        Err(e) => {
            warn!(
                "Redis unavailable ({}); falling back to in-process advisory locks",
                e
            );
            Arc::new(MemoryLockStore::new())
        }
    };

    let driver = driver::build(&config.driver)?;
    if config.driver.simulate {
        warn!("SIMULATE_MIGRATIONS is set; no live transfers will be performed");
    }

    // Worker pool
    let (queue, queue_rx) = MigrationQueue::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_ctx = Arc::new(WorkerContext {
        store: store.clone(),
        pool: database.pool().clone(),
        lock_store,
        driver,
        lock_ttl: Duration::from_secs(config.lock.ttl_secs),
        lock_wait: Duration::from_secs(config.lock.wait_secs),
        orchestrator: OrchestratorConfig {
            simulate: config.driver.simulate,
            poll_interval: Duration::from_secs(config.worker.poll_interval_secs),
            poll_timeout: Duration::from_secs(config.worker.poll_timeout_secs),
            ..OrchestratorConfig::default()
        },
        max_retries: 3,
        retry_backoff: Duration::from_secs(10),
    });
    let worker_handles = worker::spawn_workers(
        config.worker.count,
        worker_ctx,
        queue_rx,
        shutdown_rx.clone(),
    );

    // Jobs left queued by a previous run
    worker::requeue_queued(&store, &queue).await?;

    // Scheduler service
    let inventory = Arc::new(HttpInventory::new(&config.inventory)?);
    let planner = Planner::new(config.scheduler.clone(), config.policy.clone());
    let scheduler = Arc::new(SchedulerService::new(
        inventory,
        store.clone(),
        database.pool().clone(),
        queue.clone(),
        planner,
        config.scheduler.clone(),
    ));
    tokio::spawn(scheduler.clone().run_periodic(shutdown_rx.clone()));

    // HTTP API
    let state = Arc::new(AppState {
        config: config.clone(),
        database: database.clone(),
        store,
        queue,
        scheduler,
    });
    let app = api::router(state);

    let listener = TcpListener::bind(&config.server.bind).await?;
    info!("Stratus controller listening on {}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    // the shutdown signal already reached scheduler and workers
    for handle in worker_handles {
        let _ = handle.await;
    }
    database.close().await;
    info!("Shutdown complete");

    Ok(())
}

/// Resolve on SIGTERM/SIGINT and fan the shutdown out to background tasks
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to register SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);
}
