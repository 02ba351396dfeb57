//! Migration worker pool
//!
//! Workers pick queued migration ids off an in-process channel and run
//! the orchestrator under the per-VM advisory lock. Lock timeouts and
//! other infrastructure errors get a bounded retry; the migration row is
//! left `queued` after exhaustion so a later enqueue can pick it up.
//! State transitions themselves are final and never retried.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::SqlitePool;
use stratus_common::{Error, EventLevel, MigrationStatus, Result};
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use crate::driver::HypervisorDriver;
use crate::lock::{self, LockStore};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::store::{MigrationStore, TransitionFields};

/// Producer half of the migration queue
#[derive(Clone)]
pub struct MigrationQueue {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl MigrationQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, id: Uuid) -> Result<()> {
        self.tx
            .send(id)
            .map_err(|_| Error::System("Migration queue is closed".to_string()))?;
        tracing::debug!("Enqueued migration {}", id);
        Ok(())
    }
}

/// Everything a worker needs to run one migration
pub struct WorkerContext {
    pub store: MigrationStore,
    pub pool: SqlitePool,
    pub lock_store: Arc<dyn LockStore>,
    pub driver: Arc<dyn HypervisorDriver>,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub orchestrator: OrchestratorConfig,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

/// Spawn `count` workers draining the shared receiver until shutdown.
pub fn spawn_workers(
    count: usize,
    ctx: Arc<WorkerContext>,
    rx: mpsc::UnboundedReceiver<Uuid>,
    shutdown: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..count)
        .map(|n| {
            let ctx = ctx.clone();
            let rx = rx.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                tracing::info!("Migration worker {} started", n);
                loop {
                    let id = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            id = rx.recv() => match id {
                                Some(id) => id,
                                None => break,
                            },
                            _ = shutdown.changed() => break,
                        }
                    };
                    if let Err(e) = run_with_retries(&ctx, id).await {
                        tracing::error!("Migration {} stayed queued: {}", id, e);
                    }
                }
                tracing::info!("Migration worker {} stopped", n);
            })
        })
        .collect()
}

/// Re-enqueue migrations left `queued` by a previous run
pub async fn requeue_queued(store: &MigrationStore, queue: &MigrationQueue) -> Result<usize> {
    let ids = store.queued_ids().await?;
    for id in &ids {
        queue.enqueue(*id)?;
    }
    if !ids.is_empty() {
        tracing::info!("Re-enqueued {} queued migration(s) from a previous run", ids.len());
    }
    Ok(ids.len())
}

/// Run one migration, retrying infrastructure errors a bounded number of
/// times. Terminal outcomes are recorded inside `run_one` and are Ok here.
pub async fn run_with_retries(ctx: &WorkerContext, id: Uuid) -> Result<()> {
    let mut attempt = 0;
    loop {
        match run_one(ctx, id).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < ctx.max_retries => {
                attempt += 1;
                tracing::warn!(
                    "Transient failure on migration {} (attempt {}): {}; retrying",
                    id,
                    attempt,
                    e
                );
                tokio::time::sleep(ctx.retry_backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run_one(ctx: &WorkerContext, id: Uuid) -> Result<()> {
    let migration = match ctx.store.get(id).await {
        Ok(m) => m,
        Err(Error::MigrationNotFound(_)) => {
            tracing::warn!("Dequeued unknown migration {}", id);
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    // anything past queued is owned by another worker or already done
    if migration.status != MigrationStatus::Queued {
        tracing::debug!(
            "Migration {} already in status {}, skipping",
            id,
            migration.status
        );
        return Ok(());
    }

    let guard = lock::acquire(
        ctx.lock_store.clone(),
        &lock::vm_lock_name(migration.vm_id),
        ctx.lock_ttl,
        ctx.lock_wait,
    )
    .await?;

    let result = run_locked(ctx, id).await;

    if let Err(e) = guard.release().await {
        tracing::warn!("Failed to release lock for migration {}: {}", id, e);
    }

    result
}

async fn run_locked(ctx: &WorkerContext, id: Uuid) -> Result<()> {
    // re-read under the lock; another worker may have claimed it while we
    // were waiting
    let migration = ctx.store.get(id).await?;
    if migration.status != MigrationStatus::Queued {
        tracing::debug!("Migration {} claimed elsewhere, skipping", id);
        return Ok(());
    }

    let migration = match ctx
        .store
        .transition(
            id,
            MigrationStatus::Validating,
            TransitionFields { progress: Some(1), details: None },
        )
        .await
    {
        Ok(m) => m,
        Err(Error::InvalidTransition { .. }) => return Ok(()),
        Err(e) => return Err(e),
    };

    let orchestrator = Orchestrator::new(
        ctx.store.clone(),
        ctx.pool.clone(),
        ctx.driver.clone(),
        ctx.orchestrator.clone(),
    );

    match orchestrator.run(&migration).await {
        Ok(status) => {
            tracing::info!("Migration {} finished with status {}", id, status);
            Ok(())
        }
        Err(e) => {
            // the orchestrator records expected failures itself; anything
            // surfacing here is unexpected and must not leak
            tracing::error!("Orchestrator error for migration {}: {}", id, e);
            let details = json!({"error": "orchestrator_exception", "detail": e.to_string()});
            let _ = ctx
                .store
                .append_event(id, EventLevel::Error, "Unhandled orchestrator error", Some(details.clone()))
                .await;
            mark_failed(ctx, id, details).await;
            Ok(())
        }
    }
}

/// Transition to failed, retrying once; a second failure leaves the row
/// in its prior state for the next tick.
async fn mark_failed(ctx: &WorkerContext, id: Uuid, details: serde_json::Value) {
    for attempt in 0..2 {
        match ctx
            .store
            .transition(
                id,
                MigrationStatus::Failed,
                TransitionFields { progress: None, details: Some(details.clone()) },
            )
            .await
        {
            Ok(_) => return,
            // already terminal: nothing to record
            Err(Error::InvalidTransition { .. }) => return,
            Err(e) if attempt == 0 => {
                tracing::warn!("Failed to mark migration {} failed, retrying once: {}", id, e);
            }
            Err(e) => {
                tracing::error!("Leaving migration {} in prior state: {}", id, e);
            }
        }
    }
}
