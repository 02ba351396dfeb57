//! Migration orchestrator
//!
//! Drives one claimed migration end-to-end: pre-flight eligibility via
//! the hypervisor driver, invocation of the transfer, polling, progress
//! updates, event logging, terminal status. Runs entirely while the
//! worker holds the per-VM advisory lock. Errors are recorded as events
//! and reflected in the final status; nothing raises out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use sqlx::SqlitePool;
use stratus_common::{Error, EventLevel, MigrationStatus, Result};
use uuid::Uuid;

use crate::db;
use crate::driver::{HypervisorDriver, MigrateResult, OpState};
use crate::store::{Migration, MigrationStore, TransitionFields};

/// Simulated transfer checkpoints
const SIMULATED_PROGRESS: [i64; 5] = [5, 25, 50, 80, 100];

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub simulate: bool,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub simulate_step_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            simulate: false,
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(300),
            simulate_step_delay: Duration::from_millis(500),
        }
    }
}

pub struct Orchestrator {
    store: MigrationStore,
    pool: SqlitePool,
    driver: Arc<dyn HypervisorDriver>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: MigrationStore,
        pool: SqlitePool,
        driver: Arc<dyn HypervisorDriver>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { store, pool, driver, config }
    }

    /// Run a migration already claimed into `validating` to its terminal
    /// state. The returned status is informational; all outcomes are
    /// persisted before returning.
    pub async fn run(&self, migration: &Migration) -> Result<MigrationStatus> {
        let id = migration.id;

        if self.store.cancel_requested(id).await? {
            return self.cancel(id, "cancel requested before start").await;
        }

        if self.config.simulate {
            return self.run_simulated(migration).await;
        }

        // resolve the hypervisor identity of the VM
        let vm = match db::vms::get(&self.pool, migration.vm_id).await {
            Ok(vm) => vm,
            Err(Error::VmNotFound(_)) => {
                return self
                    .fail(id, "vm_not_found", json!({"vm_id": migration.vm_id}))
                    .await
            }
            Err(e) => return Err(e),
        };
        let target_sr = migration
            .details
            .as_ref()
            .and_then(|d| d.get("target_sr"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        self.event(
            id,
            EventLevel::Info,
            &format!("Validating migration prerequisites for VM {}", vm.vm_uuid),
            None,
        )
        .await;

        match self.driver.get_vm(&vm.vm_uuid).await {
            Ok(info) => {
                self.event(
                    id,
                    EventLevel::Info,
                    &format!("Found VM on hypervisor: {}", vm.vm_uuid),
                    Some(json!({"name_label": info.name_label})),
                )
                .await;
            }
            Err(Error::VmNotFound(_)) => {
                return self
                    .fail(id, "vm_not_found_on_hypervisor", json!({"vm_uuid": vm.vm_uuid}))
                    .await;
            }
            Err(e) => {
                return self
                    .fail(id, "hypervisor_error", json!({"detail": e.to_string()}))
                    .await;
            }
        }

        let eligibility = match self.driver.probe(&vm.vm_uuid).await {
            Ok(e) => e,
            Err(e) => {
                return self
                    .fail(id, "migrate_check_failed", json!({"detail": e.to_string()}))
                    .await;
            }
        };
        if !eligibility.eligible {
            return self
                .fail(
                    id,
                    "not_eligible",
                    json!({
                        "detail": format!("VM not eligible for live migration: {}", eligibility.reason)
                    }),
                )
                .await;
        }
        self.event(
            id,
            EventLevel::Info,
            &format!("VM eligible for live migration: {}", eligibility.reason),
            None,
        )
        .await;

        self.store
            .transition(id, MigrationStatus::Running, TransitionFields::default())
            .await?;

        if self.store.cancel_requested(id).await? {
            return self.cancel(id, "cancel requested before invocation").await;
        }

        let outcome = match self
            .driver
            .migrate(&vm.vm_uuid, &migration.target_host, target_sr.as_deref())
            .await
        {
            Ok(MigrateResult::Invoked(outcome)) => outcome,
            Ok(MigrateResult::Unsupported { tried }) => {
                self.event(
                    id,
                    EventLevel::Warning,
                    "No supported migrate endpoint accepted the request",
                    Some(json!({"tried_count": tried.len()})),
                )
                .await;
                return self
                    .fail(id, "no_supported_endpoint", json!({"tried": tried}))
                    .await;
            }
            Err(e) => {
                return self
                    .fail(id, "driver_error", json!({"detail": e.to_string()}))
                    .await;
            }
        };

        self.event(
            id,
            EventLevel::Info,
            &format!("Migration invoked via {}", outcome.endpoint),
            Some(json!({"payload": outcome.payload, "response": outcome.response})),
        )
        .await;

        self.store
            .transition(id, MigrationStatus::Finalizing, TransitionFields::default())
            .await?;

        match outcome.op_id {
            Some(op_id) => self.poll_operation(id, &op_id, migration).await,
            None => {
                // fire-and-forget endpoint: no handle to poll
                self.bump_progress(id, 75).await;
                tokio::time::sleep(Duration::from_secs(1)).await;
                self.bump_progress(id, 100).await;
                self.complete(id, migration).await
            }
        }
    }

    async fn run_simulated(&self, migration: &Migration) -> Result<MigrationStatus> {
        let id = migration.id;
        self.event(id, EventLevel::Info, "Simulating live migration", None).await;

        self.store
            .transition(id, MigrationStatus::Running, TransitionFields::default())
            .await?;

        for pct in SIMULATED_PROGRESS {
            if self.store.cancel_requested(id).await? {
                return self.cancel(id, "cancel requested during simulation").await;
            }
            self.bump_progress(id, pct).await;
            self.event(
                id,
                EventLevel::Info,
                &format!("Transferring memory and state (simulated) {}%", pct),
                None,
            )
            .await;
            tokio::time::sleep(self.config.simulate_step_delay).await;
        }

        self.store
            .transition(id, MigrationStatus::Finalizing, TransitionFields::default())
            .await?;
        self.complete(id, migration).await
    }

    async fn poll_operation(
        &self,
        id: Uuid,
        op_id: &str,
        migration: &Migration,
    ) -> Result<MigrationStatus> {
        self.event(
            id,
            EventLevel::Info,
            &format!("Polling migration operation {}", op_id),
            None,
        )
        .await;

        let deadline = Instant::now() + self.config.poll_timeout;
        loop {
            if self.store.cancel_requested(id).await? {
                if let Err(e) = self.driver.abort(op_id).await {
                    self.event(
                        id,
                        EventLevel::Warning,
                        &format!("Abort of operation {} failed: {}", op_id, e),
                        None,
                    )
                    .await;
                }
                return self.cancel(id, "cancel requested during transfer").await;
            }

            if Instant::now() >= deadline {
                return self
                    .fail(id, "timeout", json!({"op_id": op_id}))
                    .await;
            }

            match self.driver.poll(op_id).await {
                Ok(status) => match status.state {
                    OpState::Succeeded => {
                        self.bump_progress(id, 100).await;
                        self.event(
                            id,
                            EventLevel::Info,
                            &format!("Operation {} completed", op_id),
                            Some(json!({"response": status.raw})),
                        )
                        .await;
                        return self.complete(id, migration).await;
                    }
                    OpState::Failed => {
                        return self
                            .fail(id, "op_failed", json!({"op_id": op_id, "last": status.raw}))
                            .await;
                    }
                    OpState::Pending => {
                        if let Some(pct) = status.progress {
                            self.bump_progress(id, pct).await;
                        }
                    }
                },
                Err(e) => {
                    // transient poll failures keep the budget running
                    self.event(
                        id,
                        EventLevel::Warning,
                        &format!("Poll of operation {} failed: {}", op_id, e),
                        None,
                    )
                    .await;
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn complete(&self, id: Uuid, migration: &Migration) -> Result<MigrationStatus> {
        self.store
            .transition(
                id,
                MigrationStatus::Completed,
                TransitionFields { progress: Some(100), details: None },
            )
            .await?;

        // the controller, not the hypervisor, owns the host pointer
        if let Err(e) =
            db::vms::set_host(&self.pool, migration.vm_id, &migration.target_host).await
        {
            self.event(
                id,
                EventLevel::Warning,
                &format!("Failed to update VM host pointer: {}", e),
                None,
            )
            .await;
        }

        self.event(
            id,
            EventLevel::Info,
            &format!("Migration completed, VM now on {}", migration.target_host),
            None,
        )
        .await;
        Ok(MigrationStatus::Completed)
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        mut details: serde_json::Value,
    ) -> Result<MigrationStatus> {
        if let Some(obj) = details.as_object_mut() {
            obj.insert("error".to_string(), json!(error));
        }
        self.event(
            id,
            EventLevel::Error,
            &format!("Migration failed: {}", error),
            Some(details.clone()),
        )
        .await;
        self.store
            .transition(
                id,
                MigrationStatus::Failed,
                TransitionFields { progress: None, details: Some(details) },
            )
            .await?;
        Ok(MigrationStatus::Failed)
    }

    async fn cancel(&self, id: Uuid, reason: &str) -> Result<MigrationStatus> {
        self.event(id, EventLevel::Info, reason, None).await;
        self.store
            .transition(id, MigrationStatus::Cancelled, TransitionFields::default())
            .await?;
        Ok(MigrationStatus::Cancelled)
    }

    /// Progress updates are best-effort: a persistence failure is logged
    /// as a warning event and does not fail the migration.
    async fn bump_progress(&self, id: Uuid, pct: i64) {
        if let Err(e) = self.store.update_progress(id, pct).await {
            tracing::warn!("Progress update for migration {} failed: {}", id, e);
            let _ = self
                .store
                .append_event(
                    id,
                    EventLevel::Warning,
                    &format!("Progress update to {}% failed: {}", pct, e),
                    None,
                )
                .await;
        }
    }

    async fn event(
        &self,
        id: Uuid,
        level: EventLevel,
        message: &str,
        meta: Option<serde_json::Value>,
    ) {
        if let Err(e) = self.store.append_event(id, level, message, meta).await {
            tracing::warn!("Failed to append event for migration {}: {}", id, e);
        }
    }
}
