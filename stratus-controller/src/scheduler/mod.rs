//! Scheduler service
//!
//! Long-running loop with two triggers: a periodic rebalance cycle over
//! the full inventory snapshot, and an asynchronous handler for overload
//! alerts. Both feed proposals through the same submission path, which
//! re-checks the cluster-wide concurrency cap against the migration
//! store before creating and enqueuing jobs. One bad proposal never
//! stops a cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use stratus_common::{Alert, Error, HostSnapshot, Result, VmSnapshot};
use tokio::sync::{watch, Mutex};

use crate::config::SchedulerConfig;
use crate::db;
use crate::inventory::InventoryApi;
use crate::planner::{Planner, Proposal};
use crate::store::{MigrationStore, NewMigration};
use crate::worker::MigrationQueue;

pub struct SchedulerService {
    inventory: Arc<dyn InventoryApi>,
    store: MigrationStore,
    pool: SqlitePool,
    queue: MigrationQueue,
    planner: Mutex<Planner>,
    config: SchedulerConfig,
}

impl SchedulerService {
    pub fn new(
        inventory: Arc<dyn InventoryApi>,
        store: MigrationStore,
        pool: SqlitePool,
        queue: MigrationQueue,
        planner: Planner,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inventory,
            store,
            pool,
            queue,
            planner: Mutex::new(planner),
            config,
        }
    }

    /// Periodic rebalance loop; exits on shutdown signal.
    pub async fn run_periodic(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.rebalance_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        tracing::error!("Periodic rebalance cycle failed: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Scheduler service stopped");
    }

    /// One periodic rebalance pass over a fresh inventory snapshot
    pub async fn run_cycle(&self) -> Result<usize> {
        tracing::info!("Starting periodic rebalance cycle");

        let hosts = self.inventory.hosts().await?;
        let vms = self.inventory.vms().await?;
        self.sync_registry(&hosts, &vms).await?;

        let mut vms_by_host: HashMap<String, Vec<VmSnapshot>> = HashMap::new();
        for vm in vms {
            if let Some(host_id) = vm.host_id.clone() {
                vms_by_host.entry(host_id).or_default().push(vm);
            }
        }

        let plan = self.planner.lock().await.plan_rebalance(&hosts, &vms_by_host);
        tracing::info!("Periodic plan proposals: {}", plan.len());

        Ok(self.submit(plan).await)
    }

    /// React to an overload alert: emergency-plan the host, or throttle it
    /// when no VM can be moved off.
    pub async fn handle_alert(&self, alert: Alert) {
        tracing::info!("Received alert for host {} level={}", alert.host_id, alert.level);

        let (hosts, vms) = match tokio::try_join!(self.inventory.hosts(), self.inventory.vms()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("Failed to snapshot inventory for alert: {}", e);
                return;
            }
        };
        if let Err(e) = self.sync_registry(&hosts, &vms).await {
            tracing::warn!("Registry sync failed during alert handling: {}", e);
        }

        let Some(alert_host) = hosts.iter().find(|h| h.host_id == alert.host_id) else {
            tracing::warn!("Alert host {} not found in inventory", alert.host_id);
            return;
        };

        let host_vms: Vec<VmSnapshot> = vms
            .into_iter()
            .filter(|vm| vm.host_id.as_deref() == Some(alert.host_id.as_str()))
            .collect();

        let plan = self
            .planner
            .lock()
            .await
            .plan_emergency(alert_host, &hosts, &host_vms);

        if plan.is_empty() {
            tracing::info!(
                "No emergency migration possible for host {}, throttling",
                alert.host_id
            );
            if let Err(e) = self
                .inventory
                .throttle_host(
                    &alert.host_id,
                    self.config.host_cooldown_secs,
                    &format!("alert_{}", alert.level),
                )
                .await
            {
                tracing::error!("Failed to throttle host {}: {}", alert.host_id, e);
            }
            return;
        }

        self.submit(plan).await;
    }

    /// Create and enqueue migrations for proposals, capped by the
    /// cluster-wide in-flight limit re-read from the store.
    pub async fn submit(&self, proposals: Vec<Proposal>) -> usize {
        let in_flight = match self.store.count_non_terminal().await {
            Ok(n) => n as usize,
            Err(e) => {
                tracing::error!("Could not count in-flight migrations: {}", e);
                return 0;
            }
        };
        let mut slots = self.config.max_concurrent_migrations.saturating_sub(in_flight);
        let mut submitted = 0;

        for proposal in proposals {
            if slots == 0 {
                tracing::info!(
                    "Reached max concurrent migrations ({}), pausing plan submission",
                    self.config.max_concurrent_migrations
                );
                break;
            }

            let vm_uuid = proposal.vm.vm_uuid.clone();
            match self
                .store
                .create(NewMigration {
                    vm_id: proposal.vm.vm_id,
                    source_host: proposal.source_host,
                    target_host: proposal.target_host.clone(),
                    reason: Some(proposal.reason),
                    client_request_id: None,
                    details: None,
                })
                .await
            {
                Ok(migration) => {
                    if let Err(e) = self.queue.enqueue(migration.id) {
                        tracing::error!("Failed to enqueue migration {}: {}", migration.id, e);
                        continue;
                    }
                    tracing::info!(
                        "Scheduled migration {} for VM {} -> {}",
                        migration.id,
                        vm_uuid,
                        proposal.target_host
                    );
                    slots -= 1;
                    submitted += 1;
                }
                Err(Error::MigrationExists { existing, .. }) => {
                    tracing::info!(
                        "VM {} already has migration {} in flight, skipping proposal",
                        vm_uuid,
                        existing
                    );
                }
                Err(e) => {
                    tracing::error!("Failed to create migration for VM {}: {}", vm_uuid, e);
                }
            }
        }

        submitted
    }

    /// Mirror the inventory snapshot into the local registry so intake
    /// validation and the orchestrator's host pointer update see current
    /// hosts and VMs.
    async fn sync_registry(&self, hosts: &[HostSnapshot], vms: &[VmSnapshot]) -> Result<()> {
        for host in hosts {
            db::hosts::upsert(&self.pool, host).await?;
        }
        for vm in vms {
            db::vms::upsert(&self.pool, vm).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::db::Database;
    use crate::store::MigrationFilter;
    use stratus_common::AlertLevel;
    use uuid::Uuid;

    struct StubInventory {
        hosts: Vec<HostSnapshot>,
        vms: Vec<VmSnapshot>,
        throttled: Mutex<Vec<(String, u64, String)>>,
    }

    #[async_trait::async_trait]
    impl InventoryApi for StubInventory {
        async fn hosts(&self) -> Result<Vec<HostSnapshot>> {
            Ok(self.hosts.clone())
        }
        async fn vms(&self) -> Result<Vec<VmSnapshot>> {
            Ok(self.vms.clone())
        }
        async fn throttle_host(&self, host_id: &str, duration_secs: u64, reason: &str) -> Result<()> {
            self.throttled
                .lock()
                .await
                .push((host_id.to_string(), duration_secs, reason.to_string()));
            Ok(())
        }
    }

    fn host(id: &str, cpu: f64, mem: f64) -> HostSnapshot {
        HostSnapshot {
            host_id: id.to_string(),
            hostname: None,
            status: "UP".to_string(),
            cpu_count: Some(8),
            cpu_percent: cpu,
            mem_percent: mem,
            mem_free_bytes: None,
            load1: None,
            last_seen_ts: None,
            labels: None,
            vms_running: None,
            ip: None,
        }
    }

    fn vm(name: &str, host: &str, cpu: f64) -> VmSnapshot {
        VmSnapshot {
            vm_id: Uuid::new_v4(),
            vm_uuid: format!("uuid-{}", name),
            name: Some(name.to_string()),
            host_id: Some(host.to_string()),
            vcpus: Some(2),
            mem_bytes: None,
            cpu_percent: Some(cpu),
            protected: false,
            last_migrated_at: None,
        }
    }

    struct Fixture {
        _database: Database,
        service: Arc<SchedulerService>,
        inventory: Arc<StubInventory>,
        store: MigrationStore,
        rx: tokio::sync::mpsc::UnboundedReceiver<Uuid>,
    }

    async fn setup(hosts: Vec<HostSnapshot>, vms: Vec<VmSnapshot>) -> Fixture {
        let database = Database::new("sqlite::memory:", 4).await.unwrap();
        database.migrate().await.unwrap();
        let pool = database.pool().clone();

        let inventory = Arc::new(StubInventory { hosts, vms, throttled: Mutex::new(Vec::new()) });
        let store = MigrationStore::new(pool.clone());
        let (queue, rx) = MigrationQueue::new();
        let config = ControllerConfig::default();
        let planner = Planner::new(config.scheduler.clone(), config.policy.clone());

        let service = Arc::new(SchedulerService::new(
            inventory.clone(),
            store.clone(),
            pool,
            queue,
            planner,
            config.scheduler,
        ));

        Fixture { _database: database, service, inventory, store, rx }
    }

    #[tokio::test]
    async fn test_cycle_submits_and_enqueues_proposal() {
        let hosts = vec![host("a", 90.0, 50.0), host("b", 20.0, 20.0), host("c", 30.0, 30.0)];
        let vms = vec![vm("v1", "a", 40.0), vm("v2", "a", 10.0)];
        let mut f = setup(hosts, vms).await;

        let submitted = f.service.run_cycle().await.unwrap();
        assert_eq!(submitted, 1);

        let migrations = f.store.list(&MigrationFilter::default()).await.unwrap();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].target_host, "b");
        assert_eq!(migrations[0].reason.as_deref(), Some("periodic_rebalance"));

        // the id landed on the worker queue
        assert_eq!(f.rx.recv().await, Some(migrations[0].id));
    }

    #[tokio::test]
    async fn test_cycle_with_balanced_cluster_is_a_no_op() {
        let hosts = vec![host("a", 40.0, 40.0), host("b", 35.0, 30.0)];
        let vms = vec![vm("v1", "a", 10.0)];
        let f = setup(hosts, vms).await;

        assert_eq!(f.service.run_cycle().await.unwrap(), 0);
        assert!(f.store.list(&MigrationFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submission_respects_concurrency_cap() {
        let hosts = vec![host("a", 90.0, 50.0), host("b", 5.0, 5.0), host("c", 6.0, 6.0)];
        let vms = vec![vm("v1", "a", 10.0), vm("v2", "a", 10.0), vm("v3", "a", 10.0)];
        let f = setup(hosts, vms).await;

        // cap is 2: a three-proposal plan submits exactly two
        let submitted = f.service.run_cycle().await.unwrap();
        assert_eq!(submitted, 2);
        assert_eq!(f.store.count_non_terminal().await.unwrap(), 2);

        // a second cycle submits nothing while both are in flight
        assert_eq!(f.service.run_cycle().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_alert_without_destination_throttles_host() {
        let hosts = vec![host("a", 97.0, 60.0), host("b", 75.0, 80.0)];
        let vms = vec![vm("v1", "a", 30.0)];
        let f = setup(hosts.clone(), vms).await;

        f.service
            .handle_alert(Alert {
                host_id: "a".to_string(),
                level: AlertLevel::Red,
                timestamp: 1_700_000_000,
                metrics: serde_json::json!({"cpu": 97.0}),
                recent_vms: None,
            })
            .await;

        let throttled = f.inventory.throttled.lock().await;
        assert_eq!(throttled.len(), 1);
        assert_eq!(throttled[0].0, "a");
        assert_eq!(throttled[0].1, 300);
        assert_eq!(throttled[0].2, "alert_red");
        drop(throttled);

        assert!(f.store.list(&MigrationFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_alert_with_destination_submits_emergency_migration() {
        let hosts = vec![host("a", 97.0, 60.0), host("b", 10.0, 10.0)];
        let vms = vec![vm("v1", "a", 30.0), vm("v2", "a", 5.0)];
        let f = setup(hosts, vms).await;

        f.service
            .handle_alert(Alert {
                host_id: "a".to_string(),
                level: AlertLevel::Orange,
                timestamp: 1_700_000_000,
                metrics: serde_json::json!({"cpu": 97.0}),
                recent_vms: None,
            })
            .await;

        let migrations = f.store.list(&MigrationFilter::default()).await.unwrap();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].reason.as_deref(), Some("emergency"));
        assert_eq!(migrations[0].target_host, "b");
        // heaviest movable VM was picked
        let heavy = crate::db::vms::get(f._database.pool(), migrations[0].vm_id).await.unwrap();
        assert_eq!(heavy.name.as_deref(), Some("v1"));

        assert!(f.inventory.throttled.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_proposal_is_skipped() {
        let hosts = vec![host("a", 90.0, 50.0), host("b", 10.0, 10.0)];
        let shared_vm = vm("v1", "a", 10.0);
        let f = setup(hosts, vec![shared_vm.clone()]).await;

        // first cycle creates the migration for v1
        assert_eq!(f.service.run_cycle().await.unwrap(), 1);

        // bypassing the planner cooldown, a direct re-submission of the
        // same VM is skipped because a non-terminal migration exists
        let submitted = f
            .service
            .submit(vec![Proposal {
                vm: shared_vm,
                source_host: "a".to_string(),
                target_host: "b".to_string(),
                reason: "periodic_rebalance".to_string(),
            }])
            .await;
        assert_eq!(submitted, 0);
        assert_eq!(f.store.list(&MigrationFilter::default()).await.unwrap().len(), 1);
    }
}
