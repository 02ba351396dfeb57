//! Migration store
//!
//! Persistent record of every migration ever proposed plus its append-only
//! event log. Rows are mutated only through `transition`, which validates
//! the state machine; a partial unique index keeps at most one non-terminal
//! migration per VM.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use stratus_common::{Error, EventLevel, MigrationStatus, Result};
use uuid::Uuid;

/// A migration job record
#[derive(Debug, Clone, Serialize)]
pub struct Migration {
    pub id: Uuid,
    pub vm_id: Uuid,
    pub source_host: String,
    pub target_host: String,
    pub reason: Option<String>,
    pub client_request_id: Option<String>,
    pub status: MigrationStatus,
    pub progress: i64,
    pub cancel_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub details: Option<serde_json::Value>,
}

/// One entry of a migration's audit log
#[derive(Debug, Clone, Serialize)]
pub struct MigrationEvent {
    pub id: i64,
    pub migration_id: Uuid,
    pub ts: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
    pub meta: Option<serde_json::Value>,
}

/// Input for creating a migration record
#[derive(Debug, Clone)]
pub struct NewMigration {
    pub vm_id: Uuid,
    pub source_host: String,
    pub target_host: String,
    pub reason: Option<String>,
    pub client_request_id: Option<String>,
    pub details: Option<serde_json::Value>,
}

/// Filter for listing migrations
#[derive(Debug, Clone, Default)]
pub struct MigrationFilter {
    pub statuses: Option<Vec<MigrationStatus>>,
    pub vm_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
}

/// Optional fields applied alongside a status transition
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub progress: Option<i64>,
    pub details: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct MigrationStore {
    pool: SqlitePool,
}

impl MigrationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a migration record with status `queued`.
    ///
    /// Returns the pre-existing record unchanged when `client_request_id`
    /// matches a prior create. Fails with `MigrationExists` when the VM
    /// already has a non-terminal migration, and with `Validation` /
    /// `HostNotFound` on bad input.
    pub async fn create(&self, new: NewMigration) -> Result<Migration> {
        if new.source_host == new.target_host {
            return Err(Error::Validation(
                "source_host and target_host must differ".to_string(),
            ));
        }
        for host in [&new.source_host, &new.target_host] {
            if !crate::db::hosts::exists(&self.pool, host).await? {
                return Err(Error::HostNotFound(host.clone()));
            }
        }

        if let Some(ref request_id) = new.client_request_id {
            if let Some(existing) = self.find_by_client_request_id(request_id).await? {
                tracing::info!(
                    "Idempotent create for client_request_id {} -> {}",
                    request_id,
                    existing.id
                );
                return Ok(existing);
            }
        }

        let id = Uuid::new_v4();
        let details = encode_details(&new.details)?;
        let result = sqlx::query(
            "INSERT INTO migrations (id, vm_id, source_host, target_host, reason,
                 client_request_id, status, progress, cancel_requested, updated_at, details)
             VALUES (?, ?, ?, ?, ?, ?, 'queued', 0, 0, ?, ?)",
        )
        .bind(id.to_string())
        .bind(new.vm_id.to_string())
        .bind(&new.source_host)
        .bind(&new.target_host)
        .bind(&new.reason)
        .bind(&new.client_request_id)
        .bind(Utc::now().timestamp())
        .bind(details)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.get(id).await,
            Err(e) if is_unique_violation(&e) => {
                // Lost a race: either the same client_request_id landed
                // first, or the VM picked up another non-terminal migration.
                if let Some(ref request_id) = new.client_request_id {
                    if let Some(existing) = self.find_by_client_request_id(request_id).await? {
                        return Ok(existing);
                    }
                }
                match self.find_non_terminal_for_vm(new.vm_id).await? {
                    Some(existing) => Err(Error::MigrationExists {
                        vm_id: new.vm_id,
                        existing: existing.id,
                    }),
                    None => Err(Error::System(format!("Failed to create migration: {}", e))),
                }
            }
            Err(e) => Err(Error::System(format!("Failed to create migration: {}", e))),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Migration> {
        let row = sqlx::query("SELECT * FROM migrations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::System(format!("Failed to fetch migration: {}", e)))?
            .ok_or_else(|| Error::MigrationNotFound(id.to_string()))?;

        row_to_migration(&row)
    }

    pub async fn list(&self, filter: &MigrationFilter) -> Result<Vec<Migration>> {
        let mut query = "SELECT * FROM migrations WHERE 1=1".to_string();

        if let Some(ref statuses) = filter.statuses {
            if statuses.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; statuses.len()].join(", ");
            query.push_str(&format!(" AND status IN ({})", placeholders));
        }
        if filter.vm_id.is_some() {
            query.push_str(" AND vm_id = ?");
        }
        if filter.since.is_some() {
            query.push_str(" AND updated_at >= ?");
        }
        query.push_str(" ORDER BY updated_at DESC");

        let mut sql_query = sqlx::query(&query);
        if let Some(ref statuses) = filter.statuses {
            for status in statuses {
                sql_query = sql_query.bind(status.as_str());
            }
        }
        if let Some(vm_id) = filter.vm_id {
            sql_query = sql_query.bind(vm_id.to_string());
        }
        if let Some(since) = filter.since {
            sql_query = sql_query.bind(since.timestamp());
        }

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::System(format!("Failed to list migrations: {}", e)))?;

        rows.iter().map(row_to_migration).collect()
    }

    /// Number of migrations not yet in a terminal state, cluster-wide
    pub async fn count_non_terminal(&self) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM migrations
             WHERE status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::System(format!("Failed to count migrations: {}", e)))?;

        Ok(row.get("count"))
    }

    /// Migration ids still queued; used to refill the queue after a restart
    pub async fn queued_ids(&self) -> Result<Vec<Uuid>> {
        let migrations = self
            .list(&MigrationFilter {
                statuses: Some(vec![MigrationStatus::Queued]),
                ..Default::default()
            })
            .await?;
        Ok(migrations.iter().map(|m| m.id).collect())
    }

    /// Apply a status transition, validating the edge under a transaction.
    ///
    /// `started_at` is stamped when the job is claimed (entering
    /// `validating`), `finished_at` when a terminal state is reached.
    /// Progress only ever moves forward.
    pub async fn transition(
        &self,
        id: Uuid,
        to: MigrationStatus,
        fields: TransitionFields,
    ) -> Result<Migration> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::System(format!("Failed to open transaction: {}", e)))?;

        let row = sqlx::query("SELECT status FROM migrations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Error::System(format!("Failed to fetch migration: {}", e)))?
            .ok_or_else(|| Error::MigrationNotFound(id.to_string()))?;

        let current = parse_status(&row.get::<String, _>("status"))?;
        if !current.can_transition_to(to) {
            return Err(Error::InvalidTransition { from: current, to });
        }

        let now = Utc::now().timestamp();
        let progress = fields.progress.map(|p| p.clamp(0, 100));
        let details = encode_details(&fields.details)?;

        sqlx::query(
            "UPDATE migrations SET
                 status = ?,
                 updated_at = ?,
                 progress = MAX(progress, COALESCE(?, progress)),
                 details = COALESCE(?, details),
                 started_at = CASE WHEN ? = 'validating' THEN ? ELSE started_at END,
                 finished_at = CASE WHEN ? IN ('completed', 'failed', 'cancelled')
                     THEN ? ELSE finished_at END
             WHERE id = ?",
        )
        .bind(to.as_str())
        .bind(now)
        .bind(progress)
        .bind(details)
        .bind(to.as_str())
        .bind(now)
        .bind(to.as_str())
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::System(format!("Failed to update migration: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| Error::System(format!("Failed to commit transition: {}", e)))?;

        self.get(id).await
    }

    /// Best-effort monotonic progress update on a non-terminal migration
    pub async fn update_progress(&self, id: Uuid, progress: i64) -> Result<()> {
        sqlx::query(
            "UPDATE migrations SET progress = MAX(progress, ?), updated_at = ?
             WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(progress.clamp(0, 100))
        .bind(Utc::now().timestamp())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::System(format!("Failed to update progress: {}", e)))?;

        Ok(())
    }

    /// Request cancellation.
    ///
    /// A still-queued migration is cancelled on the spot; a claimed one gets
    /// a flag the orchestrator reads between polls. Terminal migrations
    /// reject the request.
    pub async fn request_cancel(&self, id: Uuid) -> Result<Migration> {
        let migration = self.get(id).await?;

        if migration.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: migration.status,
                to: MigrationStatus::Cancelled,
            });
        }

        if migration.status == MigrationStatus::Queued {
            return self
                .transition(id, MigrationStatus::Cancelled, TransitionFields::default())
                .await;
        }

        sqlx::query("UPDATE migrations SET cancel_requested = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::System(format!("Failed to flag cancellation: {}", e)))?;

        self.get(id).await
    }

    pub async fn cancel_requested(&self, id: Uuid) -> Result<bool> {
        Ok(self.get(id).await?.cancel_requested)
    }

    pub async fn append_event(
        &self,
        id: Uuid,
        level: EventLevel,
        message: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<()> {
        let meta = encode_details(&meta)?;
        sqlx::query(
            "INSERT INTO migration_events (migration_id, ts, level, message, meta)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(Utc::now().timestamp())
        .bind(level.as_str())
        .bind(message)
        .bind(meta)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::System(format!("Failed to append event: {}", e)))?;

        Ok(())
    }

    pub async fn events(&self, id: Uuid, limit: i64) -> Result<Vec<MigrationEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM migration_events WHERE migration_id = ?
             ORDER BY id DESC LIMIT ?",
        )
        .bind(id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::System(format!("Failed to fetch events: {}", e)))?;

        rows.iter().map(row_to_event).collect()
    }

    async fn find_by_client_request_id(&self, request_id: &str) -> Result<Option<Migration>> {
        let row = sqlx::query("SELECT * FROM migrations WHERE client_request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::System(format!("Failed to fetch migration: {}", e)))?;

        row.as_ref().map(row_to_migration).transpose()
    }

    async fn find_non_terminal_for_vm(&self, vm_id: Uuid) -> Result<Option<Migration>> {
        let row = sqlx::query(
            "SELECT * FROM migrations WHERE vm_id = ?
             AND status NOT IN ('completed', 'failed', 'cancelled')
             LIMIT 1",
        )
        .bind(vm_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::System(format!("Failed to fetch migration: {}", e)))?;

        row.as_ref().map(row_to_migration).transpose()
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

fn encode_details(details: &Option<serde_json::Value>) -> Result<Option<String>> {
    details
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::System(format!("Failed to encode details: {}", e)))
}

fn parse_status(s: &str) -> Result<MigrationStatus> {
    MigrationStatus::parse(s)
        .ok_or_else(|| Error::System(format!("Unknown migration status in database: {}", s)))
}

fn parse_timestamp(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| DateTime::from_timestamp(t, 0))
}

fn row_to_migration(row: &SqliteRow) -> Result<Migration> {
    let id: String = row.get("id");
    let vm_id: String = row.get("vm_id");
    let status: String = row.get("status");
    let details: Option<String> = row.get("details");

    Ok(Migration {
        id: Uuid::parse_str(&id)
            .map_err(|e| Error::System(format!("Bad migration id in database: {}", e)))?,
        vm_id: Uuid::parse_str(&vm_id)
            .map_err(|e| Error::System(format!("Bad vm id in database: {}", e)))?,
        source_host: row.get("source_host"),
        target_host: row.get("target_host"),
        reason: row.get("reason"),
        client_request_id: row.get("client_request_id"),
        status: parse_status(&status)?,
        progress: row.get("progress"),
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        started_at: parse_timestamp(row.get("started_at")),
        updated_at: parse_timestamp(Some(row.get("updated_at"))).unwrap_or_else(Utc::now),
        finished_at: parse_timestamp(row.get("finished_at")),
        details: details
            .map(|d| serde_json::from_str(&d))
            .transpose()
            .map_err(|e| Error::System(format!("Bad details JSON in database: {}", e)))?,
    })
}

fn row_to_event(row: &SqliteRow) -> Result<MigrationEvent> {
    let migration_id: String = row.get("migration_id");
    let level: String = row.get("level");
    let meta: Option<String> = row.get("meta");

    Ok(MigrationEvent {
        id: row.get("id"),
        migration_id: Uuid::parse_str(&migration_id)
            .map_err(|e| Error::System(format!("Bad migration id in database: {}", e)))?,
        ts: parse_timestamp(Some(row.get("ts"))).unwrap_or_else(Utc::now),
        level: EventLevel::parse(&level).unwrap_or(EventLevel::Info),
        message: row.get("message"),
        meta: meta
            .map(|m| serde_json::from_str(&m))
            .transpose()
            .map_err(|e| Error::System(format!("Bad event meta in database: {}", e)))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, Database};

    async fn setup() -> (Database, MigrationStore) {
        let database = Database::new("sqlite::memory:", 4).await.unwrap();
        database.migrate().await.unwrap();
        for host in ["host-a", "host-b", "host-c"] {
            let snapshot = stratus_common::HostSnapshot {
                host_id: host.to_string(),
                hostname: None,
                status: "UP".to_string(),
                cpu_count: Some(8),
                cpu_percent: 20.0,
                mem_percent: 20.0,
                mem_free_bytes: None,
                load1: None,
                last_seen_ts: None,
                labels: None,
                vms_running: None,
                ip: None,
            };
            db::hosts::upsert(database.pool(), &snapshot).await.unwrap();
        }
        let store = MigrationStore::new(database.pool().clone());
        (database, store)
    }

    fn new_migration(vm_id: Uuid) -> NewMigration {
        NewMigration {
            vm_id,
            source_host: "host-a".to_string(),
            target_host: "host-b".to_string(),
            reason: Some("rebalance".to_string()),
            client_request_id: None,
            details: None,
        }
    }

    #[tokio::test]
    async fn test_create_initial_state() {
        let (_db, store) = setup().await;
        let m = store.create(new_migration(Uuid::new_v4())).await.unwrap();
        assert_eq!(m.status, MigrationStatus::Queued);
        assert_eq!(m.progress, 0);
        assert!(m.started_at.is_none());
        assert!(m.finished_at.is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_same_source_and_target() {
        let (_db, store) = setup().await;
        let mut new = new_migration(Uuid::new_v4());
        new.target_host = new.source_host.clone();
        assert!(matches!(
            store.create(new).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_host() {
        let (_db, store) = setup().await;
        let mut new = new_migration(Uuid::new_v4());
        new.target_host = "host-unknown".to_string();
        assert!(matches!(
            store.create(new).await,
            Err(Error::HostNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_single_non_terminal_per_vm() {
        let (_db, store) = setup().await;
        let vm_id = Uuid::new_v4();

        let first = store.create(new_migration(vm_id)).await.unwrap();
        let second = store.create(new_migration(vm_id)).await;
        match second {
            Err(Error::MigrationExists { existing, .. }) => assert_eq!(existing, first.id),
            other => panic!("Expected MigrationExists, got {:?}", other.map(|m| m.id)),
        }

        // once terminal, a new migration may be created
        store
            .transition(first.id, MigrationStatus::Cancelled, TransitionFields::default())
            .await
            .unwrap();
        assert!(store.create(new_migration(vm_id)).await.is_ok());
    }

    #[tokio::test]
    async fn test_client_request_id_idempotency() {
        let (_db, store) = setup().await;
        let vm_id = Uuid::new_v4();

        let mut new = new_migration(vm_id);
        new.client_request_id = Some("req-1".to_string());
        let first = store.create(new.clone()).await.unwrap();
        let second = store.create(new).await.unwrap();

        assert_eq!(first.id, second.id);
        let all = store.list(&MigrationFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_transition_happy_path() {
        let (_db, store) = setup().await;
        let m = store.create(new_migration(Uuid::new_v4())).await.unwrap();

        let m = store
            .transition(
                m.id,
                MigrationStatus::Validating,
                TransitionFields { progress: Some(1), details: None },
            )
            .await
            .unwrap();
        assert_eq!(m.status, MigrationStatus::Validating);
        assert!(m.started_at.is_some());
        assert_eq!(m.progress, 1);

        let m = store
            .transition(m.id, MigrationStatus::Running, TransitionFields::default())
            .await
            .unwrap();
        let m = store
            .transition(m.id, MigrationStatus::Finalizing, TransitionFields::default())
            .await
            .unwrap();
        let m = store
            .transition(
                m.id,
                MigrationStatus::Completed,
                TransitionFields { progress: Some(100), details: None },
            )
            .await
            .unwrap();
        assert_eq!(m.status, MigrationStatus::Completed);
        assert_eq!(m.progress, 100);
        assert!(m.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let (_db, store) = setup().await;
        let m = store.create(new_migration(Uuid::new_v4())).await.unwrap();

        // queued cannot jump straight to running or completed
        assert!(matches!(
            store
                .transition(m.id, MigrationStatus::Running, TransitionFields::default())
                .await,
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            store
                .transition(m.id, MigrationStatus::Completed, TransitionFields::default())
                .await,
            Err(Error::InvalidTransition { .. })
        ));

        // terminal states are final
        store
            .transition(m.id, MigrationStatus::Cancelled, TransitionFields::default())
            .await
            .unwrap();
        assert!(matches!(
            store
                .transition(m.id, MigrationStatus::Validating, TransitionFields::default())
                .await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let (_db, store) = setup().await;
        let m = store.create(new_migration(Uuid::new_v4())).await.unwrap();
        store
            .transition(
                m.id,
                MigrationStatus::Validating,
                TransitionFields { progress: Some(1), details: None },
            )
            .await
            .unwrap();

        store.update_progress(m.id, 50).await.unwrap();
        assert_eq!(store.get(m.id).await.unwrap().progress, 50);

        // lower value does not move it backwards
        store.update_progress(m.id, 25).await.unwrap();
        assert_eq!(store.get(m.id).await.unwrap().progress, 50);

        // values are clamped to [0, 100]
        store.update_progress(m.id, 250).await.unwrap();
        assert_eq!(store.get(m.id).await.unwrap().progress, 100);
    }

    #[tokio::test]
    async fn test_cancel_queued_and_flag_running() {
        let (_db, store) = setup().await;

        let queued = store.create(new_migration(Uuid::new_v4())).await.unwrap();
        let cancelled = store.request_cancel(queued.id).await.unwrap();
        assert_eq!(cancelled.status, MigrationStatus::Cancelled);

        let m = store.create(new_migration(Uuid::new_v4())).await.unwrap();
        store
            .transition(m.id, MigrationStatus::Validating, TransitionFields::default())
            .await
            .unwrap();
        store
            .transition(m.id, MigrationStatus::Running, TransitionFields::default())
            .await
            .unwrap();

        let flagged = store.request_cancel(m.id).await.unwrap();
        assert_eq!(flagged.status, MigrationStatus::Running);
        assert!(store.cancel_requested(m.id).await.unwrap());

        // terminal records reject cancellation
        store
            .transition(m.id, MigrationStatus::Cancelled, TransitionFields::default())
            .await
            .unwrap();
        assert!(store.request_cancel(m.id).await.is_err());
    }

    #[tokio::test]
    async fn test_count_non_terminal() {
        let (_db, store) = setup().await;
        assert_eq!(store.count_non_terminal().await.unwrap(), 0);

        let a = store.create(new_migration(Uuid::new_v4())).await.unwrap();
        let _b = store.create(new_migration(Uuid::new_v4())).await.unwrap();
        assert_eq!(store.count_non_terminal().await.unwrap(), 2);

        store
            .transition(a.id, MigrationStatus::Cancelled, TransitionFields::default())
            .await
            .unwrap();
        assert_eq!(store.count_non_terminal().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (_db, store) = setup().await;
        let vm_id = Uuid::new_v4();
        let a = store.create(new_migration(vm_id)).await.unwrap();
        let _b = store.create(new_migration(Uuid::new_v4())).await.unwrap();

        let by_vm = store
            .list(&MigrationFilter { vm_id: Some(vm_id), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_vm.len(), 1);
        assert_eq!(by_vm[0].id, a.id);

        store
            .transition(a.id, MigrationStatus::Cancelled, TransitionFields::default())
            .await
            .unwrap();
        let cancelled = store
            .list(&MigrationFilter {
                statuses: Some(vec![MigrationStatus::Cancelled]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 1);
    }

    #[tokio::test]
    async fn test_event_log() {
        let (_db, store) = setup().await;
        let m = store.create(new_migration(Uuid::new_v4())).await.unwrap();

        store
            .append_event(m.id, EventLevel::Info, "validating prerequisites", None)
            .await
            .unwrap();
        store
            .append_event(
                m.id,
                EventLevel::Warning,
                "progress update failed",
                Some(serde_json::json!({"attempt": 1})),
            )
            .await
            .unwrap();

        let events = store.events(m.id, 50).await.unwrap();
        assert_eq!(events.len(), 2);
        // newest first
        assert_eq!(events[0].level, EventLevel::Warning);
        assert_eq!(events[0].meta.as_ref().unwrap()["attempt"], 1);
        assert_eq!(events[1].message, "validating prerequisites");
    }
}
