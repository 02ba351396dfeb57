//! Database layer using SQLite
//!
//! Holds the connection pool plus the host/VM registry synced from the
//! inventory API. Migration job records live in the store module.

pub mod migrations;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use stratus_common::Result;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| stratus_common::Error::System(format!("Bad database URL: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| stratus_common::Error::System(format!("Database connection failed: {}", e)))?;

        tracing::info!("Database connection established");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Database connection closed");
    }

    /// Health check - verify database connectivity
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| stratus_common::Error::System(format!("Database health check failed: {}", e)))?;
        Ok(())
    }
}

/// Host registry operations
pub mod hosts {
    use super::*;
    use sqlx::Row;
    use stratus_common::HostSnapshot;

    /// Insert or refresh a host row from an inventory snapshot
    pub async fn upsert(pool: &SqlitePool, host: &HostSnapshot) -> Result<()> {
        let labels = host
            .labels
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| stratus_common::Error::System(format!("Failed to encode host labels: {}", e)))?;

        sqlx::query(
            "INSERT INTO hosts (host_id, hostname, ip, status, cpu_count, cpu_percent,
                 mem_percent, load1, vms_running, labels, last_seen_ts, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(host_id) DO UPDATE SET
                 hostname = excluded.hostname,
                 ip = excluded.ip,
                 status = excluded.status,
                 cpu_count = excluded.cpu_count,
                 cpu_percent = excluded.cpu_percent,
                 mem_percent = excluded.mem_percent,
                 load1 = excluded.load1,
                 vms_running = excluded.vms_running,
                 labels = excluded.labels,
                 last_seen_ts = excluded.last_seen_ts,
                 updated_at = excluded.updated_at",
        )
        .bind(&host.host_id)
        .bind(&host.hostname)
        .bind(&host.ip)
        .bind(&host.status)
        .bind(host.cpu_count.map(|v| v as i64))
        .bind(host.cpu_percent)
        .bind(host.mem_percent)
        .bind(host.load1)
        .bind(host.vms_running.map(|v| v as i64))
        .bind(labels)
        .bind(host.last_seen_ts)
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await
        .map_err(|e| stratus_common::Error::System(format!("Failed to upsert host: {}", e)))?;

        Ok(())
    }

    pub async fn exists(pool: &SqlitePool, host_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM hosts WHERE host_id = ?")
            .bind(host_id)
            .fetch_one(pool)
            .await
            .map_err(|e| stratus_common::Error::System(format!("Failed to check host: {}", e)))?;
        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    pub async fn list_ids(pool: &SqlitePool) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT host_id FROM hosts ORDER BY host_id")
            .fetch_all(pool)
            .await
            .map_err(|e| stratus_common::Error::System(format!("Failed to list hosts: {}", e)))?;
        Ok(rows.iter().map(|r| r.get("host_id")).collect())
    }
}

/// VM registry operations
pub mod vms {
    use super::*;
    use sqlx::Row;
    use stratus_common::VmSnapshot;
    use uuid::Uuid;

    /// Insert or refresh a VM row from an inventory snapshot
    pub async fn upsert(pool: &SqlitePool, vm: &VmSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO vms (id, vm_uuid, name, host_id, vcpus, mem_bytes, cpu_percent,
                 protected, last_migrated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 vm_uuid = excluded.vm_uuid,
                 name = excluded.name,
                 host_id = excluded.host_id,
                 vcpus = excluded.vcpus,
                 mem_bytes = excluded.mem_bytes,
                 cpu_percent = excluded.cpu_percent,
                 protected = excluded.protected",
        )
        .bind(vm.vm_id.to_string())
        .bind(&vm.vm_uuid)
        .bind(&vm.name)
        .bind(&vm.host_id)
        .bind(vm.vcpus.map(|v| v as i64))
        .bind(vm.mem_bytes.map(|v| v as i64))
        .bind(vm.cpu_percent)
        .bind(vm.protected)
        .bind(vm.last_migrated_at.map(|t| t.timestamp()))
        .execute(pool)
        .await
        .map_err(|e| stratus_common::Error::System(format!("Failed to upsert VM: {}", e)))?;

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<VmSnapshot> {
        let row = sqlx::query("SELECT * FROM vms WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(pool)
            .await
            .map_err(|e| stratus_common::Error::System(format!("Failed to fetch VM: {}", e)))?
            .ok_or_else(|| stratus_common::Error::VmNotFound(id.to_string()))?;

        row_to_vm(&row)
    }

    pub async fn get_by_uuid(pool: &SqlitePool, vm_uuid: &str) -> Result<VmSnapshot> {
        let row = sqlx::query("SELECT * FROM vms WHERE vm_uuid = ?")
            .bind(vm_uuid)
            .fetch_optional(pool)
            .await
            .map_err(|e| stratus_common::Error::System(format!("Failed to fetch VM: {}", e)))?
            .ok_or_else(|| stratus_common::Error::VmNotFound(vm_uuid.to_string()))?;

        row_to_vm(&row)
    }

    /// Move the VM's host pointer after a completed migration
    pub async fn set_host(pool: &SqlitePool, id: Uuid, host_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE vms SET host_id = ?, last_migrated_at = ? WHERE id = ?",
        )
        .bind(host_id)
        .bind(chrono::Utc::now().timestamp())
        .bind(id.to_string())
        .execute(pool)
        .await
        .map_err(|e| stratus_common::Error::System(format!("Failed to update VM host: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(stratus_common::Error::VmNotFound(id.to_string()));
        }

        Ok(())
    }

    fn row_to_vm(row: &sqlx::sqlite::SqliteRow) -> Result<VmSnapshot> {
        let id: String = row.get("id");
        let last_migrated_at: Option<i64> = row.get("last_migrated_at");

        Ok(VmSnapshot {
            vm_id: Uuid::parse_str(&id)
                .map_err(|e| stratus_common::Error::System(format!("Bad VM id in database: {}", e)))?,
            vm_uuid: row.get("vm_uuid"),
            name: row.get("name"),
            host_id: row.get("host_id"),
            vcpus: row.get::<Option<i64>, _>("vcpus").map(|v| v as u32),
            mem_bytes: row.get::<Option<i64>, _>("mem_bytes").map(|v| v as u64),
            cpu_percent: row.get("cpu_percent"),
            protected: row.get("protected"),
            last_migrated_at: last_migrated_at
                .and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::{HostSnapshot, VmSnapshot};
    use uuid::Uuid;

    pub(crate) async fn create_test_db() -> Database {
        let db = Database::new("sqlite::memory:", 4)
            .await
            .expect("Failed to create database");
        db.migrate().await.expect("Failed to run migrations");
        db
    }

    pub(crate) fn test_host(id: &str, cpu: f64, mem: f64) -> HostSnapshot {
        HostSnapshot {
            host_id: id.to_string(),
            hostname: Some(format!("{}.example", id)),
            status: "UP".to_string(),
            cpu_count: Some(16),
            cpu_percent: cpu,
            mem_percent: mem,
            mem_free_bytes: None,
            load1: Some(1.0),
            last_seen_ts: Some(1_700_000_000),
            labels: None,
            vms_running: Some(3),
            ip: Some("10.0.0.1".to_string()),
        }
    }

    pub(crate) fn test_vm(host: &str) -> VmSnapshot {
        VmSnapshot {
            vm_id: Uuid::new_v4(),
            vm_uuid: Uuid::new_v4().to_string(),
            name: Some("web-1".to_string()),
            host_id: Some(host.to_string()),
            vcpus: Some(2),
            mem_bytes: Some(2 * 1024 * 1024 * 1024),
            cpu_percent: Some(12.5),
            protected: false,
            last_migrated_at: None,
        }
    }

    #[tokio::test]
    async fn test_host_upsert_and_exists() {
        let db = create_test_db().await;

        let host = test_host("h1", 40.0, 30.0);
        hosts::upsert(db.pool(), &host).await.unwrap();
        assert!(hosts::exists(db.pool(), "h1").await.unwrap());
        assert!(!hosts::exists(db.pool(), "h2").await.unwrap());

        // second upsert refreshes, does not duplicate
        let mut refreshed = host.clone();
        refreshed.cpu_percent = 75.0;
        hosts::upsert(db.pool(), &refreshed).await.unwrap();
        assert_eq!(hosts::list_ids(db.pool()).await.unwrap(), vec!["h1"]);
    }

    #[tokio::test]
    async fn test_vm_round_trip() {
        let db = create_test_db().await;
        hosts::upsert(db.pool(), &test_host("h1", 40.0, 30.0)).await.unwrap();

        let vm = test_vm("h1");
        vms::upsert(db.pool(), &vm).await.unwrap();

        let by_id = vms::get(db.pool(), vm.vm_id).await.unwrap();
        assert_eq!(by_id.vm_uuid, vm.vm_uuid);
        assert_eq!(by_id.host_id.as_deref(), Some("h1"));

        let by_uuid = vms::get_by_uuid(db.pool(), &vm.vm_uuid).await.unwrap();
        assert_eq!(by_uuid.vm_id, vm.vm_id);
    }

    #[tokio::test]
    async fn test_vm_set_host() {
        let db = create_test_db().await;
        let vm = test_vm("h1");
        vms::upsert(db.pool(), &vm).await.unwrap();

        vms::set_host(db.pool(), vm.vm_id, "h2").await.unwrap();
        let moved = vms::get(db.pool(), vm.vm_id).await.unwrap();
        assert_eq!(moved.host_id.as_deref(), Some("h2"));
        assert!(moved.last_migrated_at.is_some());

        let missing = vms::set_host(db.pool(), Uuid::new_v4(), "h2").await;
        assert!(matches!(missing, Err(stratus_common::Error::VmNotFound(_))));
    }
}
