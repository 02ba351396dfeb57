//! Database schema migrations

use sqlx::SqlitePool;
use stratus_common::Result;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Ledger of applied schema migrations
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            executed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| stratus_common::Error::System(format!("Failed to create schema_migrations table: {}", e)))?;

    run_migration(pool, "001_create_hosts_table", MIGRATION_001_CREATE_HOSTS).await?;
    run_migration(pool, "002_create_vms_table", MIGRATION_002_CREATE_VMS).await?;
    run_migration(pool, "003_create_migrations_table", MIGRATION_003_CREATE_MIGRATIONS).await?;
    run_migration(
        pool,
        "004_create_migration_events_table",
        MIGRATION_004_CREATE_MIGRATION_EVENTS,
    )
    .await?;

    Ok(())
}

async fn run_migration(pool: &SqlitePool, name: &str, sql: &str) -> Result<()> {
    use sqlx::Row;

    let row = sqlx::query("SELECT COUNT(*) as count FROM schema_migrations WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .map_err(|e| stratus_common::Error::System(format!("Migration check failed: {}", e)))?;

    let count: i64 = row.get("count");
    if count > 0 {
        tracing::debug!("Migration {} already applied", name);
        return Ok(());
    }

    tracing::info!("Running migration: {}", name);

    sqlx::query(sql)
        .execute(pool)
        .await
        .map_err(|e| stratus_common::Error::System(format!("Migration {} failed: {}", name, e)))?;

    sqlx::query("INSERT INTO schema_migrations (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await
        .map_err(|e| stratus_common::Error::System(format!("Failed to record migration: {}", e)))?;

    Ok(())
}

const MIGRATION_001_CREATE_HOSTS: &str = "
CREATE TABLE hosts (
    host_id TEXT PRIMARY KEY,
    hostname TEXT,
    ip TEXT,
    status TEXT NOT NULL DEFAULT 'UP',
    cpu_count INTEGER,
    cpu_percent REAL NOT NULL DEFAULT 0,
    mem_percent REAL NOT NULL DEFAULT 0,
    load1 REAL,
    vms_running INTEGER,
    labels TEXT,
    last_seen_ts INTEGER,
    updated_at INTEGER
);

CREATE INDEX idx_hosts_status ON hosts(status);
";

const MIGRATION_002_CREATE_VMS: &str = "
CREATE TABLE vms (
    id TEXT PRIMARY KEY,
    vm_uuid TEXT NOT NULL UNIQUE,
    name TEXT,
    host_id TEXT,
    vcpus INTEGER,
    mem_bytes INTEGER,
    cpu_percent REAL,
    protected INTEGER NOT NULL DEFAULT 0,
    last_migrated_at INTEGER
);

CREATE INDEX idx_vms_host ON vms(host_id);
CREATE INDEX idx_vms_uuid ON vms(vm_uuid);
";

const MIGRATION_003_CREATE_MIGRATIONS: &str = "
CREATE TABLE migrations (
    id TEXT PRIMARY KEY,
    vm_id TEXT NOT NULL,
    source_host TEXT NOT NULL,
    target_host TEXT NOT NULL,
    reason TEXT,
    client_request_id TEXT UNIQUE,
    status TEXT NOT NULL DEFAULT 'queued',
    progress INTEGER NOT NULL DEFAULT 0,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    started_at INTEGER,
    updated_at INTEGER NOT NULL,
    finished_at INTEGER,
    details TEXT
);

CREATE INDEX idx_migrations_vm ON migrations(vm_id);
CREATE INDEX idx_migrations_status ON migrations(status);

CREATE UNIQUE INDEX idx_migrations_vm_active ON migrations(vm_id)
    WHERE status NOT IN ('completed', 'failed', 'cancelled');
";

const MIGRATION_004_CREATE_MIGRATION_EVENTS: &str = "
CREATE TABLE migration_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    migration_id TEXT NOT NULL,
    ts INTEGER NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    meta TEXT,
    FOREIGN KEY (migration_id) REFERENCES migrations(id) ON DELETE CASCADE
);

CREATE INDEX idx_migration_events_migration ON migration_events(migration_id);
";
