//! Cluster-wide advisory locks
//!
//! Named mutexes with a TTL and bounded-wait acquisition, keyed
//! `lock:migration:vm:{vm_id}`. Backed by Redis in production (atomic
//! SET NX EX); an in-process store covers tests and single-node dev
//! setups. The TTL protects against worker crashes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use stratus_common::{Error, Result};
use tokio::sync::Mutex;

const ACQUIRE_RETRY_SLEEP: Duration = Duration::from_millis(100);

/// Key-value store supporting atomic set-if-absent-with-expiry
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Attempt to take the lock; returns false when it is already held.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool>;
    async fn release(&self, key: &str) -> Result<()>;
}

/// Redis-backed lock store
pub struct RedisLockStore {
    conn: ConnectionManager,
}

impl RedisLockStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::System(format!("Bad redis URL: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::System(format!("Redis connection failed: {}", e)))?;
        tracing::info!("Advisory lock store connected to redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::System(format!("Redis SET failed: {}", e)))?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::System(format!("Redis DEL failed: {}", e)))?;
        Ok(())
    }
}

/// In-process lock store honoring TTL expiry
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get(key) {
            Some(expiry) if *expiry > now => Ok(false),
            _ => {
                entries.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// A held advisory lock. Release explicitly when the critical section
/// ends; the TTL reclaims the key if the holder dies first.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    key: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.release(&self.key).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!("Lock {} dropped without release; TTL will reclaim it", self.key);
        }
    }
}

/// Acquire the named lock, polling until `wait` elapses.
pub async fn acquire(
    store: Arc<dyn LockStore>,
    name: &str,
    ttl: Duration,
    wait: Duration,
) -> Result<LockGuard> {
    let key = format!("lock:{}", name);
    let deadline = Instant::now() + wait;

    loop {
        if store.try_acquire(&key, ttl).await? {
            return Ok(LockGuard { store, key, released: false });
        }
        if Instant::now() >= deadline {
            return Err(Error::LockTimeout(key));
        }
        tokio::time::sleep(ACQUIRE_RETRY_SLEEP).await;
    }
}

/// Lock name serializing work on one VM
pub fn vm_lock_name(vm_id: uuid::Uuid) -> String {
    format!("migration:vm:{}", vm_id)
}
