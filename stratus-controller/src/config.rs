//! Configuration for the Stratus controller
//!
//! Settings are read from environment variables on top of built-in
//! defaults. The variable names mirror the deployment environment
//! (`REBALANCE_INTERVAL`, `HIGH_CPU_THRESHOLD`, ...).

use serde::{Deserialize, Serialize};

/// Main configuration struct for the controller daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Inventory API connection
    pub inventory: InventoryConfig,
    /// Advisory lock store
    pub lock: LockConfig,
    /// Hypervisor driver selection
    pub driver: DriverConfig,
    /// Rebalance scheduling behavior
    pub scheduler: SchedulerConfig,
    /// Host scoring and admission thresholds
    pub policy: PolicyConfig,
    /// Migration worker pool
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the intake API to
    pub bind: String,
    /// Bearer token required on the intake API; auth is skipped when
    /// unset (dev mode)
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://stratus.db")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    /// Base URL of the inventory API
    pub base_url: String,
    /// Bearer token; auth is skipped when unset (dev mode)
    pub token: Option<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Redis URL backing the cluster-wide advisory lock
    pub redis_url: String,
    /// Lock TTL in seconds
    pub ttl_secs: u64,
    /// Bounded wait for acquisition, seconds
    pub wait_secs: u64,
}

/// Which concrete hypervisor driver the orchestrator uses
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// High-level management API (tries several endpoint/payload shapes)
    Rest,
    /// Shell-over-SSH against the pool master's `xe` tool
    Ssh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub kind: DriverKind,
    /// Base URL of the management API (rest driver)
    pub rest_base_url: String,
    /// Bearer token for the management API
    pub rest_token: Option<String>,
    /// Pool master address (ssh driver)
    pub ssh_pool_master: Option<String>,
    /// SSH user (ssh driver)
    pub ssh_user: String,
    /// Per-RPC timeout, seconds
    pub rpc_timeout_secs: u64,
    /// Skip driver calls and emit a deterministic progress sequence
    pub simulate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Periodic rebalance cycle, seconds
    pub rebalance_interval_secs: u64,
    /// Cluster-wide cap on in-flight migrations
    pub max_concurrent_migrations: usize,
    /// Rolling per-host cap on emergency migrations
    pub max_emergency_migrations_per_host: u32,
    /// Per-VM cooldown, seconds
    pub migration_cooldown_secs: u64,
    /// Per-host cooldown, seconds
    pub host_cooldown_secs: u64,
    /// Maximum proposals per periodic cycle
    pub max_plan: usize,
}

/// Weighting profile for the host score
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ScoreProfile {
    /// cpu/mem/load1 weighted 0.6/0.3/0.1
    Default,
    /// cpu/mem/vm-count weighted 0.5/0.3/0.2, vm term saturating
    VmCount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Overload gates (%)
    pub high_cpu: f64,
    pub high_mem: f64,
    /// Admission caps on a destination (%)
    pub low_cpu: f64,
    pub low_mem: f64,
    /// Red-alert threshold (%)
    pub emergency_cpu: f64,
    /// Score weights, all in [0,1], summing to 1
    pub w_cpu: f64,
    pub w_mem: f64,
    pub w_load: f64,
    pub profile: ScoreProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of parallel migration workers
    pub count: usize,
    /// Driver operation poll cadence, seconds
    pub poll_interval_secs: u64,
    /// Driver operation poll budget, seconds
    pub poll_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: "0.0.0.0:8000".to_string(),
                token: None,
            },
            database: DatabaseConfig {
                url: "sqlite://stratus.db".to_string(),
                max_connections: 16,
            },
            inventory: InventoryConfig {
                base_url: "http://controller:8000".to_string(),
                token: None,
                timeout_secs: 5,
            },
            lock: LockConfig {
                redis_url: "redis://127.0.0.1:6379/0".to_string(),
                ttl_secs: 300,
                wait_secs: 10,
            },
            driver: DriverConfig {
                kind: DriverKind::Rest,
                rest_base_url: "http://xoa/rest/v0".to_string(),
                rest_token: None,
                ssh_pool_master: None,
                ssh_user: "root".to_string(),
                rpc_timeout_secs: 60,
                simulate: false,
            },
            scheduler: SchedulerConfig {
                rebalance_interval_secs: 30,
                max_concurrent_migrations: 2,
                max_emergency_migrations_per_host: 1,
                migration_cooldown_secs: 600,
                host_cooldown_secs: 300,
                max_plan: 5,
            },
            policy: PolicyConfig {
                high_cpu: 80.0,
                high_mem: 85.0,
                low_cpu: 60.0,
                low_mem: 70.0,
                emergency_cpu: 95.0,
                w_cpu: 0.6,
                w_mem: 0.3,
                w_load: 0.1,
                profile: ScoreProfile::Default,
            },
            worker: WorkerConfig {
                count: 2,
                poll_interval_secs: 2,
                poll_timeout_secs: 300,
            },
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables over defaults
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        // Server / persistence
        if let Ok(bind) = std::env::var("STRATUS_BIND") {
            self.server.bind = bind;
        }
        if let Ok(url) = std::env::var("STRATUS_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(max) = std::env::var("STRATUS_DATABASE_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                self.database.max_connections = max;
            }
        }

        // Inventory API
        if let Ok(url) = std::env::var("CONTROLLER_BASE_URL") {
            self.inventory.base_url = url;
        }
        if let Ok(token) = std::env::var("CONTROLLER_TOKEN") {
            if !token.is_empty() {
                self.inventory.token = Some(token.clone());
                self.server.token = Some(token);
            }
        }

        // Advisory lock
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.lock.redis_url = url;
        }
        set_u64(&mut self.lock.ttl_secs, "LOCK_TTL");
        set_u64(&mut self.lock.wait_secs, "LOCK_WAIT");

        // Driver
        if let Ok(kind) = std::env::var("STRATUS_DRIVER") {
            match kind.to_ascii_lowercase().as_str() {
                "rest" => self.driver.kind = DriverKind::Rest,
                "ssh" => self.driver.kind = DriverKind::Ssh,
                other => tracing::warn!("Unknown STRATUS_DRIVER '{}', keeping default", other),
            }
        }
        if let Ok(url) = std::env::var("XOA_BASE_URL") {
            self.driver.rest_base_url = url;
        }
        if let Ok(token) = std::env::var("XOA_TOKEN") {
            if !token.is_empty() {
                self.driver.rest_token = Some(token);
            }
        }
        if let Ok(host) = std::env::var("SSH_POOL_MASTER") {
            self.driver.ssh_pool_master = Some(host);
        }
        if let Ok(user) = std::env::var("SSH_USER") {
            self.driver.ssh_user = user;
        }
        if let Ok(sim) = std::env::var("SIMULATE_MIGRATIONS") {
            self.driver.simulate = matches!(sim.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        // Scheduler
        set_u64(&mut self.scheduler.rebalance_interval_secs, "REBALANCE_INTERVAL");
        set_usize(&mut self.scheduler.max_concurrent_migrations, "MAX_CONCURRENT_MIGRATIONS");
        set_u32(
            &mut self.scheduler.max_emergency_migrations_per_host,
            "MAX_EMERGENCY_MIGRATIONS_PER_HOST",
        );
        set_u64(&mut self.scheduler.migration_cooldown_secs, "MIGRATION_COOLDOWN");
        set_u64(&mut self.scheduler.host_cooldown_secs, "HOST_COOLDOWN");
        set_usize(&mut self.scheduler.max_plan, "MAX_PLAN");

        // Policy
        set_f64(&mut self.policy.high_cpu, "HIGH_CPU_THRESHOLD");
        set_f64(&mut self.policy.high_mem, "HIGH_MEM_THRESHOLD");
        set_f64(&mut self.policy.low_cpu, "LOW_CPU_THRESHOLD");
        set_f64(&mut self.policy.low_mem, "LOW_MEM_THRESHOLD");
        set_f64(&mut self.policy.emergency_cpu, "EMERGENCY_CPU");
        set_f64(&mut self.policy.w_cpu, "W_CPU");
        set_f64(&mut self.policy.w_mem, "W_MEM");
        set_f64(&mut self.policy.w_load, "W_LOAD");
        if let Ok(profile) = std::env::var("SCORE_PROFILE") {
            match profile.to_ascii_lowercase().as_str() {
                "default" => self.policy.profile = ScoreProfile::Default,
                "vm-count" | "vm_count" => {
                    self.policy.profile = ScoreProfile::VmCount;
                    self.policy.w_cpu = 0.5;
                    self.policy.w_mem = 0.3;
                    self.policy.w_load = 0.2;
                }
                other => tracing::warn!("Unknown SCORE_PROFILE '{}', keeping default", other),
            }
        }

        // Worker
        set_usize(&mut self.worker.count, "STRATUS_WORKERS");
        set_u64(&mut self.worker.poll_interval_secs, "POLL_INTERVAL");
        set_u64(&mut self.worker.poll_timeout_secs, "POLL_TIMEOUT");
        set_u64(&mut self.driver.rpc_timeout_secs, "DRIVER_RPC_TIMEOUT");
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "STRATUS_BIND is not a socket address: {}",
                self.server.bind
            )));
        }
        if self.database.url.is_empty() {
            return Err(ConfigError::Validation("Database URL cannot be empty".to_string()));
        }

        let p = &self.policy;
        for (name, w) in [("W_CPU", p.w_cpu), ("W_MEM", p.w_mem), ("W_LOAD", p.w_load)] {
            if !(0.0..=1.0).contains(&w) {
                return Err(ConfigError::Validation(format!("{} must be in [0,1], got {}", name, w)));
            }
        }
        let sum = p.w_cpu + p.w_mem + p.w_load;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Validation(format!(
                "score weights must sum to 1, got {}",
                sum
            )));
        }
        if p.low_cpu > p.high_cpu || p.low_mem > p.high_mem {
            return Err(ConfigError::Validation(
                "admission caps must not exceed overload gates".to_string(),
            ));
        }

        if self.driver.kind == DriverKind::Ssh && self.driver.ssh_pool_master.is_none() {
            return Err(ConfigError::Validation(
                "SSH_POOL_MASTER is required for the ssh driver".to_string(),
            ));
        }

        if self.worker.count == 0 {
            return Err(ConfigError::Validation("STRATUS_WORKERS must be at least 1".to_string()));
        }

        Ok(())
    }
}

fn set_u64(slot: &mut u64, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(v) = v.parse() {
            *slot = v;
        }
    }
}

fn set_u32(slot: &mut u32, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(v) = v.parse() {
            *slot = v;
        }
    }
}

fn set_usize(slot: &mut usize, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(v) = v.parse() {
            *slot = v;
        }
    }
}

fn set_f64(slot: &mut f64, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(v) = v.parse() {
            *slot = v;
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Validation(err) => write!(f, "Config validation failed: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.scheduler.rebalance_interval_secs, 30);
        assert_eq!(config.scheduler.max_concurrent_migrations, 2);
        assert_eq!(config.scheduler.migration_cooldown_secs, 600);
        assert_eq!(config.scheduler.host_cooldown_secs, 300);
        assert_eq!(config.policy.high_cpu, 80.0);
        assert_eq!(config.policy.high_mem, 85.0);
        assert_eq!(config.policy.low_cpu, 60.0);
        assert_eq!(config.policy.low_mem, 70.0);
        assert_eq!(config.lock.ttl_secs, 300);
        assert_eq!(config.lock.wait_secs, 10);
        assert_eq!(config.worker.poll_interval_secs, 2);
        assert_eq!(config.worker.poll_timeout_secs, 300);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_weight_validation() {
        let mut config = ControllerConfig::default();
        config.policy.w_cpu = 0.9; // sum now 1.3
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.policy.w_load = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bind_validation() {
        let mut config = ControllerConfig::default();
        config.server.bind = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ssh_driver_requires_pool_master() {
        let mut config = ControllerConfig::default();
        config.driver.kind = DriverKind::Ssh;
        assert!(config.validate().is_err());

        config.driver.ssh_pool_master = Some("10.0.0.1".to_string());
        assert!(config.validate().is_ok());
    }
}
