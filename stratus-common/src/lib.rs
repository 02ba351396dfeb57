//! Common types shared between the Stratus controller and its clients

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a migration job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Queued,
    Validating,
    Running,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl MigrationStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::Cancelled
        )
    }

    /// Valid edges of the migration state machine.
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        match (self, next) {
            (Queued, Validating) => true,
            (Validating, Running) | (Validating, Failed) => true,
            (Running, Finalizing) | (Running, Failed) => true,
            (Finalizing, Completed) | (Finalizing, Failed) => true,
            // any non-terminal state may be cancelled
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Queued => "queued",
            MigrationStatus::Validating => "validating",
            MigrationStatus::Running => "running",
            MigrationStatus::Finalizing => "finalizing",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Some(MigrationStatus::Queued),
            "validating" => Some(MigrationStatus::Validating),
            "running" => Some(MigrationStatus::Running),
            "finalizing" => Some(MigrationStatus::Finalizing),
            "completed" => Some(MigrationStatus::Completed),
            "failed" => Some(MigrationStatus::Failed),
            "cancelled" => Some(MigrationStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity of a migration event log entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warning => "warning",
            EventLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(EventLevel::Info),
            "warning" => Some(EventLevel::Warning),
            "error" => Some(EventLevel::Error),
            _ => None,
        }
    }
}

/// A host as reported by the inventory API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub host_id: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "default_host_status")]
    pub status: String,
    #[serde(default)]
    pub cpu_count: Option<u32>,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    #[serde(default)]
    pub mem_free_bytes: Option<u64>,
    #[serde(default)]
    pub load1: Option<f64>,
    #[serde(default)]
    pub last_seen_ts: Option<i64>,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default)]
    pub vms_running: Option<u32>,
    #[serde(default)]
    pub ip: Option<String>,
}

fn default_host_status() -> String {
    "UP".to_string()
}

impl HostSnapshot {
    pub fn is_up(&self) -> bool {
        self.status.eq_ignore_ascii_case("up")
    }
}

/// A VM as reported by the inventory API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSnapshot {
    pub vm_id: uuid::Uuid,
    pub vm_uuid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub vcpus: Option<u32>,
    #[serde(default)]
    pub mem_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub last_migrated_at: Option<DateTime<Utc>>,
}

/// Severity of a load alert from the monitoring side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Orange,
    Red,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Orange => write!(f, "orange"),
            AlertLevel::Red => write!(f, "red"),
        }
    }
}

/// Overload alert for a single host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub host_id: String,
    pub level: AlertLevel,
    pub timestamp: i64,
    #[serde(default)]
    pub metrics: serde_json::Value,
    #[serde(default)]
    pub recent_vms: Option<Vec<serde_json::Value>>,
}

/// Controller error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Virtual machine not found: {0}")]
    VmNotFound(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Migration not found: {0}")]
    MigrationNotFound(String),

    #[error("A non-terminal migration already exists for VM {vm_id}: {existing}")]
    MigrationExists { vm_id: uuid::Uuid, existing: uuid::Uuid },

    #[error("Illegal migration transition: {from} -> {to}")]
    InvalidTransition {
        from: MigrationStatus,
        to: MigrationStatus,
    },

    #[error("Failed to acquire lock {0}")]
    LockTimeout(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Hypervisor driver error: {0}")]
    Driver(String),

    #[error("System error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Infrastructure errors the worker may retry; migration state
    /// transitions themselves are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::LockTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
