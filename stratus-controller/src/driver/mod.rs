//! Hypervisor driver interface
//!
//! The orchestrator treats the hypervisor as a black box behind this
//! trait. Two concrete drivers exist side by side: a management-API
//! variant that negotiates endpoint/payload shapes over REST, and a
//! shell variant driving the pool master's `xe` tool over SSH. Every
//! method returns a value or a structured error; nothing raises through
//! the seam.

pub mod rest;
pub mod ssh;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use stratus_common::{Error, Result};

use crate::config::{DriverConfig, DriverKind};

/// VM record as seen by the hypervisor
#[derive(Debug, Clone)]
pub struct VmInfo {
    pub vm_uuid: String,
    pub name_label: Option<String>,
    pub power_state: Option<String>,
    pub raw: Value,
}

/// Outcome of a live-migratability probe
#[derive(Debug, Clone)]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: String,
}

/// One endpoint/payload combination the driver tried
#[derive(Debug, Clone, Serialize)]
pub struct MigrateAttempt {
    pub endpoint: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A successfully accepted migration invocation
#[derive(Debug, Clone)]
pub struct MigrateOutcome {
    pub endpoint: String,
    pub payload: Value,
    pub response: Value,
    /// Handle for polling; absent for fire-and-forget endpoints
    pub op_id: Option<String>,
}

/// Result of a migration invocation
#[derive(Debug, Clone)]
pub enum MigrateResult {
    Invoked(MigrateOutcome),
    /// No endpoint/payload shape was accepted by the hypervisor
    Unsupported { tried: Vec<MigrateAttempt> },
}

/// Terminal classification of a polled operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Pending,
    Succeeded,
    Failed,
}

/// One poll of an in-flight operation
#[derive(Debug, Clone)]
pub struct OpStatus {
    pub state: OpState,
    pub progress: Option<i64>,
    pub raw: Value,
}

#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Fetch the VM record; `VmNotFound` when the hypervisor does not know it
    async fn get_vm(&self, vm_uuid: &str) -> Result<VmInfo>;

    /// Is live migration permitted for this VM right now?
    async fn probe(&self, vm_uuid: &str) -> Result<Eligibility>;

    /// Start the live transfer towards `target_host`
    async fn migrate(
        &self,
        vm_uuid: &str,
        target_host: &str,
        target_sr: Option<&str>,
    ) -> Result<MigrateResult>;

    /// Poll an operation handle returned by `migrate`
    async fn poll(&self, op_id: &str) -> Result<OpStatus>;

    /// Best-effort abort of an in-flight operation
    async fn abort(&self, op_id: &str) -> Result<()>;
}

/// Build the configured driver
pub fn build(config: &DriverConfig) -> Result<Arc<dyn HypervisorDriver>> {
    match config.kind {
        DriverKind::Rest => Ok(Arc::new(rest::XapiRestDriver::new(
            &config.rest_base_url,
            config.rest_token.clone(),
            std::time::Duration::from_secs(config.rpc_timeout_secs),
        )?)),
        DriverKind::Ssh => {
            let host = config.ssh_pool_master.clone().ok_or_else(|| {
                Error::Validation("ssh driver requires a pool master address".to_string())
            })?;
            Ok(Arc::new(ssh::XeSshDriver::new(
                host,
                config.ssh_user.clone(),
                std::time::Duration::from_secs(config.rpc_timeout_secs),
            )))
        }
    }
}

/// Map a hypervisor task status string onto our terminal classification
pub(crate) fn classify_op_state(status: Option<&str>) -> OpState {
    match status.map(|s| s.to_ascii_lowercase()) {
        Some(s) if matches!(s.as_str(), "done" | "success" | "ok" | "completed") => {
            OpState::Succeeded
        }
        Some(s) if matches!(s.as_str(), "failed" | "error" | "aborted") => OpState::Failed,
        _ => OpState::Pending,
    }
}

/// Pull a progress percentage out of a task response.
///
/// Field precedence: `progress`, `percent`, `percentage`.
pub(crate) fn extract_progress(resp: &Value) -> Option<i64> {
    for key in ["progress", "percent", "percentage"] {
        if let Some(v) = resp.get(key) {
            if let Some(n) = v.as_i64() {
                return Some(n);
            }
            if let Some(f) = v.as_f64() {
                return Some(f.round() as i64);
            }
            if let Some(s) = v.as_str() {
                if let Ok(n) = s.trim().parse::<f64>() {
                    return Some(n.round() as i64);
                }
            }
        }
    }
    None
}

/// Conservative live-migratability heuristic for hypervisors without a
/// direct capability query: the VM must be running, and either the guest
/// reports tools installed, or its boot policy is empty (PV/PVHVM), or
/// the platform record carries a PV marker.
pub(crate) fn eligibility_heuristic(
    power_state: Option<&str>,
    other_config: &str,
    boot_policy: Option<&str>,
    platform: &str,
) -> Eligibility {
    match power_state {
        Some(state) if state.eq_ignore_ascii_case("running") => {}
        Some(state) => {
            return Eligibility {
                eligible: false,
                reason: format!("VM power-state is not running: {}", state),
            }
        }
        None => {
            return Eligibility {
                eligible: false,
                reason: "VM power-state unknown".to_string(),
            }
        }
    }

    if other_config.contains("guest_tools_installed") {
        return Eligibility {
            eligible: true,
            reason: "guest_tools_installed flag present".to_string(),
        };
    }

    if boot_policy.map(|p| p.trim().is_empty()).unwrap_or(true) {
        return Eligibility {
            eligible: true,
            reason: "empty HVM boot policy suggests PV/PVHVM".to_string(),
        };
    }

    let platform = platform.to_ascii_lowercase();
    for marker in ["xen_platform", "pvdrivers", "pv", "xen"] {
        if platform.contains(marker) {
            return Eligibility {
                eligible: true,
                reason: format!("platform contains PV marker '{}'", marker),
            };
        }
    }

    Eligibility {
        eligible: false,
        reason: format!(
            "HVM boot policy present and platform shows no PV support (policy='{}')",
            boot_policy.unwrap_or_default()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_op_state() {
        assert_eq!(classify_op_state(Some("success")), OpState::Succeeded);
        assert_eq!(classify_op_state(Some("Done")), OpState::Succeeded);
        assert_eq!(classify_op_state(Some("completed")), OpState::Succeeded);
        assert_eq!(classify_op_state(Some("FAILED")), OpState::Failed);
        assert_eq!(classify_op_state(Some("aborted")), OpState::Failed);
        assert_eq!(classify_op_state(Some("in_progress")), OpState::Pending);
        assert_eq!(classify_op_state(None), OpState::Pending);
    }

    #[test]
    fn test_extract_progress_precedence() {
        assert_eq!(extract_progress(&json!({"progress": 42})), Some(42));
        assert_eq!(extract_progress(&json!({"percent": 13.6})), Some(14));
        assert_eq!(extract_progress(&json!({"percentage": "55"})), Some(55));
        // `progress` wins when more than one field is present
        assert_eq!(
            extract_progress(&json!({"percent": 10, "progress": 90})),
            Some(90)
        );
        assert_eq!(extract_progress(&json!({"status": "running"})), None);
    }

    #[test]
    fn test_eligibility_requires_running() {
        let e = eligibility_heuristic(Some("halted"), "", None, "");
        assert!(!e.eligible);
        assert!(e.reason.contains("halted"));

        let e = eligibility_heuristic(None, "", None, "");
        assert!(!e.eligible);
    }

    #[test]
    fn test_eligibility_guest_tools() {
        let e = eligibility_heuristic(
            Some("Running"),
            "xo:guest_tools_installed: true",
            Some("BIOS order"),
            "",
        );
        assert!(e.eligible);
    }

    #[test]
    fn test_eligibility_empty_boot_policy() {
        let e = eligibility_heuristic(Some("running"), "", None, "");
        assert!(e.eligible);
        let e = eligibility_heuristic(Some("running"), "", Some(""), "");
        assert!(e.eligible);
    }

    #[test]
    fn test_eligibility_platform_marker() {
        let e = eligibility_heuristic(
            Some("running"),
            "",
            Some("BIOS order"),
            "device_id: 0001; xen_platform: present",
        );
        assert!(e.eligible);

        let e = eligibility_heuristic(Some("running"), "", Some("BIOS order"), "acpi: 1");
        assert!(!e.eligible);
    }
}
