//! Management-API hypervisor driver
//!
//! Drives a XAPI-compatible pool through its out-of-band REST management
//! layer. API versions disagree on the migrate endpoint and payload
//! shape, so invocation walks a candidate list and reports every attempt
//! when none is accepted.

use std::time::Duration;

use serde_json::{json, Value};
use stratus_common::{Error, Result};

use super::{
    classify_op_state, eligibility_heuristic, extract_progress, Eligibility, HypervisorDriver,
    MigrateAttempt, MigrateOutcome, MigrateResult, OpStatus, VmInfo,
};

/// Candidate migrate endpoints, relative to the API root
const CANDIDATE_MIGRATE_PATHS: &[&str] = &[
    "/vms/{vm}/actions/migrate",
    "/vms/{vm}/migrate",
    "/vms/{vm}/actions/migrate_vm",
];

/// Candidate task-status endpoints
const CANDIDATE_TASK_PATHS: &[&str] = &[
    "/tasks/{op}",
    "/operations/{op}",
    "/jobs/{op}",
    "/tasks/{op}/status",
];

pub struct XapiRestDriver {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl XapiRestDriver {
    pub fn new(base_url: &str, token: Option<String>, rpc_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .map_err(|e| Error::System(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let resp = self
            .authorize(self.http.get(self.url(path)))
            .send()
            .await
            .map_err(|e| Error::Driver(format!("GET {} failed: {}", path, e)))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::VmNotFound(path.to_string()));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Driver(format!(
                "GET {} returned {}: {}",
                path,
                status,
                truncate(&body, 200)
            )));
        }

        resp.json()
            .await
            .map_err(|e| Error::Driver(format!("GET {} returned invalid JSON: {}", path, e)))
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self
            .authorize(self.http.post(self.url(path)).json(body))
            .send()
            .await
            .map_err(|e| Error::Driver(format!("POST {} failed: {}", path, e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Driver(format!(
                "POST {} returned {}: {}",
                path,
                status,
                truncate(&text, 200)
            )));
        }

        resp.json()
            .await
            .map_err(|e| Error::Driver(format!("POST {} returned invalid JSON: {}", path, e)))
    }
}

/// Payload shapes accepted by different API generations
fn payload_variants(target_host: &str, target_sr: Option<&str>) -> Vec<Value> {
    let mut variants = vec![
        json!({"host": target_host}),
        json!({"target": target_host}),
        json!({"destination": target_host}),
        json!({"target_host": target_host}),
        json!({"host_uuid": target_host}),
        json!({"to": {"host": target_host}}),
        json!({"destination": {"host": target_host}}),
    ];
    if let Some(sr) = target_sr {
        variants.push(json!({"host": target_host, "sr": sr}));
        variants.push(json!({"host": target_host, "sr_uuid": sr}));
        variants.push(json!({"target": target_host, "sr": sr}));
    }
    variants
}

fn extract_op_id(resp: &Value) -> Option<String> {
    for key in ["id", "task", "operation", "result"] {
        match resp.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn string_field<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| raw.get(*k).and_then(|v| v.as_str()))
}

fn stringified_field(raw: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| raw.get(*k))
        .map(|v| v.to_string())
        .unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait::async_trait]
impl HypervisorDriver for XapiRestDriver {
    async fn get_vm(&self, vm_uuid: &str) -> Result<VmInfo> {
        let raw = self
            .get_json(&format!("/vms/{}", vm_uuid))
            .await
            .map_err(|e| match e {
                Error::VmNotFound(_) => Error::VmNotFound(vm_uuid.to_string()),
                other => other,
            })?;

        Ok(VmInfo {
            vm_uuid: vm_uuid.to_string(),
            name_label: string_field(&raw, &["name_label", "nameLabel", "name"])
                .map(|s| s.to_string()),
            power_state: string_field(&raw, &["power_state", "powerState"]).map(|s| s.to_string()),
            raw,
        })
    }

    async fn probe(&self, vm_uuid: &str) -> Result<Eligibility> {
        let vm = self.get_vm(vm_uuid).await?;
        let other_config = stringified_field(&vm.raw, &["other", "other_config", "otherConfig"]);
        let boot_policy =
            string_field(&vm.raw, &["HVM_boot_policy", "hvmBootPolicy", "boot_policy"]);
        let platform = stringified_field(&vm.raw, &["platform"]);

        Ok(eligibility_heuristic(
            vm.power_state.as_deref(),
            &other_config,
            boot_policy,
            &platform,
        ))
    }

    async fn migrate(
        &self,
        vm_uuid: &str,
        target_host: &str,
        target_sr: Option<&str>,
    ) -> Result<MigrateResult> {
        let mut tried = Vec::new();

        for path_template in CANDIDATE_MIGRATE_PATHS {
            let path = path_template.replace("{vm}", vm_uuid);
            for payload in payload_variants(target_host, target_sr) {
                tracing::debug!("Attempting migrate via {} with payload {}", path, payload);
                match self.post_json(&path, &payload).await {
                    Ok(resp) => {
                        let op_id = if resp.is_object() { extract_op_id(&resp) } else { None };
                        return Ok(MigrateResult::Invoked(MigrateOutcome {
                            endpoint: path,
                            payload,
                            response: resp,
                            op_id,
                        }));
                    }
                    Err(e) => {
                        tried.push(MigrateAttempt {
                            endpoint: path.clone(),
                            payload,
                            error: Some(e.to_string()),
                        });
                    }
                }
            }
        }

        Ok(MigrateResult::Unsupported { tried })
    }

    async fn poll(&self, op_id: &str) -> Result<OpStatus> {
        for path_template in CANDIDATE_TASK_PATHS {
            let path = path_template.replace("{op}", op_id);
            let resp = match self.get_json(&path).await {
                Ok(resp) => resp,
                Err(_) => continue,
            };
            if !resp.is_object() {
                continue;
            }

            let status = string_field(&resp, &["status", "state", "result"]);
            return Ok(OpStatus {
                state: classify_op_state(status),
                progress: extract_progress(&resp),
                raw: resp,
            });
        }

        // No task endpoint answered; stay pending until the poll budget runs out.
        Ok(OpStatus { state: super::OpState::Pending, progress: None, raw: Value::Null })
    }

    async fn abort(&self, op_id: &str) -> Result<()> {
        let cancel_path = format!("/tasks/{}/actions/cancel", op_id);
        if self.post_json(&cancel_path, &json!({})).await.is_ok() {
            return Ok(());
        }

        let resp = self
            .authorize(self.http.delete(self.url(&format!("/tasks/{}", op_id))))
            .send()
            .await
            .map_err(|e| Error::Driver(format!("Failed to abort task {}: {}", op_id, e)))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Driver(format!(
                "Failed to abort task {}: {}",
                op_id,
                resp.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_variants_without_sr() {
        let variants = payload_variants("host-b", None);
        assert_eq!(variants.len(), 7);
        assert!(variants.contains(&json!({"host": "host-b"})));
        assert!(variants.contains(&json!({"to": {"host": "host-b"}})));
    }

    #[test]
    fn test_payload_variants_with_sr() {
        let variants = payload_variants("host-b", Some("sr-1"));
        assert_eq!(variants.len(), 10);
        assert!(variants.contains(&json!({"host": "host-b", "sr_uuid": "sr-1"})));
    }

    #[test]
    fn test_extract_op_id() {
        assert_eq!(extract_op_id(&json!({"id": "op-1"})), Some("op-1".to_string()));
        assert_eq!(extract_op_id(&json!({"task": "t-9"})), Some("t-9".to_string()));
        assert_eq!(extract_op_id(&json!({"result": 17})), Some("17".to_string()));
        // `id` wins over later keys
        assert_eq!(
            extract_op_id(&json!({"task": "t-9", "id": "op-1"})),
            Some("op-1".to_string())
        );
        assert_eq!(extract_op_id(&json!({"ok": true})), None);
    }
}
