//! Inventory API client
//!
//! The scheduler consumes host/VM snapshots from the external inventory
//! service and can ask it to throttle an alerting host. Authenticated
//! with a bearer token when one is configured.

use async_trait::async_trait;
use serde_json::json;
use stratus_common::{Error, HostSnapshot, Result, VmSnapshot};

use crate::config::InventoryConfig;

#[async_trait]
pub trait InventoryApi: Send + Sync {
    async fn hosts(&self) -> Result<Vec<HostSnapshot>>;
    async fn vms(&self) -> Result<Vec<VmSnapshot>>;
    async fn throttle_host(&self, host_id: &str, duration_secs: u64, reason: &str) -> Result<()>;
}

pub struct HttpInventory {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpInventory {
    pub fn new(config: &InventoryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::System(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get_list<T: serde::de::DeserializeOwned>(&self, paths: &[&str]) -> Result<Vec<T>> {
        let mut last_error = None;
        for path in paths {
            let url = format!("{}{}", self.base_url, path);
            let resp = match self.authorize(self.http.get(&url)).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(format!("GET {} failed: {}", path, e));
                    continue;
                }
            };
            // routing differences between deployments: try the next variant
            if matches!(resp.status().as_u16(), 404 | 405) {
                last_error = Some(format!("GET {} returned {}", path, resp.status()));
                continue;
            }
            if !resp.status().is_success() {
                return Err(Error::System(format!(
                    "Inventory API GET {} returned {}",
                    path,
                    resp.status()
                )));
            }
            return resp
                .json()
                .await
                .map_err(|e| Error::System(format!("Inventory API GET {} bad JSON: {}", path, e)));
        }
        Err(Error::System(
            last_error.unwrap_or_else(|| "Inventory API unreachable".to_string()),
        ))
    }
}

#[async_trait]
impl InventoryApi for HttpInventory {
    async fn hosts(&self) -> Result<Vec<HostSnapshot>> {
        self.get_list(&["/hosts", "/hosts/"]).await
    }

    async fn vms(&self) -> Result<Vec<VmSnapshot>> {
        self.get_list(&["/vms", "/vms/"]).await
    }

    async fn throttle_host(&self, host_id: &str, duration_secs: u64, reason: &str) -> Result<()> {
        let url = format!("{}/hosts/{}/throttle", self.base_url, host_id);
        let resp = self
            .authorize(self.http.post(&url))
            .json(&json!({"duration_seconds": duration_secs, "reason": reason}))
            .send()
            .await
            .map_err(|e| Error::System(format!("Throttle request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::System(format!(
                "Throttle of host {} returned {}",
                host_id,
                resp.status()
            )));
        }
        Ok(())
    }
}
