//! # Bridge Client
//!
//! Submits messages to a running bridge over its REST API.

use anyhow::{anyhow, Result};
use tracing::{debug, info};

use shared::types::{BridgeOutcome, ErrorResponse, UplinkMessage};

/// HTTP client for the bridge API
pub struct BridgeClient {
    /// Bridge base URL
    bridge_url: String,

    /// HTTP client
    http_client: reqwest::Client,
}

impl BridgeClient {
    pub fn new(bridge_url: impl Into<String>) -> Self {
        Self {
            bridge_url: bridge_url.into().trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.bridge_url, path)
    }

    /// Submit one message and return the bridge outcome
    pub async fn send(&self, message: &UplinkMessage) -> Result<BridgeOutcome> {
        let url = self.url("/api/v1/uplink");
        debug!(url = %url, "Submitting uplink message");

        let response = self.http_client.post(&url).json(message).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| format!("{} ({})", e.error, e.kind))
                .unwrap_or(body);
            return Err(anyhow!("bridge returned {}: {}", status, detail));
        }

        let outcome: BridgeOutcome = response.json().await?;
        info!(device_id = %outcome.device_id, stage = %outcome.stage, "Message bridged");
        Ok(outcome)
    }

    /// Evict a device from the bridge's registration cache
    pub async fn evict(&self, device_id: &str) -> Result<serde_json::Value> {
        let url = self.url(&format!("/api/v1/admin/cache/{}", device_id));
        let response = self.http_client.delete(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("bridge returned {}: {}", status, body));
        }

        Ok(response.json().await?)
    }
}
