//! # Device Provisioning
//!
//! Binds a device to its assigned hub:
//! 1. `PUT {scope}/registrations/{id}/register`, signed with the derived key
//! 2. Poll `GET {scope}/registrations/{id}/operations/{operationId}` while
//!    the registration is `assigning`
//! 3. Return the assigned hub and device id

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

use shared::{
    config::ProvisioningConfig,
    constants::*,
    error::{HubError, HubResult},
    types::{DeviceRegistration, ProvisioningRequest},
};

use crate::hub::{check_response, transport_error};
use crate::signature::sign_resource;

/// Registers devices and reports their assigned endpoint
#[async_trait]
pub trait ProvisioningService: Send + Sync {
    /// Register `request.device_id` under `request.scope_id`
    async fn register(&self, request: &ProvisioningRequest) -> HubResult<DeviceRegistration>;
}

/// REST client for the provisioning service
pub struct HttpProvisioningClient {
    /// HTTP client
    http_client: reqwest::Client,

    /// Registration host, API version and polling policy
    config: ProvisioningConfig,

    /// URL scheme, `https` outside tests
    scheme: &'static str,
}

impl HttpProvisioningClient {
    /// Create a new provisioning client
    pub fn new(config: ProvisioningConfig) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            config,
            scheme: "https",
        }
    }

    /// Talk plain HTTP, for local stub servers
    #[cfg(test)]
    pub(crate) fn over_http(mut self) -> Self {
        self.scheme = "http";
        self
    }

    fn url(&self, scope_id: &str, path: &str) -> String {
        format!(
            "{}://{}/{}/registrations/{}?api-version={}",
            self.scheme, self.config.registration_host, scope_id, path, self.config.api_version
        )
    }

    async fn start_registration(
        &self,
        request: &ProvisioningRequest,
        authorization: &str,
    ) -> HubResult<RegistrationOperation> {
        let url = self.url(&request.scope_id, &format!("{}/register", request.device_id));

        let response = self
            .http_client
            .put(&url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .json(&json!({ "registrationId": request.device_id }))
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_response(response, &request.device_id, None).await?;
        response
            .json()
            .await
            .map_err(|e| HubError::Serialization(e.to_string()))
    }

    async fn poll_operation(
        &self,
        request: &ProvisioningRequest,
        authorization: &str,
        operation_id: &str,
    ) -> HubResult<RegistrationOperation> {
        let url = self.url(
            &request.scope_id,
            &format!("{}/operations/{}", request.device_id, operation_id),
        );

        let response = self
            .http_client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_response(response, &request.device_id, None).await?;
        response
            .json()
            .await
            .map_err(|e| HubError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl ProvisioningService for HttpProvisioningClient {
    async fn register(&self, request: &ProvisioningRequest) -> HubResult<DeviceRegistration> {
        info!(
            device_id = %request.device_id,
            scope_id = %request.scope_id,
            "Starting device provisioning"
        );

        let key = request
            .derived_key
            .to_bytes()
            .map_err(|e| HubError::Serialization(format!("derived key: {}", e)))?;
        let expiry = chrono::Utc::now().timestamp() + DEFAULT_SIGNATURE_EXPIRY_SECS as i64;
        let authorization = sign_resource(
            &format!("{}/registrations/{}", request.scope_id, request.device_id),
            &key,
            expiry,
            Some(PROVISIONING_KEY_NAME),
        )
        .token();

        let mut operation = self.start_registration(request, &authorization).await?;
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        for attempt in 1..=self.config.max_poll_attempts {
            if !operation.is_pending() {
                break;
            }

            let operation_id = operation.operation_id.clone().ok_or_else(|| {
                HubError::Serialization("pending registration without operationId".into())
            })?;

            debug!(device_id = %request.device_id, attempt = attempt, "Registration pending, polling");
            tokio::time::sleep(interval).await;
            operation = self
                .poll_operation(request, &authorization, &operation_id)
                .await?;
        }

        let registration = operation.into_registration()?;

        info!(
            device_id = %request.device_id,
            assigned_endpoint = %registration.assigned_endpoint,
            "Device provisioned successfully"
        );

        Ok(registration)
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

/// Registration operation status
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationOperation {
    #[serde(default)]
    operation_id: Option<String>,
    status: String,
    #[serde(default)]
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    #[serde(default)]
    assigned_hub: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl RegistrationOperation {
    fn is_pending(&self) -> bool {
        self.status.eq_ignore_ascii_case(PROVISIONING_STATUS_ASSIGNING)
    }

    fn into_registration(self) -> HubResult<DeviceRegistration> {
        if !self.status.eq_ignore_ascii_case(PROVISIONING_STATUS_ASSIGNED) {
            let detail = self
                .registration_state
                .and_then(|s| s.error_message)
                .unwrap_or_default();
            warn!(status = %self.status, "Registration did not complete");
            return Err(HubError::Rejected(format!(
                "registration ended in status '{}' {}",
                self.status, detail
            )));
        }

        let state = self
            .registration_state
            .ok_or_else(|| HubError::Serialization("assigned registration without state".into()))?;

        match (state.assigned_hub, state.device_id) {
            (Some(assigned_endpoint), Some(assigned_device_id)) => Ok(DeviceRegistration {
                assigned_endpoint,
                assigned_device_id,
            }),
            _ => Err(HubError::Serialization(
                "assigned registration is missing assignedHub or deviceId".into(),
            )),
        }
    }
}
