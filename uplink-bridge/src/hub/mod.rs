//! # Device Hub Collaborators
//!
//! The bridge talks to the assigned hub through two seams:
//! - [`TelemetryGateway`]: device-to-cloud telemetry
//! - [`TwinRegistry`]: twin reads, reported writes and ETag-conditioned
//!   desired writes
//!
//! [`HttpIotHub`] implements both over REST.
//!
//! ## Endpoints
//!
//! - `POST /devices/{id}/messages/events` - telemetry (device signature)
//! - `GET /twins/{id}` - twin snapshot (service signature)
//! - `PATCH /devices/{id}/twin/properties/reported` - reported patch (device signature)
//! - `PATCH /twins/{id}` with `If-Match` - desired patch (service signature)

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use shared::{
    config::{ServiceConnection, SignatureConfig},
    constants::*,
    error::{HubError, HubResult},
    types::{DeviceIdentity, PropertySet, TelemetryMessage, TwinSnapshot},
};

use crate::signature::{generate_access_signature, sign_resource, AccessSignature};

// =============================================================================
// COLLABORATOR TRAITS
// =============================================================================

/// Accepts device telemetry
#[async_trait]
pub trait TelemetryGateway: Send + Sync {
    /// Deliver one telemetry message authenticated by `signature`
    async fn send_event(
        &self,
        identity: &DeviceIdentity,
        signature: &AccessSignature,
        message: &TelemetryMessage,
    ) -> HubResult<()>;
}

/// Reads and writes device twins
#[async_trait]
pub trait TwinRegistry: Send + Sync {
    /// Fetch the current twin, including its ETag
    async fn get_twin(&self, identity: &DeviceIdentity) -> HubResult<TwinSnapshot>;

    /// Unconditioned (last-write-wins) reported property patch
    async fn update_reported(
        &self,
        identity: &DeviceIdentity,
        patch: &PropertySet,
    ) -> HubResult<()>;

    /// Desired property patch, rejected with
    /// [`HubError::PreconditionFailed`] if `etag` is stale
    async fn update_desired(
        &self,
        identity: &DeviceIdentity,
        patch: &PropertySet,
        etag: &str,
    ) -> HubResult<()>;
}

// =============================================================================
// HTTP IMPLEMENTATION
// =============================================================================

/// REST client for the assigned hub
pub struct HttpIotHub {
    /// HTTP client
    http_client: reqwest::Client,

    /// Service credentials for registry access
    service: Option<ServiceConnection>,

    /// Signature lifetime
    signature: SignatureConfig,

    /// URL scheme, `https` outside tests
    scheme: &'static str,
}

impl HttpIotHub {
    /// Create a new hub client
    pub fn new(service: Option<ServiceConnection>, signature: SignatureConfig) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            service,
            signature,
            scheme: "https",
        }
    }

    /// Talk plain HTTP, for local stub servers
    #[cfg(test)]
    pub(crate) fn over_http(mut self) -> Self {
        self.scheme = "http";
        self
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("{}://{}{}?api-version={}", self.scheme, host, path, HUB_API_VERSION)
    }

    /// Service-level signature for registry calls
    fn service_signature(&self) -> HubResult<(String, AccessSignature)> {
        use base64::Engine;

        let service = self.service.as_ref().ok_or_else(|| {
            HubError::Rejected("no service connection configured for twin registry".into())
        })?;

        let key = base64::engine::general_purpose::STANDARD
            .decode(&service.key)
            .map_err(|e| HubError::Serialization(format!("service key: {}", e)))?;
        let expiry = chrono::Utc::now().timestamp() + self.signature.expiry_secs as i64;

        Ok((
            service.host_name.clone(),
            sign_resource(&service.host_name, &key, expiry, Some(&service.key_name)),
        ))
    }

    fn device_signature(&self, identity: &DeviceIdentity) -> HubResult<AccessSignature> {
        generate_access_signature(identity, self.signature.expiry_secs)
            .map_err(|e| HubError::Serialization(e.to_string()))
    }
}

/// Twin document as returned by the registry
#[derive(Debug, Deserialize)]
struct TwinDocument {
    #[serde(default)]
    etag: String,
    #[serde(default)]
    properties: TwinProperties,
}

#[derive(Debug, Default, Deserialize)]
struct TwinProperties {
    #[serde(default)]
    desired: PropertySet,
    #[serde(default)]
    reported: PropertySet,
}

impl From<TwinDocument> for TwinSnapshot {
    fn from(doc: TwinDocument) -> Self {
        TwinSnapshot {
            reported: strip_metadata(doc.properties.reported),
            desired: strip_metadata(doc.properties.desired),
            etag: doc.etag,
        }
    }
}

/// Drop `$metadata` / `$version` bookkeeping keys
fn strip_metadata(mut properties: PropertySet) -> PropertySet {
    properties.retain(|key, _| !key.starts_with('$'));
    properties
}

#[async_trait]
impl TelemetryGateway for HttpIotHub {
    async fn send_event(
        &self,
        identity: &DeviceIdentity,
        signature: &AccessSignature,
        message: &TelemetryMessage,
    ) -> HubResult<()> {
        let url = self.url(
            &identity.registration.assigned_endpoint,
            &format!("/devices/{}/messages/events", identity.registration.assigned_device_id),
        );

        let mut request = self
            .http_client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, signature.token())
            .header(reqwest::header::CONTENT_TYPE, TELEMETRY_CONTENT_TYPE)
            .body(serde_json::to_vec(&message.body)?);

        if let Some(ref created) = message.creation_time_utc {
            request = request.header(HEADER_CREATION_TIME_UTC, created);
        }

        let response = request.send().await.map_err(transport_error)?;
        check_response(response, &identity.device_id, None).await?;

        debug!(device_id = %identity.device_id, "Telemetry accepted by hub");
        Ok(())
    }
}

#[async_trait]
impl TwinRegistry for HttpIotHub {
    async fn get_twin(&self, identity: &DeviceIdentity) -> HubResult<TwinSnapshot> {
        let (host, signature) = self.service_signature()?;
        let url = self.url(&host, &format!("/twins/{}", identity.registration.assigned_device_id));

        let response = self
            .http_client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, signature.token())
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_response(response, &identity.device_id, None).await?;
        let document: TwinDocument = response
            .json()
            .await
            .map_err(|e| HubError::Serialization(e.to_string()))?;

        Ok(document.into())
    }

    async fn update_reported(
        &self,
        identity: &DeviceIdentity,
        patch: &PropertySet,
    ) -> HubResult<()> {
        let signature = self.device_signature(identity)?;
        let url = self.url(
            &identity.registration.assigned_endpoint,
            &format!("/devices/{}/twin/properties/reported", identity.registration.assigned_device_id),
        );

        let response = self
            .http_client
            .patch(&url)
            .header(reqwest::header::AUTHORIZATION, signature.token())
            .json(patch)
            .send()
            .await
            .map_err(transport_error)?;

        check_response(response, &identity.device_id, None).await?;
        Ok(())
    }

    async fn update_desired(
        &self,
        identity: &DeviceIdentity,
        patch: &PropertySet,
        etag: &str,
    ) -> HubResult<()> {
        let (host, signature) = self.service_signature()?;
        let url = self.url(&host, &format!("/twins/{}", identity.registration.assigned_device_id));

        let response = self
            .http_client
            .patch(&url)
            .header(reqwest::header::AUTHORIZATION, signature.token())
            .header(reqwest::header::IF_MATCH, etag)
            .json(&json!({ "properties": { "desired": patch } }))
            .send()
            .await
            .map_err(transport_error)?;

        check_response(response, &identity.device_id, Some(etag)).await?;
        Ok(())
    }
}

// =============================================================================
// RESPONSE HANDLING
// =============================================================================

pub(crate) fn transport_error(err: reqwest::Error) -> HubError {
    HubError::Transport(err.to_string())
}

/// Map a non-success response onto [`HubError`].
///
/// 404 means the device is not registered; 412 means `etag` was stale.
pub(crate) async fn check_response(
    response: reqwest::Response,
    device_id: &str,
    etag: Option<&str>,
) -> HubResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    warn!(device_id = %device_id, status = %status, "Hub call failed");

    Err(classify_status(status, device_id, etag, body))
}

fn classify_status(status: StatusCode, device_id: &str, etag: Option<&str>, body: String) -> HubError {
    if status == StatusCode::NOT_FOUND {
        return HubError::DeviceNotFound(device_id.to_string());
    }

    match etag {
        Some(etag) if status == StatusCode::PRECONDITION_FAILED => HubError::PreconditionFailed {
            etag: etag.to_string(),
        },
        _ => HubError::Status {
            status: status.as_u16(),
            body,
        },
    }
}
