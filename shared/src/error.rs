//! # Error Types for the Uplink Bridge
//!
//! Two layers of errors:
//! - [`HubError`]: what a collaborator (provisioning service, telemetry
//!   gateway, twin registry) reports for a single call.
//! - [`BridgeError`]: what the bridge surfaces to its caller, always
//!   carrying the device the failure belongs to.

use thiserror::Error;

// =============================================================================
// COLLABORATOR ERRORS
// =============================================================================

/// Failure reported by an external collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The device is not registered with the collaborator
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// A conditional write was rejected because the ETag no longer matches
    #[error("precondition failed: etag '{etag}' is stale")]
    PreconditionFailed { etag: String },

    /// Non-success HTTP status
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// The collaborator answered but refused the request
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Connection, TLS or timeout failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Request or response body could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Serialization(err.to_string())
    }
}

/// Result type alias for collaborator calls
pub type HubResult<T> = Result<T, HubError>;

// =============================================================================
// BRIDGE ERRORS
// =============================================================================

/// Main error type surfaced by the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Malformed input; no collaborator was contacted
    #[error("Invalid format: {0}")]
    Validation(String),

    /// The provisioning service could not bind the device
    #[error("Provisioning failed for device '{device_id}': {cause}")]
    Provisioning {
        device_id: String,
        #[source]
        cause: HubError,
    },

    /// Telemetry could not be delivered
    #[error("Unable to send telemetry for device '{device_id}': {cause}")]
    TelemetryForward {
        device_id: String,
        #[source]
        cause: HubError,
    },

    /// The remote twin could not be fetched
    #[error("Unable to fetch twin for device '{device_id}': {cause}")]
    TwinFetch {
        device_id: String,
        #[source]
        cause: HubError,
    },

    /// A reported or desired twin write failed, including ETag conflicts
    #[error("Unable to update twin for device '{device_id}': {cause}")]
    TwinUpdate {
        device_id: String,
        #[source]
        cause: HubError,
    },

    /// A downstream call rejected the device as not registered
    #[error("Device '{device_id}' is unknown to the hub (during {operation}): {cause}")]
    UnknownDevice {
        device_id: String,
        operation: &'static str,
        #[source]
        cause: HubError,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Missing required environment variable
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using BridgeError
pub type BridgeResult<T> = Result<T, BridgeError>;

impl From<base64::DecodeError> for BridgeError {
    fn from(err: base64::DecodeError) -> Self {
        BridgeError::Configuration(format!("invalid base64 key: {}", err))
    }
}

// =============================================================================
// CLASSIFICATION
// =============================================================================

impl BridgeError {
    /// Wraps a collaborator failure from `operation`, classifying
    /// `DeviceNotFound` as [`BridgeError::UnknownDevice`] and everything
    /// else with `wrap`.
    pub fn from_hub(
        device_id: &str,
        operation: &'static str,
        cause: HubError,
        wrap: fn(String, HubError) -> BridgeError,
    ) -> Self {
        match cause {
            cause @ HubError::DeviceNotFound(_) => BridgeError::UnknownDevice {
                device_id: device_id.to_string(),
                operation,
                cause,
            },
            other => wrap(device_id.to_string(), other),
        }
    }

    /// Get the error kind for logging and for the API response body
    pub fn category(&self) -> &'static str {
        match self {
            BridgeError::Validation(_) => "validation",
            BridgeError::Provisioning { .. } => "provisioning",
            BridgeError::TelemetryForward { .. } => "telemetry_forward",
            BridgeError::TwinFetch { .. } => "twin_fetch",
            BridgeError::TwinUpdate { .. } => "twin_update",
            BridgeError::UnknownDevice { .. } => "unknown_device",
            BridgeError::Configuration(_) | BridgeError::MissingEnvVar(_) => "config",
            BridgeError::Internal(_) => "internal",
        }
    }

    /// Device the failure belongs to, if any
    pub fn device_id(&self) -> Option<&str> {
        match self {
            BridgeError::Provisioning { device_id, .. }
            | BridgeError::TelemetryForward { device_id, .. }
            | BridgeError::TwinFetch { device_id, .. }
            | BridgeError::TwinUpdate { device_id, .. }
            | BridgeError::UnknownDevice { device_id, .. } => Some(device_id),
            _ => None,
        }
    }

    /// True if a downstream call rejected the device as not registered
    pub fn is_unknown_device(&self) -> bool {
        matches!(self, BridgeError::UnknownDevice { .. })
    }

    /// True if a desired write lost an optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BridgeError::TwinUpdate {
                cause: HubError::PreconditionFailed { .. },
                ..
            }
        )
    }
}
