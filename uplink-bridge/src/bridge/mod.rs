//! # Bridge Orchestrator
//!
//! Drives one inbound message through the pipeline:
//!
//! ```text
//! validate ─► resolve identity ─► send telemetry ─► sync twin ─► done
//! ```
//!
//! Validation failures are returned before any collaborator is contacted.
//! When a downstream call reports the device as unknown, the cached
//! identity is evicted so the next message re-provisions it.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};

use shared::{
    config::{BridgeConfig, ValidationConfig},
    constants::is_valid_device_id,
    error::{BridgeError, BridgeResult},
    types::*,
};

use crate::cache::RegistrationCache;
use crate::hub::{HttpIotHub, TelemetryGateway, TwinRegistry};
use crate::identity::IdentityResolver;
use crate::provisioning::{HttpProvisioningClient, ProvisioningService};
use crate::telemetry::TelemetryForwarder;
use crate::twin::TwinSynchronizer;

/// Naive layouts accepted for `timestamp`, read as UTC
const NAIVE_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

// =============================================================================
// VALIDATION
// =============================================================================

/// An inbound message that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedMessage {
    pub device_id: String,
    pub measurements: MeasurementSet,
    pub reported: Option<PropertySet>,
    pub desired: Option<PropertySet>,
    /// Normalized to RFC 3339 with millisecond precision
    pub timestamp: Option<String>,
}

/// Parse a caller-supplied timestamp.
///
/// Accepts RFC 3339, RFC 2822, naive date-times (read as UTC) and plain
/// dates (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
}

fn property_set(value: Option<Value>, field: &str) -> BridgeResult<Option<PropertySet>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(BridgeError::Validation(format!("{} must be an object", field))),
    }
}

/// Validate an inbound message without side effects
pub fn validate_message(
    message: UplinkMessage,
    config: &ValidationConfig,
) -> BridgeResult<ValidatedMessage> {
    let device_id = match message.device {
        None | Some(Value::Null) => {
            return Err(BridgeError::Validation("a device specification is required".into()))
        }
        Some(Value::Object(mut device)) => match device.remove("deviceId") {
            Some(Value::String(id)) if is_valid_device_id(&id) => id,
            _ => {
                return Err(BridgeError::Validation(
                    "deviceId must be non-empty and contain only alphanumerics, '-' and '_'".into(),
                ))
            }
        },
        Some(_) => return Err(BridgeError::Validation("device must be an object".into())),
    };

    let measurements = match message.measurements {
        Some(Value::Object(map)) => MeasurementSet(map),
        _ => {
            return Err(BridgeError::Validation(
                "measurements must be an object of field to value".into(),
            ))
        }
    };

    if config.strict_measurements {
        let untyped = measurements.untyped_fields();
        if !untyped.is_empty() {
            return Err(BridgeError::Validation(format!(
                "unsupported measurement values for: {}",
                untyped.join(", ")
            )));
        }
    }

    let reported = property_set(message.reported_properties, "reportedProperties")?;
    let desired = property_set(message.desired_properties, "desiredProperties")?;

    let invalid_timestamp = || {
        BridgeError::Validation("timestamp must be a date-time, e.g. 2024-01-31T12:00:00.000Z".into())
    };
    let timestamp = match message.timestamp {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) if raw.is_empty() => None,
        Some(Value::String(raw)) => {
            let parsed = parse_timestamp(&raw).ok_or_else(invalid_timestamp)?;
            Some(parsed.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        Some(_) => return Err(invalid_timestamp()),
    };

    Ok(ValidatedMessage {
        device_id,
        measurements,
        reported,
        desired,
        timestamp,
    })
}

// =============================================================================
// BRIDGE
// =============================================================================

/// Processes inbound messages end to end
pub struct Bridge {
    resolver: IdentityResolver,
    telemetry: TelemetryForwarder,
    twins: TwinSynchronizer,
    validation: ValidationConfig,
}

impl Bridge {
    /// Build a bridge talking to the real provisioning service and hub
    pub fn from_config(config: &BridgeConfig) -> BridgeResult<Self> {
        let hub = Arc::new(HttpIotHub::new(
            config.service_connection.clone(),
            config.signature.clone(),
        ));
        let provisioning = Arc::new(HttpProvisioningClient::new(config.provisioning.clone()));

        Self::with_collaborators(config, provisioning, hub.clone(), hub)
    }

    /// Build a bridge over explicit collaborators
    pub fn with_collaborators(
        config: &BridgeConfig,
        provisioning: Arc<dyn ProvisioningService>,
        gateway: Arc<dyn TelemetryGateway>,
        registry: Arc<dyn TwinRegistry>,
    ) -> BridgeResult<Self> {
        let group_key = config.group_key_bytes()?;
        let cache = Arc::new(RegistrationCache::new(&config.cache));

        Ok(Self {
            resolver: IdentityResolver::new(cache, provisioning, group_key, config.id_scope.clone()),
            telemetry: TelemetryForwarder::new(gateway, &config.signature),
            twins: TwinSynchronizer::new(registry),
            validation: config.validation.clone(),
        })
    }

    /// Registration cache shared by every request
    pub fn cache(&self) -> &Arc<RegistrationCache> {
        self.resolver.cache()
    }

    /// Process one inbound message
    pub async fn handle_message(&self, message: UplinkMessage) -> BridgeResult<BridgeOutcome> {
        let validated = match validate_message(message, &self.validation) {
            Ok(validated) => validated,
            Err(err) => {
                info!(error = %err, "Rejected invalid message");
                return Err(err);
            }
        };

        let mut stage = BridgeStage::Validated;
        let mut identity = None;
        debug!(device_id = %validated.device_id, stage = %stage, "Message validated");

        let result = self.process(&validated, &mut stage, &mut identity).await;

        if let Err(ref err) = result {
            error!(
                device_id = %validated.device_id,
                stage = %stage,
                kind = err.category(),
                error = %err,
                "Bridge request failed"
            );
            // Only a resolved identity can be rejected downstream
            if let Some(identity) = identity.as_ref().filter(|_| err.is_unknown_device()) {
                self.resolver.invalidate_identity(identity).await;
            }
        }

        result
    }

    async fn process(
        &self,
        message: &ValidatedMessage,
        stage: &mut BridgeStage,
        resolved: &mut Option<Arc<DeviceIdentity>>,
    ) -> BridgeResult<BridgeOutcome> {
        let identity = self.resolver.resolve_identity(&message.device_id).await?;
        *resolved = Some(Arc::clone(&identity));
        *stage = BridgeStage::IdentityResolved;
        debug!(device_id = %message.device_id, stage = %stage, "Identity resolved");

        self.telemetry
            .send_telemetry(&identity, &message.measurements, message.timestamp.as_deref())
            .await?;
        *stage = BridgeStage::TelemetrySent;

        let twin = if message.reported.is_some() || message.desired.is_some() {
            let report = self
                .twins
                .diff_and_apply(&identity, message.reported.as_ref(), message.desired.as_ref())
                .await?;
            *stage = BridgeStage::TwinSynced;
            debug!(device_id = %message.device_id, stage = %stage, "Twin synchronized");
            Some(report)
        } else {
            None
        };

        *stage = BridgeStage::Completed;
        info!(device_id = %message.device_id, "Message bridged");

        Ok(BridgeOutcome {
            device_id: message.device_id.clone(),
            stage: *stage,
            telemetry_sent: true,
            twin,
        })
    }
}
