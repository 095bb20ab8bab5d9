//! # Shared Data Types for the Uplink Bridge
//!
//! Inbound message shape, device identities, twin state and the outcome
//! returned to callers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Arbitrary structured properties (reported or desired), keyed by field name
pub type PropertySet = Map<String, Value>;

// =============================================================================
// INBOUND MESSAGE
// =============================================================================

/// Inbound message as delivered by the upstream ingestion pipeline.
///
/// Fields are kept loosely typed so that shape errors surface as
/// validation failures instead of deserialization failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkMessage {
    /// Device specification, expected as `{"deviceId": "..."}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurements: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_properties: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_properties: Option<Value>,

    /// Optional creation time of the measurements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

impl UplinkMessage {
    /// Message for `device_id` carrying `measurements` and nothing else
    pub fn new(device_id: &str, measurements: Value) -> Self {
        Self {
            device: Some(serde_json::json!({ "deviceId": device_id })),
            measurements: Some(measurements),
            ..Default::default()
        }
    }
}

// =============================================================================
// MEASUREMENTS
// =============================================================================

/// Mapping of field name to measured value
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct MeasurementSet(pub Map<String, Value>);

impl MeasurementSet {
    /// Number of measured fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no field was measured
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over fields with their classified value
    pub fn iter(&self) -> impl Iterator<Item = (&str, Measurement)> + '_ {
        self.0
            .iter()
            .map(|(field, value)| (field.as_str(), Measurement::classify(value)))
    }

    /// Fields whose value is neither a number, a string nor a location
    pub fn untyped_fields(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, m)| matches!(m, Measurement::Other(_)))
            .map(|(field, _)| field)
            .collect()
    }
}

/// A single measured value
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement<'a> {
    Number(f64),
    Text(&'a str),
    Location(Location),
    Other(&'a Value),
}

impl<'a> Measurement<'a> {
    /// Classify a raw JSON value
    pub fn classify(value: &'a Value) -> Self {
        match value {
            Value::Number(n) => n
                .as_f64()
                .map(Measurement::Number)
                .unwrap_or(Measurement::Other(value)),
            Value::String(s) => Measurement::Text(s),
            Value::Object(_) => Location::from_value(value)
                .map(Measurement::Location)
                .unwrap_or(Measurement::Other(value)),
            _ => Measurement::Other(value),
        }
    }
}

/// Geographic position measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outdated: Option<bool>,
}

impl Location {
    /// Parse a location object: `lat` and `lon` must be numbers, `alt`
    /// must be numeric when present.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let lat = object.get("lat")?.as_f64()?;
        let lon = object.get("lon")?.as_f64()?;
        let alt = match object.get("alt") {
            None => None,
            Some(alt) => Some(alt.as_f64()?),
        };
        let outdated = object.get("outdated").and_then(Value::as_bool);

        Some(Self { lat, lon, alt, outdated })
    }
}

// =============================================================================
// DEVICE IDENTITY
// =============================================================================

/// Per-device secret derived from the group key, base64 encoded.
///
/// `Debug` never prints the key material.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKey(String);

impl DerivedKey {
    /// Wrap an already base64-encoded key
    pub fn from_base64(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Base64 form, as handed to the provisioning service
    pub fn as_base64(&self) -> &str {
        &self.0
    }

    /// Raw key bytes, used as the HMAC key when signing
    pub fn to_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.decode(&self.0)
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Endpoint binding returned by the provisioning service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    /// Host name of the assigned service
    pub assigned_endpoint: String,
    /// Device id as known to the assigned service
    pub assigned_device_id: String,
}

/// A resolved device identity: derived key plus its registration.
///
/// Only ever built complete; the registration cache never exposes a
/// key without its registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub derived_key: DerivedKey,
    pub registration: DeviceRegistration,
}

impl DeviceIdentity {
    /// Resource the device's access signatures are scoped to
    pub fn resource_id(&self) -> String {
        format!(
            "{}/{}",
            self.registration.assigned_endpoint, self.registration.assigned_device_id
        )
    }
}

/// Request sent to the provisioning service
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    pub device_id: String,
    pub derived_key: DerivedKey,
    pub scope_id: String,
}

// =============================================================================
// TELEMETRY & TWIN
// =============================================================================

/// Telemetry message handed to the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub body: MeasurementSet,
    /// Creation time supplied by the caller, forwarded as a message property
    pub creation_time_utc: Option<String>,
}

/// Remote twin state, fetched per synchronization and never cached
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinSnapshot {
    #[serde(default)]
    pub reported: PropertySet,
    #[serde(default)]
    pub desired: PropertySet,
    #[serde(default)]
    pub etag: String,
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Progress of a single bridge request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStage {
    Validated,
    IdentityResolved,
    TelemetrySent,
    TwinSynced,
    Completed,
}

impl std::fmt::Display for BridgeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BridgeStage::Validated => "validated",
            BridgeStage::IdentityResolved => "identity_resolved",
            BridgeStage::TelemetrySent => "telemetry_sent",
            BridgeStage::TwinSynced => "twin_synced",
            BridgeStage::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Which twin writes a synchronization issued
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwinSyncReport {
    pub reported_updated: bool,
    pub desired_updated: bool,
}

/// Successful outcome of one bridge request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeOutcome {
    pub device_id: String,
    pub stage: BridgeStage,
    pub telemetry_sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub twin: Option<TwinSyncReport>,
}

/// Error body returned by the bridge API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uplink_message_deserialization() {
        let msg: UplinkMessage = serde_json::from_value(json!({
            "device": { "deviceId": "dev-1" },
            "measurements": { "temperature": 21.5 },
            "desiredProperties": { "mode": "alert" },
            "timestamp": "2024-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(msg.device.unwrap()["deviceId"], "dev-1");
        assert!(msg.measurements.unwrap().is_object());
        assert!(msg.reported_properties.is_none());
        assert_eq!(msg.desired_properties.unwrap()["mode"], "alert");
    }

    #[test]
    fn test_uplink_message_accepts_mistyped_fields() {
        let msg: UplinkMessage = serde_json::from_value(json!({
            "device": "dev-1",
            "measurements": [1, 2],
            "timestamp": 1700000000
        }))
        .unwrap();

        assert_eq!(msg.device, Some(json!("dev-1")));
        assert_eq!(msg.timestamp, Some(json!(1700000000)));

        let msg = UplinkMessage::new("dev-1", json!({ "t": 1 }));
        assert_eq!(serde_json::to_value(&msg).unwrap(), json!({
            "device": { "deviceId": "dev-1" },
            "measurements": { "t": 1 }
        }));
    }

    #[test]
    fn test_measurement_classification() {
        let set: MeasurementSet = serde_json::from_value(json!({
            "temperature": 21.5,
            "status": "ok",
            "position": { "lat": 47.6, "lon": -122.1, "alt": 12 },
            "flags": [1, 2]
        }))
        .unwrap();

        assert_eq!(set.len(), 4);
        assert_eq!(set.untyped_fields(), vec!["flags"]);

        let position = set.iter().find(|(f, _)| *f == "position").unwrap().1;
        match position {
            Measurement::Location(loc) => assert_eq!(loc.alt, Some(12.0)),
            other => panic!("expected location, got {:?}", other),
        }
    }

    #[test]
    fn test_location_rejects_non_numeric_alt() {
        assert!(Location::from_value(&json!({ "lat": 1, "lon": 2, "alt": "high" })).is_none());
        assert!(Location::from_value(&json!({ "lat": 1 })).is_none());
        assert!(Location::from_value(&json!({ "lat": 1, "lon": 2, "outdated": true })).is_some());
    }

    #[test]
    fn test_derived_key_debug_is_redacted() {
        let key = DerivedKey::from_base64("c2VjcmV0");
        assert_eq!(format!("{:?}", key), "DerivedKey(<redacted>)");
        assert_eq!(key.to_bytes().unwrap(), b"secret");
    }

    #[test]
    fn test_resource_id() {
        let identity = DeviceIdentity {
            device_id: "dev-1".into(),
            derived_key: DerivedKey::from_base64("AAAA"),
            registration: DeviceRegistration {
                assigned_endpoint: "hub.example.net".into(),
                assigned_device_id: "dev-1".into(),
            },
        };
        assert_eq!(identity.resource_id(), "hub.example.net/dev-1");
    }
}
