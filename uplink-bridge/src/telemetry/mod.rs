//! Telemetry forwarding.
//!
//! Every send mints a fresh access signature from the cached identity and
//! hands the measurements to the [`TelemetryGateway`] unchanged.

use std::sync::Arc;
use tracing::{debug, info};

use shared::{
    config::SignatureConfig,
    error::{BridgeError, BridgeResult},
    types::{DeviceIdentity, MeasurementSet, TelemetryMessage},
};

use crate::hub::TelemetryGateway;
use crate::signature::generate_access_signature;

/// Forwards device measurements to the assigned hub
pub struct TelemetryForwarder {
    gateway: Arc<dyn TelemetryGateway>,
    expiry_secs: u64,
}

impl TelemetryForwarder {
    pub fn new(gateway: Arc<dyn TelemetryGateway>, config: &SignatureConfig) -> Self {
        Self {
            gateway,
            expiry_secs: config.expiry_secs,
        }
    }

    /// Send `measurements` as one telemetry message.
    ///
    /// `creation_time` is forwarded as the creation-time property when set.
    pub async fn send_telemetry(
        &self,
        identity: &DeviceIdentity,
        measurements: &MeasurementSet,
        creation_time: Option<&str>,
    ) -> BridgeResult<()> {
        let signature = generate_access_signature(identity, self.expiry_secs)?;

        let message = TelemetryMessage {
            body: measurements.clone(),
            creation_time_utc: creation_time.map(str::to_string),
        };

        debug!(
            device_id = %identity.device_id,
            fields = measurements.len(),
            "Forwarding telemetry"
        );

        self.gateway
            .send_event(identity, &signature, &message)
            .await
            .map_err(|cause| {
                BridgeError::from_hub(&identity.device_id, "telemetry", cause, |device_id, cause| {
                    BridgeError::TelemetryForward { device_id, cause }
                })
            })?;

        info!(device_id = %identity.device_id, "Telemetry sent");
        Ok(())
    }
}
