//! # Twin Synchronization
//!
//! Diffs incoming reported/desired property sets against the live twin and
//! writes only what changed.
//!
//! ## Write rules
//!
//! - **Reported**: written whole (last-write-wins) when any incoming key is
//!   missing from, or differs from, the remote reported set.
//! - **Desired**: written whole, conditioned on the twin ETag, when any
//!   incoming key
//!   1. differs from (or is missing in) the remote desired set, or
//!   2. differs from (or is missing in) the reported set of the same
//!      request. A desired value the device has not yet acknowledged is
//!      re-asserted.
//!
//! A stale ETag surfaces as a conflict and is never retried here.
//!
//! Values are compared structurally with type awareness: `"1"` and `1`
//! differ, while `1` and `1.0` are equal.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use shared::{
    error::{BridgeError, BridgeResult, HubError},
    types::{DeviceIdentity, PropertySet, TwinSnapshot, TwinSyncReport},
};

use crate::hub::TwinRegistry;

// =============================================================================
// DIFF
// =============================================================================

/// Type-aware structural equality
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if x == y {
                return true;
            }
            // Integers compare exactly; only fall back to f64 when a float is involved
            (x.is_f64() || y.is_f64())
                && matches!((x.as_f64(), y.as_f64()), (Some(p), Some(q)) if p == q)
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_equal(p, q))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, p)| y.get(key).map_or(false, |q| values_equal(p, q)))
        }
        _ => a == b,
    }
}

fn differs(key: &str, value: &Value, other: &PropertySet) -> bool {
    other.get(key).map_or(true, |remote| !values_equal(value, remote))
}

/// True if any incoming reported key is missing from or differs from `remote`
pub fn reported_needs_update(incoming: &PropertySet, remote: &PropertySet) -> bool {
    incoming
        .iter()
        .any(|(key, value)| differs(key, value, remote))
}

/// True if any incoming desired key differs from the remote desired set,
/// or from the reported set carried by the same request
pub fn desired_needs_update(
    incoming: &PropertySet,
    remote_desired: &PropertySet,
    incoming_reported: &PropertySet,
) -> bool {
    incoming.iter().any(|(key, value)| {
        differs(key, value, remote_desired) || differs(key, value, incoming_reported)
    })
}

// =============================================================================
// SYNCHRONIZER
// =============================================================================

/// Applies property diffs to a device twin
pub struct TwinSynchronizer {
    registry: Arc<dyn TwinRegistry>,
}

impl TwinSynchronizer {
    pub fn new(registry: Arc<dyn TwinRegistry>) -> Self {
        Self { registry }
    }

    /// Fetch the live twin
    pub async fn fetch_remote_twin(&self, identity: &DeviceIdentity) -> BridgeResult<TwinSnapshot> {
        self.registry.get_twin(identity).await.map_err(|cause| {
            BridgeError::from_hub(&identity.device_id, "twin fetch", cause, |device_id, cause| {
                BridgeError::TwinFetch { device_id, cause }
            })
        })
    }

    /// Diff `reported` and `desired` against the live twin and issue the
    /// writes that are needed
    pub async fn diff_and_apply(
        &self,
        identity: &DeviceIdentity,
        reported: Option<&PropertySet>,
        desired: Option<&PropertySet>,
    ) -> BridgeResult<TwinSyncReport> {
        let mut report = TwinSyncReport::default();
        if reported.is_none() && desired.is_none() {
            return Ok(report);
        }

        let snapshot = self.fetch_remote_twin(identity).await?;

        if let Some(reported) = reported {
            if reported_needs_update(reported, &snapshot.reported) {
                self.registry
                    .update_reported(identity, reported)
                    .await
                    .map_err(|cause| update_error(identity, cause))?;
                report.reported_updated = true;
                info!(device_id = %identity.device_id, keys = reported.len(), "Reported properties updated");
            } else {
                debug!(device_id = %identity.device_id, "Reported properties already in sync");
            }
        }

        if let Some(desired) = desired {
            let empty = PropertySet::new();
            let incoming_reported = reported.unwrap_or(&empty);

            if desired_needs_update(desired, &snapshot.desired, incoming_reported) {
                // A reported write moves the ETag
                let etag = if report.reported_updated {
                    self.fetch_remote_twin(identity).await?.etag
                } else {
                    snapshot.etag
                };

                self.registry
                    .update_desired(identity, desired, &etag)
                    .await
                    .map_err(|cause| update_error(identity, cause))?;
                report.desired_updated = true;
                info!(device_id = %identity.device_id, keys = desired.len(), "Desired properties updated");
            } else {
                debug!(device_id = %identity.device_id, "Desired properties already in sync");
            }
        }

        Ok(report)
    }
}

fn update_error(identity: &DeviceIdentity, cause: HubError) -> BridgeError {
    if let HubError::PreconditionFailed { ref etag } = cause {
        warn!(device_id = %identity.device_id, etag = %etag, "Twin changed concurrently, desired write rejected");
    }
    BridgeError::from_hub(&identity.device_id, "twin update", cause, |device_id, cause| {
        BridgeError::TwinUpdate { device_id, cause }
    })
}
