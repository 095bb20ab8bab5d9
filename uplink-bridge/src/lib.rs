//! # Uplink Bridge
//!
//! Bridges device messages ingested by an external pipeline into a cloud
//! device-identity and twin platform:
//! - Per-device key derivation from a group enrollment key
//! - Provisioning on first sight, with identities cached for the process
//!   lifetime
//! - Telemetry forwarding under short-lived access signatures
//! - Twin synchronization that only writes properties that changed, with
//!   ETag-conditioned desired writes
//!
//! Collaborators (provisioning service, telemetry gateway, twin registry)
//! sit behind traits so the pipeline can run against the REST clients in
//! [`provisioning`] and [`hub`] or against in-memory doubles.

pub mod api;
pub mod bridge;
pub mod cache;
pub mod hub;
pub mod identity;
pub mod keys;
pub mod provisioning;
pub mod signature;
pub mod telemetry;
pub mod twin;

#[cfg(test)]
pub(crate) mod mock;

use shared::config::BridgeConfig;

/// Application state shared across handlers
pub struct AppState {
    /// Configuration
    pub config: BridgeConfig,
    /// Message pipeline
    pub bridge: bridge::Bridge,
    /// Request counters
    pub metrics: api::RequestMetrics,
}

impl AppState {
    pub fn new(config: BridgeConfig, bridge: bridge::Bridge) -> Self {
        Self {
            config,
            bridge,
            metrics: api::RequestMetrics::default(),
        }
    }
}
