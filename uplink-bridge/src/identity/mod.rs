//! # Identity Resolution
//!
//! Resolves a device id to a complete [`DeviceIdentity`]:
//!
//! 1. Cache hit → return it, no network call
//! 2. Cache miss → derive the device key, provision the device, cache
//!    the composed identity
//!
//! Provisioning for one device id is never run twice concurrently.

use std::sync::Arc;
use tracing::debug;

use shared::{
    error::{BridgeError, BridgeResult, HubResult},
    types::{DeviceIdentity, ProvisioningRequest},
};

use crate::cache::RegistrationCache;
use crate::keys::derive_key;
use crate::provisioning::ProvisioningService;

/// Resolves and caches device identities
pub struct IdentityResolver {
    /// Shared registration cache
    cache: Arc<RegistrationCache>,

    /// Provisioning collaborator
    provisioning: Arc<dyn ProvisioningService>,

    /// Raw group enrollment key
    group_key: Vec<u8>,

    /// Provisioning scope id
    scope_id: String,
}

impl IdentityResolver {
    /// Create a new IdentityResolver
    pub fn new(
        cache: Arc<RegistrationCache>,
        provisioning: Arc<dyn ProvisioningService>,
        group_key: Vec<u8>,
        scope_id: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            provisioning,
            group_key,
            scope_id: scope_id.into(),
        }
    }

    /// Resolve `device_id`, provisioning it on first use
    pub async fn resolve_identity(&self, device_id: &str) -> BridgeResult<Arc<DeviceIdentity>> {
        self.cache
            .get_or_provision(device_id, self.provision(device_id))
            .await
            .map_err(|cause| BridgeError::Provisioning {
                device_id: device_id.to_string(),
                cause,
            })
    }

    /// Forget `device_id` so the next resolution re-provisions it
    pub async fn invalidate(&self, device_id: &str) {
        self.cache.invalidate(device_id).await;
    }

    /// Forget `identity` if it is still the cached one for its device
    pub async fn invalidate_identity(&self, identity: &Arc<DeviceIdentity>) -> bool {
        self.cache.invalidate_identity(identity).await
    }

    /// Shared registration cache
    pub fn cache(&self) -> &Arc<RegistrationCache> {
        &self.cache
    }

    async fn provision(&self, device_id: &str) -> HubResult<DeviceIdentity> {
        let derived_key = derive_key(&self.group_key, device_id);
        let request = ProvisioningRequest {
            device_id: device_id.to_string(),
            derived_key: derived_key.clone(),
            scope_id: self.scope_id.clone(),
        };

        let registration = self.provisioning.register(&request).await?;
        debug!(
            device_id = %device_id,
            assigned_endpoint = %registration.assigned_endpoint,
            "Device registration resolved"
        );

        Ok(DeviceIdentity {
            device_id: device_id.to_string(),
            derived_key,
            registration,
        })
    }
}
