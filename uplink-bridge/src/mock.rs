//! In-memory collaborators recording every call, for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use shared::{
    error::{HubError, HubResult},
    types::*,
};

use crate::hub::{TelemetryGateway, TwinRegistry};
use crate::keys::derive_key;
use crate::provisioning::ProvisioningService;
use crate::signature::AccessSignature;

pub(crate) const GROUP_KEY: &[u8] = b"test-group-enrollment-key";
pub(crate) const SCOPE_ID: &str = "0ne00000001";
pub(crate) const HUB_HOST: &str = "hub.example.net";

/// A complete identity for `device_id` on the test hub
pub(crate) fn identity_for(device_id: &str) -> DeviceIdentity {
    DeviceIdentity {
        device_id: device_id.to_string(),
        derived_key: derive_key(GROUP_KEY, device_id),
        registration: DeviceRegistration {
            assigned_endpoint: HUB_HOST.to_string(),
            assigned_device_id: device_id.to_string(),
        },
    }
}

/// Build a property set from a JSON object literal
pub(crate) fn props(value: serde_json::Value) -> PropertySet {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// Serve `router` on an ephemeral local port and return its `host:port`
pub(crate) async fn serve_stub(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    addr.to_string()
}

// =============================================================================
// PROVISIONING
// =============================================================================

pub(crate) struct MockProvisioning {
    calls: AtomicUsize,
    requests: Mutex<Vec<ProvisioningRequest>>,
    failure: Mutex<Option<HubError>>,
    delay: Option<Duration>,
}

impl MockProvisioning {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            delay: None,
        }
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    pub(crate) fn fail_with(&self, err: HubError) {
        *self.failure.lock() = Some(err);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<ProvisioningRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ProvisioningService for MockProvisioning {
    async fn register(&self, request: &ProvisioningRequest) -> HubResult<DeviceRegistration> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.failure.lock().clone() {
            return Err(err);
        }

        Ok(DeviceRegistration {
            assigned_endpoint: HUB_HOST.to_string(),
            assigned_device_id: request.device_id.clone(),
        })
    }
}

// =============================================================================
// HUB
// =============================================================================

/// Telemetry gateway and twin registry backed by one in-memory twin.
///
/// Every successful twin write bumps the ETag, like the real registry.
pub(crate) struct MockHub {
    twin: Mutex<TwinSnapshot>,
    version: AtomicUsize,

    events: Mutex<Vec<TelemetryMessage>>,
    signatures: Mutex<Vec<AccessSignature>>,
    twin_fetches: AtomicUsize,
    reported_writes: Mutex<Vec<PropertySet>>,
    desired_writes: Mutex<Vec<(PropertySet, String)>>,

    telemetry_failure: Mutex<Option<HubError>>,
    fetch_failure: Mutex<Option<HubError>>,
    reported_failure: Mutex<Option<HubError>>,
    desired_failure: Mutex<Option<HubError>>,
    telemetry_delay: Mutex<Option<Duration>>,
}

impl MockHub {
    pub(crate) fn new() -> Self {
        Self::with_twin(PropertySet::new(), PropertySet::new())
    }

    pub(crate) fn with_twin(reported: PropertySet, desired: PropertySet) -> Self {
        Self {
            twin: Mutex::new(TwinSnapshot {
                reported,
                desired,
                etag: "v1".into(),
            }),
            version: AtomicUsize::new(1),
            events: Mutex::new(Vec::new()),
            signatures: Mutex::new(Vec::new()),
            twin_fetches: AtomicUsize::new(0),
            reported_writes: Mutex::new(Vec::new()),
            desired_writes: Mutex::new(Vec::new()),
            telemetry_failure: Mutex::new(None),
            fetch_failure: Mutex::new(None),
            reported_failure: Mutex::new(None),
            desired_failure: Mutex::new(None),
            telemetry_delay: Mutex::new(None),
        }
    }

    pub(crate) fn fail_telemetry(&self, err: HubError) {
        *self.telemetry_failure.lock() = Some(err);
    }

    pub(crate) fn fail_fetch(&self, err: HubError) {
        *self.fetch_failure.lock() = Some(err);
    }

    pub(crate) fn fail_reported(&self, err: HubError) {
        *self.reported_failure.lock() = Some(err);
    }

    /// Hold every telemetry call for `delay` before answering
    pub(crate) fn delay_telemetry(&self, delay: Duration) {
        *self.telemetry_delay.lock() = Some(delay);
    }

    pub(crate) fn fail_desired(&self, err: HubError) {
        *self.desired_failure.lock() = Some(err);
    }

    pub(crate) fn events(&self) -> Vec<TelemetryMessage> {
        self.events.lock().clone()
    }

    pub(crate) fn signatures(&self) -> Vec<AccessSignature> {
        self.signatures.lock().clone()
    }

    pub(crate) fn twin_fetches(&self) -> usize {
        self.twin_fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn reported_writes(&self) -> Vec<PropertySet> {
        self.reported_writes.lock().clone()
    }

    pub(crate) fn desired_writes(&self) -> Vec<(PropertySet, String)> {
        self.desired_writes.lock().clone()
    }

    pub(crate) fn twin(&self) -> TwinSnapshot {
        self.twin.lock().clone()
    }

    fn bump_etag(&self, twin: &mut TwinSnapshot) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        twin.etag = format!("v{}", version);
    }
}

#[async_trait]
impl TelemetryGateway for MockHub {
    async fn send_event(
        &self,
        _identity: &DeviceIdentity,
        signature: &AccessSignature,
        message: &TelemetryMessage,
    ) -> HubResult<()> {
        self.signatures.lock().push(signature.clone());
        self.events.lock().push(message.clone());

        let delay = *self.telemetry_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.telemetry_failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TwinRegistry for MockHub {
    async fn get_twin(&self, _identity: &DeviceIdentity) -> HubResult<TwinSnapshot> {
        self.twin_fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self.fetch_failure.lock().clone() {
            return Err(err);
        }
        Ok(self.twin.lock().clone())
    }

    async fn update_reported(
        &self,
        _identity: &DeviceIdentity,
        patch: &PropertySet,
    ) -> HubResult<()> {
        self.reported_writes.lock().push(patch.clone());

        if let Some(err) = self.reported_failure.lock().clone() {
            return Err(err);
        }

        let mut twin = self.twin.lock();
        for (key, value) in patch {
            twin.reported.insert(key.clone(), value.clone());
        }
        self.bump_etag(&mut twin);
        Ok(())
    }

    async fn update_desired(
        &self,
        _identity: &DeviceIdentity,
        patch: &PropertySet,
        etag: &str,
    ) -> HubResult<()> {
        self.desired_writes.lock().push((patch.clone(), etag.to_string()));

        if let Some(err) = self.desired_failure.lock().clone() {
            return Err(err);
        }

        let mut twin = self.twin.lock();
        if twin.etag != etag {
            return Err(HubError::PreconditionFailed { etag: etag.to_string() });
        }
        for (key, value) in patch {
            twin.desired.insert(key.clone(), value.clone());
        }
        self.bump_etag(&mut twin);
        Ok(())
    }
}
