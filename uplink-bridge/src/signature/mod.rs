//! # Access Signature Generator
//!
//! Produces short-lived tokens authorizing a single resource:
//!
//! ```text
//! SharedAccessSignature sr={resource}&sig={signature}&se={expiry}[&skn={key name}]
//! ```
//!
//! where `signature = urlencode(base64(HMAC-SHA256(key, resource + "\n" + expiry)))`
//! and `resource` is the URL-encoded resource id.
//!
//! Tokens are minted fresh for every call and never cached; only the
//! identity they are derived from is.

use base64::Engine;
use chrono::Utc;
use tracing::debug;

use shared::{
    constants::SIGNATURE_TOKEN_PREFIX,
    error::{BridgeError, BridgeResult},
    types::DeviceIdentity,
};

use crate::keys::hmac_sha256;

/// A signed, expiring authorization for one resource
#[derive(Clone, PartialEq, Eq)]
pub struct AccessSignature {
    /// URL-encoded resource id
    resource: String,
    /// URL-encoded base64 HMAC
    signature: String,
    /// Expiry as seconds since the Unix epoch
    expiry: i64,
    /// Shared access policy name, for policy-scoped keys
    key_name: Option<String>,
}

impl AccessSignature {
    /// Render the token as sent in the `Authorization` header
    pub fn token(&self) -> String {
        let mut token = format!(
            "{} sr={}&sig={}&se={}",
            SIGNATURE_TOKEN_PREFIX, self.resource, self.signature, self.expiry
        );
        if let Some(ref key_name) = self.key_name {
            token.push_str("&skn=");
            token.push_str(key_name);
        }
        token
    }

    /// URL-encoded resource id this token is scoped to
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Expiry as seconds since the Unix epoch
    pub fn expiry(&self) -> i64 {
        self.expiry
    }
}

impl std::fmt::Debug for AccessSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessSignature")
            .field("resource", &self.resource)
            .field("expiry", &self.expiry)
            .field("key_name", &self.key_name)
            .finish_non_exhaustive()
    }
}

/// Generate a device access signature valid for `expiry_secs` from now
pub fn generate_access_signature(
    identity: &DeviceIdentity,
    expiry_secs: u64,
) -> BridgeResult<AccessSignature> {
    let expiry = Utc::now().timestamp() + expiry_secs as i64;
    generate_access_signature_at(identity, expiry)
}

/// Generate a device access signature expiring at `expiry` (Unix seconds)
pub fn generate_access_signature_at(
    identity: &DeviceIdentity,
    expiry: i64,
) -> BridgeResult<AccessSignature> {
    let key = identity.derived_key.to_bytes().map_err(|e| {
        BridgeError::Internal(format!(
            "derived key for '{}' is not valid base64: {}",
            identity.device_id, e
        ))
    })?;

    debug!(device_id = %identity.device_id, expiry = expiry, "Generating access signature");

    Ok(sign_resource(&identity.resource_id(), &key, expiry, None))
}

/// Sign an arbitrary resource with a raw key
pub fn sign_resource(
    resource_id: &str,
    key: &[u8],
    expiry: i64,
    key_name: Option<&str>,
) -> AccessSignature {
    let resource = urlencoding::encode(resource_id).into_owned();
    let to_sign = format!("{}\n{}", resource, expiry);

    let digest = hmac_sha256(key, to_sign.as_bytes());
    let signature_base64 = base64::engine::general_purpose::STANDARD.encode(digest);

    AccessSignature {
        resource,
        signature: urlencoding::encode(&signature_base64).into_owned(),
        expiry,
        key_name: key_name.map(str::to_string),
    }
}
