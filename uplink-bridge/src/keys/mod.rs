//! # Device Key Derivation
//!
//! Every device key is derived from the group enrollment key:
//! `base64(HMAC-SHA256(group_key, device_id))`. Derivation is pure and
//! cheap; caching belongs to the registration cache.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use shared::types::DerivedKey;

pub(crate) type HmacSha256 = Hmac<Sha256>;

/// Derive the per-device key from the raw group key bytes
pub fn derive_key(group_key: &[u8], device_id: &str) -> DerivedKey {
    let digest = hmac_sha256(group_key, device_id.as_bytes());
    DerivedKey::from_base64(base64::engine::general_purpose::STANDARD.encode(digest))
}

/// HMAC-SHA256 of `message` under `key`
pub(crate) fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);

    let mut digest = [0u8; 32];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    digest
}
